//! Listener, session registry and statistics.

pub mod listener;
pub mod session;
pub mod stats;
