//! Janus - Layer 4/7 relay and load balancer
//!
//! Core library: configuration, backend selection, the relay pump and the
//! protocol layers.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
pub mod tls;
