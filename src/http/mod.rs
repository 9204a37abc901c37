//! HTTP/1.x relay layer.
//!
//! The relay never terminates HTTP; it transforms it in flight. The layer
//! is organized into:
//!
//! - **`stream`**: incremental header/body state machine that re-emits each
//!   message as it passes through, with byte-accurate body accounting
//! - **`rules`**: the match-and-act rule tree applied to headers, paths,
//!   query arguments and cookies
//! - **`error_page`**: synthesized error documents returned to the client
//!   when a session aborts

pub mod error_page;
pub mod rules;
pub mod stream;
