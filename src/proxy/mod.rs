//! Forwarding core: backend selection, connection establishment and the
//! relay pump.

pub mod connect;
pub mod copy;
pub mod proxy_protocol;
pub mod selector;
pub mod table;
pub mod udp;

pub use selector::{Selection, SelectorInput, select_backend};
pub use table::{Host, HostState, Table, TableSet, TableSnapshot};
