//! Destination selection: table-based backend picking.
//!
//! Evaluated once per session; the result is cached for the session's
//! lifetime. The round-robin cursor lives on the table and persists across
//! selections, so host order advances exactly once per successful pick.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::config::DestMode;
use crate::error::RelayError;
use crate::proxy::table::Table;

/// Seed for the 32-bit fold, same initializer for every hash chain.
pub const HASH_INIT: u32 = 5381;

/// Incremental 32-bit fold over a byte buffer (h = h * 33 + b).
pub fn hash32_buf(buf: &[u8], mut p: u32) -> u32 {
    for &b in buf {
        p = p.wrapping_shl(5).wrapping_add(p).wrapping_add(b as u32);
    }
    p
}

pub fn hash32_str(s: &str, p: u32) -> u32 {
    hash32_buf(s.as_bytes(), p)
}

/// Fold a socket address (address bytes only) into the selector key.
pub fn hash32_addr(addr: IpAddr, p: u32) -> u32 {
    match addr {
        IpAddr::V4(v4) => hash32_buf(&v4.octets(), p),
        IpAddr::V6(v6) => hash32_buf(&v6.octets(), p),
    }
}

/// Stable per relay/table seed: identical configurations hash identically
/// across restarts, which keeps hash-based affinity stable.
pub fn seed_key(relay_name: &str, table_name: &str) -> u32 {
    hash32_str(table_name, hash32_str(relay_name, HASH_INIT))
}

/// Inputs the selector needs besides the table itself.
#[derive(Debug, Clone)]
pub struct SelectorInput {
    pub mode: DestMode,
    /// Client source address (source-hash and load-balance modes).
    pub client_addr: SocketAddr,
    /// The relay's own listen address (hash and load-balance modes).
    pub relay_addr: SocketAddr,
    /// Session hash key, pre-seeded and possibly folded by `hash` rules.
    pub hash_key: u32,
    /// Backend port the session will connect to.
    pub port: u16,
}

/// A resolved backend target plus the retry budget granted by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub target: SocketAddr,
    pub retry: u32,
}

/// Pick a backend host from `table` (falling back to `backup` when the
/// primary is down), honoring the configured balancing mode.
pub fn select_backend(
    table: &Arc<Table>,
    backup: Option<&Arc<Table>>,
    input: &SelectorInput,
) -> Result<Selection, RelayError> {
    let mut chosen = table;
    let mut snap = table.load();
    if !snap.is_up() {
        match backup {
            Some(b) if b.load().is_up() => {
                chosen = b;
                snap = b.load();
            }
            _ => {
                debug!(table = %table.name, "no active hosts");
                return Err(RelayError::NoActiveHosts);
            }
        }
    }

    let nhosts = snap.hosts.len();
    if nhosts == 0 {
        return Err(RelayError::NoActiveHosts);
    }

    let mut p = input.hash_key;
    let start = match input.mode {
        DestMode::RoundRobin => {
            let cursor = chosen.rr_cursor() as usize;
            if cursor >= nhosts { 0 } else { cursor }
        }
        DestMode::Random => rand::thread_rng().gen_range(0..nhosts),
        DestMode::SourceHash => {
            p = hash32_addr(input.client_addr.ip(), p);
            p as usize % nhosts
        }
        DestMode::Hash => {
            p = hash32_addr(input.relay_addr.ip(), p);
            p = hash32_buf(&input.relay_addr.port().to_be_bytes(), p);
            p as usize % nhosts
        }
        DestMode::LoadBalance => {
            p = hash32_addr(input.client_addr.ip(), p);
            p = hash32_addr(input.relay_addr.ip(), p);
            p = hash32_buf(&input.relay_addr.port().to_be_bytes(), p);
            p as usize % nhosts
        }
    };

    // Scan forward from the selected index, wrapping once, for the first
    // host that passes the health gate.
    let host = (0..nhosts)
        .map(|off| &snap.hosts[(start + off) % nhosts])
        .find(|h| snap.host_eligible(h))
        .ok_or(RelayError::NoActiveHosts)?;

    if input.mode == DestMode::RoundRobin {
        chosen.set_rr_cursor((host.idx + 1) as u32);
    }

    debug!(
        table = %chosen.name,
        host = %host.address,
        key = format_args!("{p:#010x}"),
        idx = host.idx,
        "backend selected"
    );

    Ok(Selection {
        target: SocketAddr::new(host.address, input.port),
        retry: host.retry,
    })
}
