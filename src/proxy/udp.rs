//! Transaction-keyed UDP relay for DNS.
//!
//! Each query becomes one pending transaction: the client's id is swapped
//! for a fresh random id before the packet goes to the selected backend,
//! and the response is matched on that id plus the backend address before
//! the original id is restored. Stale transactions age out on a sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::proxy::selector::{SelectorInput, select_backend};
use crate::proxy::table::Table;
use crate::server::stats::RelayStats;

/// DNS header is 12 bytes; anything shorter is dropped.
const DNS_HEADER_LEN: usize = 12;
const MAX_PACKET: usize = 65_535;
const ID_ALLOC_ATTEMPTS: usize = 32;

pub fn transaction_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < DNS_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

pub fn set_transaction_id(packet: &mut [u8], id: u16) {
    packet[..2].copy_from_slice(&id.to_be_bytes());
}

struct Pending {
    client: SocketAddr,
    original_id: u16,
    target: SocketAddr,
    created: Instant,
}

#[derive(Default)]
struct PendingMap {
    inner: HashMap<u16, Pending>,
}

impl PendingMap {
    /// Pick an outbound id not currently in flight.
    fn allocate(&mut self, pending: Pending) -> Option<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..ID_ALLOC_ATTEMPTS {
            let id: u16 = rng.r#gen();
            if !self.inner.contains_key(&id) {
                self.inner.insert(id, pending);
                return Some(id);
            }
        }
        None
    }

    /// Match a response by outbound id and originating backend.
    fn take(&mut self, id: u16, from: SocketAddr) -> Option<Pending> {
        match self.inner.get(&id) {
            Some(p) if p.target == from => self.inner.remove(&id),
            _ => None,
        }
    }

    fn expire(&mut self, max_age: Duration) {
        self.inner.retain(|_, p| p.created.elapsed() < max_age);
    }
}

pub struct UdpRelay {
    cfg: RelayConfig,
    table: Option<Arc<Table>>,
    backup: Option<Arc<Table>>,
    stats: Arc<RelayStats>,
    hash_seed: u32,
}

impl UdpRelay {
    pub fn new(
        cfg: RelayConfig,
        table: Option<Arc<Table>>,
        backup: Option<Arc<Table>>,
        stats: Arc<RelayStats>,
        hash_seed: u32,
    ) -> Self {
        Self { cfg, table, backup, stats, hash_seed }
    }

    fn pick(&self, client: SocketAddr) -> Result<SocketAddr, RelayError> {
        if let Some(table) = &self.table {
            let input = SelectorInput {
                mode: self.cfg.forward.mode,
                client_addr: client,
                relay_addr: self.cfg.listen,
                hash_key: self.hash_seed,
                port: self.cfg.forward.port,
            };
            Ok(select_backend(table, self.backup.as_ref(), &input)?.target)
        } else {
            self.cfg.forward.to.ok_or(RelayError::NoActiveHosts)
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listen = UdpSocket::bind(self.cfg.listen).await?;
        let bind_any: SocketAddr = if self.cfg.listen.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let upstream = UdpSocket::bind(bind_any).await?;
        let mut pending = PendingMap::default();
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        let timeout = self.cfg.timeout();
        let mut inbuf = vec![0u8; MAX_PACKET];
        let mut outbuf = vec![0u8; MAX_PACKET];

        loop {
            tokio::select! {
                recv = listen.recv_from(&mut inbuf) => {
                    // ICMP errors from prior sends surface here; the relay
                    // outlives them.
                    let (len, client) = match recv {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(relay = %self.cfg.name, error = %err, "dns listen receive failed");
                            continue;
                        }
                    };
                    let packet = &mut inbuf[..len];
                    let Some(original_id) = transaction_id(packet) else {
                        debug!(%client, len, "dropping short dns packet");
                        continue;
                    };
                    let target = match self.pick(client) {
                        Ok(target) => target,
                        Err(err) => {
                            warn!(relay = %self.cfg.name, %client, error = %err, "dns query dropped");
                            continue;
                        }
                    };
                    let entry = Pending { client, original_id, target, created: Instant::now() };
                    let Some(out_id) = pending.allocate(entry) else {
                        warn!(relay = %self.cfg.name, "dns transaction table saturated");
                        continue;
                    };
                    set_transaction_id(packet, out_id);
                    self.stats.bump();
                    if let Err(err) = upstream.send_to(packet, target).await {
                        warn!(%target, error = %err, "dns forward failed");
                    }
                }
                recv = upstream.recv_from(&mut outbuf) => {
                    let (len, from) = match recv {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(relay = %self.cfg.name, error = %err, "dns upstream receive failed");
                            continue;
                        }
                    };
                    let packet = &mut outbuf[..len];
                    let Some(out_id) = transaction_id(packet) else { continue };
                    let Some(entry) = pending.take(out_id, from) else {
                        debug!(%from, id = out_id, "unmatched dns response");
                        continue;
                    };
                    set_transaction_id(packet, entry.original_id);
                    if let Err(err) = listen.send_to(packet, entry.client).await {
                        warn!(client = %entry.client, error = %err, "dns reply failed");
                    }
                }
                _ = sweep.tick() => {
                    pending.expire(timeout);
                }
            }
        }
    }
}
