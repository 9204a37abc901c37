//! Backend tables and host health state.
//!
//! Health is owned by the external health-check engine; the relay core only
//! reads it. Snapshots are swapped in atomically so selection never blocks
//! on a health update.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use tracing::info;

use crate::config::{Config, TableConfig};

/// Tri-state health as published by the health-check engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostState {
    Up,
    Down,
    #[default]
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub address: IpAddr,
    /// Ordering index used for round-robin continuation.
    pub idx: usize,
    /// Retry budget granted to sessions forwarded to this host.
    pub retry: u32,
    pub state: HostState,
}

impl Host {
    pub fn is_up(&self) -> bool {
        self.state == HostState::Up
    }
}

/// Immutable view of one table: declaration-ordered hosts plus the
/// aggregate up-count the health engine publishes alongside them.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub hosts: Vec<Host>,
    pub check: bool,
}

impl TableSnapshot {
    pub fn from_config(cfg: &TableConfig) -> Self {
        let hosts = cfg
            .hosts
            .iter()
            .enumerate()
            .map(|(idx, h)| Host {
                address: h.address,
                idx,
                retry: h.retry,
                // Without a configured check every host is eligible.
                state: if cfg.check { HostState::Unknown } else { HostState::Up },
            })
            .collect();
        Self { hosts, check: cfg.check }
    }

    pub fn up_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.is_up()).count()
    }

    /// A table is usable when at least one host is healthy, or when no
    /// health check gates it at all.
    pub fn is_up(&self) -> bool {
        !self.check || self.up_count() > 0
    }

    /// Health gate for a single host; skipped when the table has no check.
    pub fn host_eligible(&self, host: &Host) -> bool {
        !self.check || host.is_up()
    }
}

/// One named table: a lock-free snapshot plus the round-robin cursor, which
/// is the only piece of table state the relay core itself mutates.
pub struct Table {
    pub name: String,
    snapshot: ArcSwap<TableSnapshot>,
    rr_cursor: AtomicU32,
}

impl Table {
    pub fn new(name: impl Into<String>, snapshot: TableSnapshot) -> Self {
        Self {
            name: name.into(),
            snapshot: ArcSwap::from_pointee(snapshot),
            rr_cursor: AtomicU32::new(0),
        }
    }

    pub fn load(&self) -> Arc<TableSnapshot> {
        self.snapshot.load_full()
    }

    /// Replace the host set. The round-robin cursor resets to zero on
    /// reload; continuation across reconfiguration is not preserved.
    pub fn reload(&self, snapshot: TableSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
        self.rr_cursor.store(0, Ordering::Relaxed);
        info!(table = %self.name, "table reloaded");
    }

    /// Publish a health transition for one host, as delivered by the
    /// health-check feed. Unknown addresses are ignored.
    pub fn set_host_state(&self, address: IpAddr, state: HostState) {
        let current = self.snapshot.load();
        if !current.hosts.iter().any(|h| h.address == address) {
            return;
        }
        let mut next = (**current).clone();
        for host in &mut next.hosts {
            if host.address == address {
                host.state = state;
            }
        }
        self.snapshot.store(Arc::new(next));
    }

    pub fn rr_cursor(&self) -> u32 {
        self.rr_cursor.load(Ordering::Relaxed)
    }

    /// Advance the cursor past the host that was just picked, so host order
    /// advances exactly once per successful selection.
    pub fn set_rr_cursor(&self, next: u32) {
        self.rr_cursor.store(next, Ordering::Relaxed);
    }
}

/// All configured tables, shared between listeners and the health feed.
pub struct TableSet {
    tables: HashMap<String, Arc<Table>>,
}

impl TableSet {
    pub fn from_config(cfg: &Config) -> Self {
        let tables = cfg
            .tables
            .iter()
            .map(|(name, tc)| {
                (name.clone(), Arc::new(Table::new(name.clone(), TableSnapshot::from_config(tc))))
            })
            .collect();
        Self { tables }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    fn table_cfg(n: usize, check: bool) -> TableConfig {
        TableConfig {
            hosts: (0..n)
                .map(|i| HostConfig {
                    address: format!("10.0.0.{}", i + 1).parse().unwrap(),
                    retry: 1,
                })
                .collect(),
            check,
        }
    }

    #[test]
    fn unchecked_table_is_always_up() {
        let snap = TableSnapshot::from_config(&table_cfg(2, false));
        assert!(snap.is_up());
        assert!(snap.hosts.iter().all(|h| snap.host_eligible(h)));
    }

    #[test]
    fn checked_table_starts_unknown_and_down() {
        let table = Table::new("t", TableSnapshot::from_config(&table_cfg(2, true)));
        assert!(!table.load().is_up());

        table.set_host_state("10.0.0.1".parse().unwrap(), HostState::Up);
        assert!(table.load().is_up());
        assert_eq!(table.load().up_count(), 1);

        table.set_host_state("10.0.0.1".parse().unwrap(), HostState::Down);
        assert!(!table.load().is_up());
    }

    #[test]
    fn reload_resets_round_robin_cursor() {
        let table = Table::new("t", TableSnapshot::from_config(&table_cfg(3, false)));
        table.set_rr_cursor(2);
        table.reload(TableSnapshot::from_config(&table_cfg(3, false)));
        assert_eq!(table.rr_cursor(), 0);
    }
}
