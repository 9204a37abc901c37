use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use janus::config::{Config, ProtocolKind};
use janus::proxy::TableSet;
use janus::proxy::udp::UdpRelay;
use janus::server::listener::{self, RelayRuntime};
use janus::server::session::{InflightGauge, SessionIndex};
use janus::server::stats;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let tables = TableSet::from_config(&cfg);
    let index = SessionIndex::new(cfg.max_sessions);
    let gauge = InflightGauge::new(cfg.max_inflight);

    let mut relay_stats = Vec::new();
    let mut tasks = tokio::task::JoinSet::new();
    // Idle backstop: the longest relay timeout, so the sweep never closes a
    // session its own relay still considers live.
    let mut sweep_idle = Duration::from_secs(0);

    for relay in &cfg.relays {
        sweep_idle = sweep_idle.max(relay.timeout());
        let runtime = RelayRuntime::build(&cfg, relay, &tables, Arc::clone(&index), Arc::clone(&gauge))?;
        relay_stats.push(Arc::clone(&runtime.stats));

        if runtime.protocol.kind == ProtocolKind::Dns {
            let udp = UdpRelay::new(
                runtime.cfg.clone(),
                runtime.table.clone(),
                runtime.backup.clone(),
                Arc::clone(&runtime.stats),
                runtime.hash_seed,
            );
            tasks.spawn(udp.run());
        } else {
            tasks.spawn(listener::run(runtime));
        }
    }
    anyhow::ensure!(!tasks.is_empty(), "no relays configured");

    tasks.spawn({
        let interval = cfg.stats_interval_secs;
        let relay_stats = relay_stats.clone();
        async move {
            stats::run(relay_stats, interval).await;
            Ok::<(), anyhow::Error>(())
        }
    });

    tasks.spawn({
        let index = Arc::clone(&index);
        async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let closed = index.sweep(sweep_idle);
                if closed > 0 {
                    warn!(closed, "idle sweep closed sessions");
                }
            }
        }
    });

    tokio::select! {
        Some(res) = tasks.join_next() => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
