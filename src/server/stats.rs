//! Per-relay session statistics, rolled on a fixed interval.
//!
//! Sessions bump a live counter on accept; the ticker drains it every
//! interval into running halving averages at interval, hour and day
//! granularity, and emits one structured report per relay.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    cnt: u64,
    tick: u64,
    avg: u64,
    last_hour: u64,
    avg_hour: u64,
    last_day: u64,
    avg_day: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub cnt: u64,
    pub last: u64,
    pub avg: u64,
    pub avg_hour: u64,
    pub avg_day: u64,
}

pub struct RelayStats {
    pub name: String,
    last: AtomicU64,
    window: Mutex<Window>,
}

impl RelayStats {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            last: AtomicU64::new(0),
            window: Mutex::new(Window::default()),
        })
    }

    /// One session accepted on this relay.
    pub fn bump(&self) {
        self.last.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the interval counter into the rollups.
    pub fn roll(&self, interval_secs: u64) -> StatsReport {
        let last = self.last.swap(0, Ordering::AcqRel);
        let mut w = self.window.lock().unwrap();
        w.cnt += last;
        w.tick += 1;
        w.avg = (last + w.avg) / 2;

        w.last_hour += last;
        let ticks_per_hour = (3600 / interval_secs).max(1);
        if w.tick % ticks_per_hour == 0 {
            w.avg_hour = (w.last_hour + w.avg_hour) / 2;
            w.last_hour = 0;
        }

        w.last_day += last;
        let ticks_per_day = (86400 / interval_secs).max(1);
        if w.tick % ticks_per_day == 0 {
            w.avg_day = (w.last_day + w.avg_day) / 2;
            w.last_day = 0;
        }

        StatsReport { cnt: w.cnt, last, avg: w.avg, avg_hour: w.avg_hour, avg_day: w.avg_day }
    }
}

/// Periodic reporter over every configured relay.
pub async fn run(stats: Vec<Arc<RelayStats>>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for relay in &stats {
            let report = relay.roll(interval_secs);
            info!(
                relay = %relay.name,
                total = report.cnt,
                interval = report.last,
                avg = report.avg,
                avg_hour = report.avg_hour,
                avg_day = report.avg_day,
                "relay statistics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_average_halves_toward_rate() {
        let stats = RelayStats::new("www");
        for _ in 0..4 {
            stats.bump();
        }
        let report = stats.roll(60);
        assert_eq!(report.last, 4);
        assert_eq!(report.avg, 2);
        assert_eq!(report.cnt, 4);

        for _ in 0..4 {
            stats.bump();
        }
        let report = stats.roll(60);
        assert_eq!(report.avg, 3);
        assert_eq!(report.cnt, 8);
    }

    #[test]
    fn hourly_rollup_fires_on_the_hour_boundary() {
        let stats = RelayStats::new("www");
        stats.bump();
        stats.bump();
        // With an hour-long interval every tick is an hourly boundary.
        let report = stats.roll(3600);
        assert_eq!(report.avg_hour, 1);
        stats.bump();
        stats.bump();
        let report = stats.roll(3600);
        assert_eq!(report.avg_hour, 1);
    }
}
