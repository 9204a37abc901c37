//! Session and endpoint state: one client-to-backend relay instance.
//!
//! A session owns both of its endpoints; teardown is idempotent and releases
//! sockets, buffers and the inflight credit exactly once, whichever path
//! (success, failure, sweep) gets there first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::tls::Renegotiation;

/// Directional role of an endpoint within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Remaining byte budget the current protocol phase expects to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Toread {
    /// Pass bytes through without counting (plain TCP, CONNECT).
    #[default]
    Unlimited,
    /// Parsing HTTP header lines.
    Header,
    /// Exactly this many body bytes remain.
    Bytes(u64),
}

/// One half of a session. The socket itself is owned by the relay flow;
/// the endpoint tracks the protocol-driven accounting attached to it.
#[derive(Debug)]
pub struct Endpoint {
    pub dir: Direction,
    pub peer: Option<SocketAddr>,
    pub port: u16,
    pub toread: Toread,
    /// Bytes moved by an active splice; `None` means not spliced. A spliced
    /// endpoint must not take discrete `toread` decrements and vice versa.
    pub splicelen: Option<u64>,
    /// Renegotiation policy when this endpoint speaks TLS.
    pub tls: Option<Renegotiation>,
}

impl Endpoint {
    pub fn new(dir: Direction) -> Self {
        Self { dir, peer: None, port: 0, toread: Toread::Unlimited, splicelen: None, tls: None }
    }

    /// Fold a finished splice back into the byte budget. Reads the final
    /// spliced length once and resets the marker before buffered mode
    /// resumes.
    pub fn end_splice(&mut self) {
        if let Some(len) = self.splicelen.take() {
            if let Toread::Bytes(n) = self.toread {
                self.toread = Toread::Bytes(n.saturating_sub(len));
            }
        }
    }
}

/// Global gauge for accept-to-connect descriptor credits.
pub struct InflightGauge {
    limit: usize,
    current: AtomicUsize,
}

impl InflightGauge {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self { limit, current: AtomicUsize::new(0) })
    }

    /// Reserve one credit, or report descriptor pressure.
    pub fn reserve(self: &Arc<Self>) -> Option<InflightCredit> {
        let mut cur = self.current.load(Ordering::Relaxed);
        loop {
            if cur >= self.limit {
                return None;
            }
            match self.current.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(InflightCredit { gauge: Arc::clone(self), released: AtomicBool::new(false) }),
                Err(now) => cur = now,
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

/// A held reservation. Releasing twice is a no-op; dropping an unreleased
/// credit releases it, so every accounted session decrements exactly once.
pub struct InflightCredit {
    gauge: Arc<InflightGauge>,
    released: AtomicBool,
}

impl InflightCredit {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.gauge.current.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for InflightCredit {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cross-task view of a session, held by the registry for the idle sweep
/// and statistics.
pub struct SessionMeta {
    pub id: u64,
    pub relay: String,
    done: AtomicBool,
    last_activity_ms: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    closed: Notify,
}

impl SessionMeta {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Terminal cooperative-cancellation marker. The owning task observes it
    /// via [`SessionMeta::closed`] and drains before closing.
    pub fn force_close(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.closed.notify_waiters();
        }
    }

    pub async fn closed(&self) {
        if self.is_done() {
            return;
        }
        self.closed.notified().await;
    }
}

/// Registry of live sessions, keyed by id. DNS sessions live in their own
/// transaction-keyed map inside the UDP relay; everything else lands here.
pub struct SessionIndex {
    epoch: Instant,
    next_id: AtomicU64,
    live: AtomicUsize,
    max_sessions: usize,
    inner: std::sync::Mutex<HashMap<u64, Arc<SessionMeta>>>,
}

impl SessionIndex {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            next_id: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            max_sessions,
            inner: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn at_capacity(&self) -> bool {
        self.live() >= self.max_sessions
    }

    pub fn register(&self, relay: &str) -> Arc<SessionMeta> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let meta = Arc::new(SessionMeta {
            id,
            relay: relay.to_string(),
            done: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(self.now_ms()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            closed: Notify::new(),
        });
        self.live.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().insert(id, Arc::clone(&meta));
        meta
    }

    pub fn unregister(&self, id: u64) {
        if self.inner.lock().unwrap().remove(&id).is_some() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn touch(&self, meta: &SessionMeta) {
        meta.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Time since the session last made progress in either direction.
    pub fn idle_of(&self, meta: &SessionMeta) -> std::time::Duration {
        let idle = self
            .now_ms()
            .saturating_sub(meta.last_activity_ms.load(Ordering::Relaxed));
        std::time::Duration::from_millis(idle)
    }

    /// Periodic sweep: force-close sessions idle past the hard timeout.
    pub fn sweep(&self, idle_max: std::time::Duration) -> usize {
        let now = self.now_ms();
        let cutoff = idle_max.as_millis() as u64;
        let mut closed = 0;
        for meta in self.inner.lock().unwrap().values() {
            let idle = now.saturating_sub(meta.last_activity_ms.load(Ordering::Relaxed));
            if idle >= cutoff && !meta.is_done() {
                debug!(session = meta.id, idle_ms = idle, "idle sweep closing session");
                meta.force_close();
                closed += 1;
            }
        }
        closed
    }
}

/// Per-session state owned by the session task.
pub struct Session {
    pub meta: Arc<SessionMeta>,
    index: Arc<SessionIndex>,
    pub client: Endpoint,
    pub server: Endpoint,
    pub created: Instant,
    /// Selector key, seeded per relay/table and folded by `hash` rules.
    pub hash_key: u32,
    pub retry: u32,
    /// Session tag set by `mark` rules, gating mark-conditioned rules.
    pub mark: u32,
    /// Structured notes appended by `log` rules, emitted at teardown.
    pub log: String,
    credit: Option<InflightCredit>,
    torn_down: bool,
}

impl Session {
    pub fn new(
        index: Arc<SessionIndex>,
        relay: &str,
        peer: SocketAddr,
        hash_seed: u32,
        credit: InflightCredit,
    ) -> Self {
        let meta = index.register(relay);
        let mut client = Endpoint::new(Direction::Request);
        client.peer = Some(peer);
        client.port = peer.port();
        Self {
            meta,
            index,
            client,
            server: Endpoint::new(Direction::Response),
            created: Instant::now(),
            hash_key: hash_seed,
            retry: 0,
            mark: 0,
            log: String::new(),
            credit: Some(credit),
            torn_down: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn touch(&self) {
        self.index.touch(&self.meta);
    }

    /// The backend side connected: the descriptor reservation is resolved
    /// and the credit is returned to the gauge.
    pub fn connected(&mut self) {
        if let Some(credit) = self.credit.take() {
            credit.release();
        }
    }

    /// Idempotent teardown; every failure path funnels through here.
    pub fn teardown(&mut self, reason: &str) {
        if self.torn_down {
            debug_assert!(self.credit.is_none(), "teardown ran with a live credit");
            return;
        }
        self.torn_down = true;
        self.meta.force_close();
        self.index.unregister(self.meta.id);
        if let Some(credit) = self.credit.take() {
            credit.release();
        }
        info!(
            relay = %self.meta.relay,
            session = self.meta.id,
            active = self.index.live(),
            mark = self.mark,
            peer = ?self.client.peer,
            target = ?self.server.peer,
            bytes_in = self.meta.bytes_in.load(Ordering::Relaxed),
            bytes_out = self.meta.bytes_out.load(Ordering::Relaxed),
            notes = %self.log,
            "session closed: {reason}"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Tasks that unwind or return early still settle the accounting.
        self.teardown("dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_credit_releases_exactly_once() {
        let gauge = InflightGauge::new(2);
        let credit = gauge.reserve().unwrap();
        assert_eq!(gauge.outstanding(), 1);
        credit.release();
        credit.release();
        assert_eq!(gauge.outstanding(), 0);
        drop(credit);
        assert_eq!(gauge.outstanding(), 0);
    }

    #[test]
    fn inflight_gauge_enforces_limit() {
        let gauge = InflightGauge::new(1);
        let held = gauge.reserve().unwrap();
        assert!(gauge.reserve().is_none());
        drop(held);
        assert!(gauge.reserve().is_some());
    }

    #[test]
    fn teardown_is_idempotent() {
        let index = SessionIndex::new(8);
        let gauge = InflightGauge::new(8);
        let mut session = Session::new(
            Arc::clone(&index),
            "t",
            "127.0.0.1:9999".parse().unwrap(),
            0,
            gauge.reserve().unwrap(),
        );
        assert_eq!(index.live(), 1);
        session.teardown("first");
        session.teardown("second");
        assert_eq!(index.live(), 0);
        assert_eq!(gauge.outstanding(), 0);
    }

    #[test]
    fn splice_end_folds_into_bounded_budget() {
        let mut ep = Endpoint::new(Direction::Request);
        ep.toread = Toread::Bytes(100);
        ep.splicelen = Some(60);
        ep.end_splice();
        assert_eq!(ep.toread, Toread::Bytes(40));
        assert_eq!(ep.splicelen, None);
    }
}
