//! Backend connection establishment with retry, deferral and timeout
//! handling.
//!
//! One timeout budget covers the whole establishment phase. A connect
//! timeout aborts immediately (the client sees 504); a refused or reset
//! connect consumes one unit of the session's retry budget and re-runs
//! selection, so round-robin naturally steps past a dead host. Descriptor
//! exhaustion is transient and is deferred, not charged against the budget.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{RelayError, is_fd_exhaustion};
use crate::proxy::selector::{Selection, SelectorInput, select_backend};
use crate::proxy::table::Table;

/// Back-off for EMFILE/ENFILE on the dial path.
const FD_DEFER: Duration = Duration::from_secs(1);
const FD_DEFER_MAX: u32 = 4;

/// Where a session's backend connection goes.
pub enum ForwardTarget<'a> {
    /// Health-checked table, with an optional backup table.
    Table {
        table: &'a Arc<Table>,
        backup: Option<&'a Arc<Table>>,
        input: SelectorInput,
    },
    /// Fixed target with a relay-level retry budget.
    Fixed { target: SocketAddr, retry: u32 },
}

impl ForwardTarget<'_> {
    fn pick(&self) -> Result<Selection, RelayError> {
        match self {
            ForwardTarget::Table { table, backup, input } => {
                select_backend(table, *backup, input)
            }
            ForwardTarget::Fixed { target, retry } => {
                Ok(Selection { target: *target, retry: *retry })
            }
        }
    }
}

/// Outbound dialer seam. The default implementation dials directly; the
/// transparent variant binds the client's source address first.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, to: SocketAddr) -> io::Result<TcpStream>;
}

pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, to: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(to).await
    }
}

/// Transparent mode: outbound sockets carry the original client address.
/// Binding a non-local source needs `IP_TRANSPARENT`, which in turn needs
/// CAP_NET_ADMIN; without it only addresses local to the host still bind.
pub struct SpoofDialer {
    pub client: SocketAddr,
}

#[async_trait]
impl Dialer for SpoofDialer {
    async fn dial(&self, to: SocketAddr) -> io::Result<TcpStream> {
        let domain = match to {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        #[cfg(target_os = "linux")]
        if let Err(err) = socket.set_ip_transparent_v4(true) {
            debug!(error = %err, "IP_TRANSPARENT unavailable, binding without it");
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(self.client.ip(), 0).into())?;
        // SAFETY: the descriptor is freshly created, non-blocking and owned
        // solely by `socket`, which is consumed here.
        let socket = unsafe {
            use std::os::fd::{FromRawFd, IntoRawFd};
            TcpSocket::from_raw_fd(socket.into_raw_fd())
        };
        socket.connect(to).await
    }
}

#[derive(Debug)]
pub struct Established {
    pub stream: TcpStream,
    pub target: SocketAddr,
    pub retries_used: u32,
}

/// Connect to a backend, retrying within the host's budget.
///
/// `deadline` is the relay timeout; it spans every attempt including
/// deferrals, so a slow chain of dead hosts cannot stall past it.
pub async fn establish(
    forward: &ForwardTarget<'_>,
    dialer: &dyn Dialer,
    deadline: Duration,
) -> Result<Established, RelayError> {
    match timeout(deadline, establish_inner(forward, dialer)).await {
        Ok(res) => res,
        Err(_) => Err(RelayError::ConnectTimeout),
    }
}

async fn establish_inner(
    forward: &ForwardTarget<'_>,
    dialer: &dyn Dialer,
) -> Result<Established, RelayError> {
    let mut selection = forward.pick()?;
    let budget = selection.retry;
    let mut failures = 0u32;
    let mut deferrals = 0u32;

    loop {
        match dialer.dial(selection.target).await {
            Ok(stream) => {
                debug!(target = %selection.target, retries = failures, "backend connected");
                return Ok(Established {
                    stream,
                    target: selection.target,
                    retries_used: failures,
                });
            }
            Err(err) if is_fd_exhaustion(&err) => {
                deferrals += 1;
                if deferrals > FD_DEFER_MAX {
                    return Err(RelayError::FdExhausted);
                }
                warn!(target = %selection.target, deferrals, "descriptors exhausted, deferring connect");
                sleep(FD_DEFER).await;
            }
            Err(err) => {
                failures += 1;
                if failures > budget {
                    return Err(RelayError::Forward(err));
                }
                warn!(
                    target = %selection.target,
                    attempt = failures,
                    budget,
                    error = %err,
                    "backend connect failed, retrying"
                );
                // Re-run selection so round-robin steps to the next host.
                selection = forward.pick()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RefusingDialer {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _to: SocketAddr) -> io::Result<TcpStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    #[tokio::test]
    async fn retry_budget_allows_three_retries_then_aborts() {
        let dialer = RefusingDialer { attempts: AtomicU32::new(0) };
        let forward = ForwardTarget::Fixed { target: "127.0.0.1:1".parse().unwrap(), retry: 3 };
        let err = establish(&forward, &dialer, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::Forward(_)));
        // Initial attempt plus three retries; the fourth failure aborts.
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_budget_fails_on_first_refusal() {
        let dialer = RefusingDialer { attempts: AtomicU32::new(0) };
        let forward = ForwardTarget::Fixed { target: "127.0.0.1:1".parse().unwrap(), retry: 0 };
        let err = establish(&forward, &dialer, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::Forward(_)));
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connects_to_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let forward = ForwardTarget::Fixed { target: addr, retry: 0 };
        let established = establish(&forward, &DirectDialer, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(established.target, addr);
        assert_eq!(established.retries_used, 0);
    }

    // 127.0.0.2 is local to the loopback interface on Linux, so the bind
    // succeeds even without IP_TRANSPARENT privileges.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn spoof_dialer_binds_client_source_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = SpoofDialer { client: "127.0.0.2:45678".parse().unwrap() };

        let stream = dialer.dial(addr).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), "127.0.0.2".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(stream.local_addr().unwrap().ip(), peer.ip());
    }

    struct StalledDialer;

    #[async_trait]
    impl Dialer for StalledDialer {
        async fn dial(&self, _to: SocketAddr) -> io::Result<TcpStream> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_times_out() {
        let forward = ForwardTarget::Fixed { target: "127.0.0.1:1".parse().unwrap(), retry: 0 };
        let err = establish(&forward, &StalledDialer, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectTimeout));
    }
}
