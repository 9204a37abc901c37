//! Per-relay TCP accept loop and session orchestration.
//!
//! Each relay owns one listener task. An accepted connection is admitted
//! against the session cap and the inflight descriptor gauge, registered
//! with the session index, and driven through the full relay flow:
//! optional client TLS, the request preface for HTTP relays, backend
//! selection and connect, the PROXY header, optional backend TLS and
//! inspection, then the bidirectional pump.
//!
//! HTTP relays defer the backend connect until the request headers have
//! been parsed, so `hash` rules fold into the selector key before a
//! backend is chosen. Inspection relays cannot defer: the backend
//! certificate is needed to answer the client handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout_at;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{Config, ProtocolConfig, ProtocolKind, RelayConfig};
use crate::error::{RelayError, is_fd_exhaustion};
use crate::http::error_page;
use crate::http::rules::{EvalCtx, MacroEnv, RuleTree};
use crate::http::stream::HttpEngine;
use crate::proxy::connect::{Dialer, DirectDialer, Established, ForwardTarget, SpoofDialer, establish};
use crate::proxy::copy::{CopyParams, RuleState, pump};
use crate::proxy::proxy_protocol;
use crate::proxy::selector::{SelectorInput, seed_key};
use crate::proxy::table::{Table, TableSet};
use crate::server::session::{Direction, InflightGauge, Session, SessionIndex};
use crate::server::stats::RelayStats;
use crate::tls::{Renegotiation, TlsContext};

/// Back-off after accept fails with descriptor exhaustion.
const ACCEPT_DEFER: Duration = Duration::from_secs(1);

trait RelayIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayIo for T {}

type BoxedIo = Box<dyn RelayIo>;

/// Everything a relay's sessions share, resolved once at startup.
pub struct RelayRuntime {
    pub cfg: RelayConfig,
    pub protocol: ProtocolConfig,
    pub table: Option<Arc<Table>>,
    pub backup: Option<Arc<Table>>,
    pub tls: Option<TlsContext>,
    pub rules_request: Arc<RuleTree>,
    pub rules_response: Arc<RuleTree>,
    pub stats: Arc<RelayStats>,
    pub index: Arc<SessionIndex>,
    pub gauge: Arc<InflightGauge>,
    pub hash_seed: u32,
}

impl RelayRuntime {
    pub fn build(
        cfg: &Config,
        relay: &RelayConfig,
        tables: &TableSet,
        index: Arc<SessionIndex>,
        gauge: Arc<InflightGauge>,
    ) -> anyhow::Result<Arc<Self>> {
        let protocol = cfg.protocol(relay);
        let table = relay.forward.table.as_deref().and_then(|n| tables.get(n));
        let backup = relay.forward.backup.as_deref().and_then(|n| tables.get(n));
        let tls = relay.tls.as_ref().map(TlsContext::from_config).transpose()?;
        let (request, response) = RuleTree::build(&protocol.rules);
        let table_name = relay.forward.table.as_deref().unwrap_or("");
        Ok(Arc::new(Self {
            cfg: relay.clone(),
            protocol,
            table,
            backup,
            tls,
            rules_request: Arc::new(request),
            rules_response: Arc::new(response),
            stats: RelayStats::new(&relay.name),
            index,
            gauge,
            hash_seed: seed_key(&relay.name, table_name),
        }))
    }

    fn forward_target(&self, client: SocketAddr, hash_key: u32) -> ForwardTarget<'_> {
        match &self.table {
            Some(table) => ForwardTarget::Table {
                table,
                backup: self.backup.as_ref(),
                input: SelectorInput {
                    mode: self.cfg.forward.mode,
                    client_addr: client,
                    relay_addr: self.cfg.listen,
                    hash_key,
                    port: self.cfg.forward.port,
                },
            },
            None => ForwardTarget::Fixed {
                // Validated at load time: a table or a target is present.
                target: self.cfg.forward.to.unwrap_or(self.cfg.listen),
                retry: self.cfg.retry,
            },
        }
    }

    fn engines(&self) -> Option<(HttpEngine, HttpEngine)> {
        match self.protocol.kind {
            ProtocolKind::Http => Some((
                HttpEngine::new(Direction::Request, Arc::clone(&self.rules_request)),
                HttpEngine::new(Direction::Response, Arc::clone(&self.rules_response)),
            )),
            _ => None,
        }
    }

    fn sends_error_doc(&self) -> bool {
        self.protocol.return_error && self.protocol.kind == ProtocolKind::Http
    }
}

/// Bind and serve one TCP relay. Runs until the task is aborted.
pub async fn run(runtime: Arc<RelayRuntime>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(runtime.cfg.listen).await?;
    serve(runtime, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(runtime: Arc<RelayRuntime>, listener: TcpListener) -> anyhow::Result<()> {
    info!(relay = %runtime.cfg.name, listen = %runtime.cfg.listen, "relay listening");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) if is_fd_exhaustion(&err) => {
                warn!(relay = %runtime.cfg.name, "accept deferred, descriptors exhausted");
                tokio::time::sleep(ACCEPT_DEFER).await;
                continue;
            }
            Err(err) => {
                error!(relay = %runtime.cfg.name, error = %err, "accept failed");
                continue;
            }
        };

        if runtime.index.at_capacity() {
            debug!(relay = %runtime.cfg.name, %peer, "session cap reached, dropping");
            continue;
        }
        let Some(credit) = runtime.gauge.reserve() else {
            debug!(relay = %runtime.cfg.name, %peer, "inflight limit reached, dropping");
            continue;
        };

        runtime.stats.bump();
        let runtime = Arc::clone(&runtime);
        let mut session = Session::new(
            Arc::clone(&runtime.index),
            &runtime.cfg.name,
            peer,
            runtime.hash_seed,
            credit,
        );
        let span = info_span!("session", relay = %runtime.cfg.name, id = session.id(), %peer);
        tokio::spawn(
            async move {
                match relay_session(&runtime, &mut session, socket, peer).await {
                    Ok(()) => session.teardown("done"),
                    Err(err) => {
                        debug!(error = %err, "session failed");
                        session.teardown(&err.to_string());
                    }
                }
            }
            .instrument(span),
        );
    }
}

/// The transformed request head, read before the backend is chosen so
/// request rules (hash folds in particular) can steer selection.
struct Preface {
    engine: HttpEngine,
    /// Bytes read past the header block, handed to the pump unprocessed.
    residual: BytesMut,
    /// Transformed head, written to the backend ahead of the pump.
    head: BytesMut,
}

/// Drive one accepted connection end to end.
async fn relay_session(
    runtime: &RelayRuntime,
    session: &mut Session,
    client: TcpStream,
    peer: SocketAddr,
) -> Result<(), RelayError> {
    let deadline = tokio::time::Instant::now() + runtime.cfg.timeout();
    let tls = runtime.tls.as_ref();

    let macros = MacroEnv {
        remote: peer,
        server: runtime.cfg.listen,
        server_name: error_page::SERVER_NAME.to_string(),
        timeout_secs: runtime.cfg.timeout_secs,
    };
    let rule_state = Mutex::new(RuleState {
        mark: 0,
        hash_key: session.hash_key,
        log: String::new(),
    });

    // Inspection: complete the backend handshake first so the client can be
    // answered with a leaf that mirrors the backend certificate. The connect
    // cannot wait for request headers here.
    if let Some(ctx) = tls {
        if let (Some(inspector), Some(connector)) = (&ctx.inspector, &ctx.connector) {
            let established = connect_backend(runtime, session, peer, session.hash_key).await?;
            let target = established.target;
            let tls_backend =
                crate::tls::connect(connector, target, established.stream, deadline).await?;
            session.server.tls = Some(Renegotiation::post_handshake());

            let leaf = tls_backend
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .cloned()
                .ok_or_else(|| RelayError::Tls("backend presented no certificate".to_string()))?;
            let (chain, key) = inspector
                .derive_leaf(&leaf)
                .map_err(|err| RelayError::Tls(err.to_string()))?;
            let acceptor = ctx
                .acceptor_for(chain, key)
                .map_err(|err| RelayError::Tls(err.to_string()))?;
            let tls_client = crate::tls::accept(&acceptor, client, deadline).await?;
            session.client.tls = Some(Renegotiation::post_handshake());

            let result = run_pump(
                runtime,
                session,
                Box::new(tls_client),
                Box::new(tls_backend),
                target,
                &macros,
                &rule_state,
                None,
            )
            .await;
            settle_rule_state(session, rule_state);
            return result;
        }
    }

    // Client-side termination happens before the backend connect so connect
    // failures can still be answered over the session's TLS.
    let mut client_io: BoxedIo = match tls.and_then(|t| t.acceptor.as_ref()) {
        Some(acceptor) => {
            let stream = crate::tls::accept(acceptor, client, deadline).await?;
            session.client.tls = Some(Renegotiation::post_handshake());
            Box::new(stream)
        }
        None => Box::new(client),
    };

    // HTTP relays hold the connect until the request head has been parsed.
    let preface = if runtime.protocol.kind == ProtocolKind::Http {
        match read_preface(&mut client_io, runtime, &rule_state, &macros, deadline).await {
            Ok(preface) => Some(preface),
            Err(err) => {
                send_abort(runtime, &mut client_io, &err).await;
                settle_rule_state(session, rule_state);
                return Err(err);
            }
        }
    } else {
        None
    };

    let hash_key = rule_state.lock().unwrap().hash_key;
    let established = match connect_backend(runtime, session, peer, hash_key).await {
        Ok(established) => established,
        Err(err) => {
            send_abort(runtime, &mut client_io, &err).await;
            settle_rule_state(session, rule_state);
            return Err(err);
        }
    };
    let target = established.target;

    let backend_io: BoxedIo = match tls.and_then(|t| t.connector.as_ref()) {
        Some(connector) => {
            let stream =
                crate::tls::connect(connector, target, established.stream, deadline).await?;
            session.server.tls = Some(Renegotiation::post_handshake());
            Box::new(stream)
        }
        None => Box::new(established.stream),
    };

    let result =
        run_pump(runtime, session, client_io, backend_io, target, &macros, &rule_state, preface)
            .await;
    settle_rule_state(session, rule_state);
    result
}

fn settle_rule_state(session: &mut Session, rule_state: Mutex<RuleState>) {
    let state = rule_state.into_inner().unwrap();
    session.mark = state.mark;
    session.hash_key = state.hash_key;
    session.log = state.log;
}

/// Read and transform the request head. Rules run as the lines arrive, so
/// by the time the header block closes the shared rule state carries the
/// folded hash key and any mark.
async fn read_preface(
    client: &mut BoxedIo,
    runtime: &RelayRuntime,
    rule_state: &Mutex<RuleState>,
    macros: &MacroEnv,
    deadline: tokio::time::Instant,
) -> Result<Preface, RelayError> {
    let mut engine = HttpEngine::new(Direction::Request, Arc::clone(&runtime.rules_request));
    let mut inbuf = BytesMut::with_capacity(4096);
    let mut head = BytesMut::new();

    loop {
        let n = match timeout_at(deadline, client.read_buf(&mut inbuf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(RelayError::Io(err)),
            Err(_) => return Err(RelayError::Aborted("request header timeout")),
        };
        if n == 0 {
            return Err(RelayError::Aborted("closed before request"));
        }
        {
            let mut state = rule_state.lock().unwrap();
            let RuleState { mark, hash_key, log } = &mut *state;
            let mut ctx = EvalCtx { mark, hash_key, log, macros };
            engine.advance(&mut inbuf, &mut head, &mut ctx)?;
        }
        if engine.headers_done() {
            break;
        }
    }
    Ok(Preface { engine, residual: inbuf, head })
}

/// Select, dial and account the backend leg; emits the PROXY header before
/// any other byte reaches the backend.
async fn connect_backend(
    runtime: &RelayRuntime,
    session: &mut Session,
    peer: SocketAddr,
    hash_key: u32,
) -> Result<Established, RelayError> {
    let forward = runtime.forward_target(peer, hash_key);
    let dialer: Box<dyn Dialer> = if runtime.cfg.transparent {
        Box::new(SpoofDialer { client: peer })
    } else {
        Box::new(DirectDialer)
    };
    let mut established = establish(&forward, dialer.as_ref(), runtime.cfg.timeout()).await?;

    session.connected();
    session.server.peer = Some(established.target);
    session.server.port = established.target.port();
    session.retry = established.retries_used;

    if let Some(version) = runtime.cfg.proxy_protocol {
        let header = proxy_protocol::encode(version, peer, runtime.cfg.listen);
        established.stream.write_all(&header).await?;
    }
    Ok(established)
}

#[allow(clippy::too_many_arguments)]
async fn run_pump(
    runtime: &RelayRuntime,
    session: &mut Session,
    client_io: BoxedIo,
    mut backend_io: BoxedIo,
    target: SocketAddr,
    macros: &MacroEnv,
    rule_state: &Mutex<RuleState>,
    preface: Option<Preface>,
) -> Result<(), RelayError> {
    info!(%target, retries = session.retry, "session established");

    let mut residual = BytesMut::new();
    let engines = match preface {
        Some(preface) => {
            if !preface.head.is_empty() {
                backend_io.write_all(&preface.head).await?;
                session
                    .meta
                    .bytes_out
                    .fetch_add(preface.head.len() as u64, Ordering::Relaxed);
            }
            residual = preface.residual;
            // The request engine resumes mid-message; the response side
            // starts fresh.
            Some((
                preface.engine,
                HttpEngine::new(Direction::Response, Arc::clone(&runtime.rules_response)),
            ))
        }
        None => runtime.engines(),
    };

    let error_doc = Mutex::new(None);
    let params = CopyParams {
        index: &runtime.index,
        meta: &session.meta,
        rule_state,
        macros,
        idle: runtime.cfg.timeout(),
        no_splice: runtime.protocol.no_splice,
        return_error: runtime.sends_error_doc(),
        style: runtime.protocol.style.as_deref(),
        error_doc: &error_doc,
    };

    pump(
        client_io,
        backend_io,
        engines,
        residual,
        &mut session.client,
        &mut session.server,
        &params,
    )
    .await
    .map(|_| ())
}

/// Pre-pump failure: the client stream is still whole, answer directly.
async fn send_abort(runtime: &RelayRuntime, client: &mut BoxedIo, err: &RelayError) {
    if runtime.sends_error_doc() {
        if let Some(code) = err.status_code() {
            let label = match err {
                RelayError::Protocol { label, .. } => label.as_deref(),
                _ => None,
            };
            let doc = error_page::render(
                code,
                &err.to_string(),
                label,
                runtime.protocol.style.as_deref(),
            );
            let _ = client.write_all(&doc).await;
        }
    }
    let _ = client.shutdown().await;
}
