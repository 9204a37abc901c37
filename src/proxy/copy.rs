//! Bidirectional relay pump: supervised buffered copy with protocol
//! transformation, and the unsupervised splice fast path.
//!
//! Each direction runs as its own half; a protocol error or forced close on
//! one side wakes the other through the session's close notifier so both
//! halves settle together. Progress in either direction refreshes the
//! session's activity clock, so an active splice keeps re-arming the idle
//! timeout exactly like buffered progress does.
//!
//! Aborts that carry an HTTP status are turned into a synthesized error
//! document. The request half cannot reach the client socket, so it parks
//! the rendered document in a shared slot; the response half, woken by the
//! forced close, delivers it before shutting the client down.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::http::error_page;
use crate::http::rules::{EvalCtx, MacroEnv};
use crate::http::stream::HttpEngine;
use crate::server::session::{Direction, Endpoint, SessionIndex, SessionMeta, Toread};

const READ_CHUNK: usize = 16 * 1024;

/// Rule-engine state shared by both directions: `mark` set on the request
/// side gates response-side rules, `hash` rules fold into one selector key,
/// and `log` notes interleave into one session log line.
#[derive(Debug, Default)]
pub struct RuleState {
    pub mark: u32,
    pub hash_key: u32,
    pub log: String,
}

/// The splice fast path engages only for a direction that carries no
/// further protocol obligations: every transformed byte flushed and the
/// engine (if any) degraded to plain passthrough.
pub fn can_splice(no_splice: bool, engine: Option<&HttpEngine>, pending: usize) -> bool {
    if no_splice || pending != 0 {
        return false;
    }
    engine.is_none_or(|e| e.is_passthrough())
}

pub struct CopyParams<'a> {
    pub index: &'a Arc<SessionIndex>,
    pub meta: &'a Arc<SessionMeta>,
    pub rule_state: &'a Mutex<RuleState>,
    pub macros: &'a MacroEnv,
    pub idle: Duration,
    pub no_splice: bool,
    /// Send a synthesized error document on protocol aborts.
    pub return_error: bool,
    pub style: Option<&'a str>,
    /// Abort document handoff from the request half to the response half.
    pub error_doc: &'a Mutex<Option<Vec<u8>>>,
}

fn render_abort(err: &RelayError, style: Option<&str>) -> Option<Vec<u8>> {
    let code = err.status_code()?;
    let label = match err {
        RelayError::Protocol { label, .. } => label.as_deref(),
        _ => None,
    };
    Some(error_page::render(code, &err.to_string(), label, style))
}

/// Copy one direction until EOF, error or forced close. Returns the number
/// of bytes moved. `initial` carries bytes already read off the socket
/// before the pump started (the parsed request head's remainder).
pub async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    mut engine: Option<HttpEngine>,
    role: Direction,
    endpoint: &mut Endpoint,
    initial: BytesMut,
    params: &CopyParams<'_>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = match role {
        Direction::Request => &params.meta.bytes_out,
        Direction::Response => &params.meta.bytes_in,
    };
    let mut inbuf = initial;
    let mut outbuf = BytesMut::with_capacity(READ_CHUNK);
    let mut total = 0u64;
    let mut spliced: Option<u64> = None;
    // Residual bytes are processed before the first read.
    let mut pending = !inbuf.is_empty();

    let result = loop {
        if pending {
            pending = false;
        } else {
            let read = tokio::select! {
                _ = params.meta.closed() => break Err(RelayError::Aborted("session closed")),
                read = timeout(params.idle, reader.read_buf(&mut inbuf)) => read,
            };
            match read {
                // Read timer fired; only give up if the whole session has
                // been quiet, otherwise the peer direction's progress
                // re-arms us.
                Err(_) => {
                    if params.index.idle_of(params.meta) >= params.idle {
                        break Err(RelayError::Aborted("buffer event timeout"));
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    let _ = writer.shutdown().await;
                    break Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => break Err(RelayError::Io(err)),
            }
            params.index.touch(params.meta);
        }

        match (&mut engine, &mut spliced) {
            (_, Some(len)) => {
                // Spliced: unsupervised bulk bytes, no transformation.
                *len += inbuf.len() as u64;
                endpoint.splicelen = Some(*len);
                outbuf.extend_from_slice(&inbuf.split_to(inbuf.len()));
            }
            (Some(eng), None) => {
                let mut state = params.rule_state.lock().unwrap();
                let RuleState { mark, hash_key, log } = &mut *state;
                let mut ctx = EvalCtx { mark, hash_key, log, macros: params.macros };
                if let Err(err) = eng.advance(&mut inbuf, &mut outbuf, &mut ctx) {
                    break Err(err);
                }
                endpoint.toread = eng.toread();
            }
            (None, None) => {
                outbuf.extend_from_slice(&inbuf.split_to(inbuf.len()));
            }
        }

        if !outbuf.is_empty() {
            let chunk = outbuf.split_to(outbuf.len());
            if let Err(err) = writer.write_all(&chunk).await {
                break Err(RelayError::Io(err));
            }
            total += chunk.len() as u64;
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }

        // Buffers flushed; switch to the fast path once the engine has no
        // more say in this direction.
        if spliced.is_none() && can_splice(params.no_splice, engine.as_ref(), outbuf.len()) {
            trace!(session = params.meta.id, "direction entering splice");
            spliced = Some(0);
            engine = None;
            endpoint.splicelen = Some(0);
            endpoint.toread = Toread::Unlimited;
        }
    };

    if let Some(len) = spliced {
        debug!(session = params.meta.id, spliced = len, "splice ended");
        // Final spliced length is read once and folded back into the
        // endpoint's byte budget.
        endpoint.splicelen = Some(len);
        endpoint.end_splice();
    }

    match result {
        Ok(()) => Ok(total),
        Err(err) => {
            if params.return_error {
                match role {
                    // The response half owns the client-facing writer.
                    Direction::Response => {
                        let doc = render_abort(&err, params.style)
                            .or_else(|| params.error_doc.lock().unwrap().take());
                        if let Some(doc) = doc {
                            let _ = writer.write_all(&doc).await;
                            let _ = writer.shutdown().await;
                        }
                    }
                    Direction::Request => {
                        if let Some(doc) = render_abort(&err, params.style) {
                            *params.error_doc.lock().unwrap() = Some(doc);
                        }
                    }
                }
            }
            // Wake the opposite direction so both halves settle.
            params.meta.force_close();
            Err(err)
        }
    }
}

/// Run both directions to completion. Returns the request-direction error
/// first, since protocol aborts originate there and carry the client-facing
/// status.
pub async fn pump<C, S>(
    client: C,
    server: S,
    engines: Option<(HttpEngine, HttpEngine)>,
    request_residual: BytesMut,
    client_ep: &mut Endpoint,
    server_ep: &mut Endpoint,
    params: &CopyParams<'_>,
) -> Result<(u64, u64), RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (server_r, server_w) = tokio::io::split(server);
    let (req_engine, res_engine) = match engines {
        Some((q, s)) => (Some(q), Some(s)),
        None => (None, None),
    };

    let request = copy_direction(
        client_r,
        server_w,
        req_engine,
        Direction::Request,
        client_ep,
        request_residual,
        params,
    );
    let response = copy_direction(
        server_r,
        client_w,
        res_engine,
        Direction::Response,
        server_ep,
        BytesMut::new(),
        params,
    );

    let (req, res) = tokio::join!(request, response);
    match (req, res) {
        (Ok(sent), Ok(received)) => Ok((sent, received)),
        (Err(err), _) => Err(err),
        (_, Err(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::rules::RuleTree;
    use crate::proxy::selector::HASH_INIT;

    fn engine(dir: Direction) -> HttpEngine {
        HttpEngine::new(dir, Arc::new(RuleTree::default()))
    }

    fn macros() -> MacroEnv {
        MacroEnv {
            remote: "127.0.0.1:1".parse().unwrap(),
            server: "127.0.0.1:2".parse().unwrap(),
            server_name: "t".to_string(),
            timeout_secs: 1,
        }
    }

    #[test]
    fn splice_requires_flushed_buffers() {
        assert!(can_splice(false, None, 0));
        assert!(!can_splice(false, None, 1));
        assert!(!can_splice(true, None, 0));
    }

    #[test]
    fn splice_waits_for_engine_passthrough() {
        let e = engine(Direction::Request);
        // A fresh engine still owes header parsing for the next message.
        assert!(!can_splice(false, Some(&e), 0));
    }

    #[tokio::test]
    async fn plain_copy_moves_bytes_and_counts_them() {
        let (mut client, client_peer) = tokio::io::duplex(1024);
        let (server, mut server_peer) = tokio::io::duplex(1024);
        let index = SessionIndex::new(8);
        let meta = index.register("t");
        let rule_state = Mutex::new(RuleState { hash_key: HASH_INIT, ..Default::default() });
        let error_doc = Mutex::new(None);
        let macros = macros();
        let params = CopyParams {
            index: &index,
            meta: &meta,
            rule_state: &rule_state,
            macros: &macros,
            idle: Duration::from_secs(5),
            no_splice: false,
            return_error: false,
            style: None,
            error_doc: &error_doc,
        };

        let driver = tokio::spawn(async move {
            client.write_all(b"hello across").await.unwrap();
            client.shutdown().await.unwrap();
            let mut buf = Vec::new();
            server_peer.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut client_ep = Endpoint::new(Direction::Request);
        let mut server_ep = Endpoint::new(Direction::Response);
        let (sent, _received) = pump(
            client_peer,
            server,
            None,
            BytesMut::new(),
            &mut client_ep,
            &mut server_ep,
            &params,
        )
        .await
        .unwrap();
        assert_eq!(sent, 12);
        // Plain TCP splices immediately; the final length lands on the
        // endpoint before being folded back.
        assert_eq!(client_ep.splicelen, None);
        assert_eq!(client_ep.toread, Toread::Unlimited);
        assert_eq!(driver.await.unwrap(), b"hello across");
        assert_eq!(meta.bytes_out.load(Ordering::Relaxed), 12);
    }

    #[tokio::test]
    async fn residual_request_bytes_flow_before_the_first_read() {
        let (mut client, client_peer) = tokio::io::duplex(4096);
        let (server, mut server_peer) = tokio::io::duplex(4096);
        let index = SessionIndex::new(8);
        let meta = index.register("t");
        let rule_state = Mutex::new(RuleState { hash_key: HASH_INIT, ..Default::default() });
        let error_doc = Mutex::new(None);
        let macros = macros();
        let params = CopyParams {
            index: &index,
            meta: &meta,
            rule_state: &rule_state,
            macros: &macros,
            idle: Duration::from_secs(5),
            no_splice: true,
            return_error: false,
            style: None,
            error_doc: &error_doc,
        };

        let driver = tokio::spawn(async move {
            // The head was consumed elsewhere; only the body's tail arrives
            // on the socket.
            client.write_all(b"efgh").await.unwrap();
            client.shutdown().await.unwrap();
            let mut buf = Vec::new();
            server_peer.read_to_end(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });

        let residual = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 8\r\n\r\nabcd"[..]);
        let engines = (engine(Direction::Request), engine(Direction::Response));
        let mut client_ep = Endpoint::new(Direction::Request);
        let mut server_ep = Endpoint::new(Direction::Response);
        let (sent, _) = pump(
            client_peer,
            server,
            Some(engines),
            residual,
            &mut client_ep,
            &mut server_ep,
            &params,
        )
        .await
        .unwrap();

        let seen = driver.await.unwrap();
        assert!(seen.starts_with("POST / HTTP/1.1\r\n"), "got: {seen}");
        assert!(seen.ends_with("\r\n\r\nabcdefgh"), "got: {seen}");
        assert_eq!(sent, seen.len() as u64);
        // Message complete: the budget is back to header parsing for the
        // next request on the connection.
        assert_eq!(client_ep.toread, Toread::Header);
        assert_eq!(client_ep.splicelen, None);
    }

    #[tokio::test]
    async fn request_abort_delivers_error_document_to_client() {
        let (mut client, client_peer) = tokio::io::duplex(4096);
        let (server, server_peer) = tokio::io::duplex(4096);
        let index = SessionIndex::new(8);
        let meta = index.register("t");
        let rule_state = Mutex::new(RuleState { hash_key: HASH_INIT, ..Default::default() });
        let error_doc = Mutex::new(None);
        let macros = macros();
        let params = CopyParams {
            index: &index,
            meta: &meta,
            rule_state: &rule_state,
            macros: &macros,
            idle: Duration::from_secs(5),
            no_splice: true,
            return_error: true,
            style: None,
            error_doc: &error_doc,
        };

        let driver = tokio::spawn(async move {
            // Malformed content length aborts the request engine.
            client
                .write_all(b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n")
                .await
                .unwrap();
            let mut buf = Vec::new();
            client.read_to_end(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });

        let engines = (engine(Direction::Request), engine(Direction::Response));
        let mut client_ep = Endpoint::new(Direction::Request);
        let mut server_ep = Endpoint::new(Direction::Response);
        let err = pump(
            client_peer,
            server,
            Some(engines),
            BytesMut::new(),
            &mut client_ep,
            &mut server_ep,
            &params,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), Some(500));
        drop(server_peer);
        let seen = driver.await.unwrap();
        assert!(seen.starts_with("HTTP/1.0 500 Internal Server Error"), "got: {seen}");
    }
}
