//! Incremental HTTP/1.x stream transformer.
//!
//! One engine instance per direction parses header lines as they arrive,
//! runs them through the rule tree, and re-emits the (possibly rewritten)
//! message. Bodies are passed through with byte accounting: a fixed
//! Content-Length budget, a chunked-transfer state machine, or EOF-delimited
//! passthrough for responses that declare neither.

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::RelayError;
use crate::http::rules::{Disposition, EvalCtx, RuleElement, RuleEval, RuleTree};
use crate::server::session::{Direction, Toread};

/// Longest accepted header or chunk-size line.
const MAX_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpState {
    FirstLine,
    Headers,
    Body(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkCrlf,
    Trailer,
    /// EOF-delimited response body.
    Passthrough,
}

pub struct HttpEngine {
    dir: Direction,
    tree: Arc<RuleTree>,
    eval: RuleEval,
    state: HttpState,
    content_length: Option<u64>,
    chunked: bool,
    /// Messages completed since the engine was created.
    pub messages: u64,
}

impl HttpEngine {
    pub fn new(dir: Direction, tree: Arc<RuleTree>) -> Self {
        let eval = RuleEval::new(Arc::clone(&tree));
        Self {
            dir,
            tree,
            eval,
            state: HttpState::FirstLine,
            content_length: None,
            chunked: false,
            messages: 0,
        }
    }

    /// True between messages: headers fully resolved and no body bytes
    /// outstanding. The splice gate requires this on both directions.
    pub fn at_boundary(&self) -> bool {
        self.state == HttpState::FirstLine
    }

    /// True once the message degrades to an EOF-delimited byte stream; no
    /// further rule evaluation will happen on this direction.
    pub fn is_passthrough(&self) -> bool {
        self.state == HttpState::Passthrough
    }

    /// True once the first message's headers are fully resolved (rules run,
    /// deferred changes emitted). The listener waits for this before backend
    /// selection so `hash` rules can steer it.
    pub fn headers_done(&self) -> bool {
        self.messages > 0 || !matches!(self.state, HttpState::FirstLine | HttpState::Headers)
    }

    /// Byte budget the current protocol phase expects, for the endpoint's
    /// `toread` accounting.
    pub fn toread(&self) -> Toread {
        match self.state {
            HttpState::FirstLine
            | HttpState::Headers
            | HttpState::ChunkSize
            | HttpState::ChunkCrlf
            | HttpState::Trailer => Toread::Header,
            HttpState::Body(n) | HttpState::ChunkData(n) => Toread::Bytes(n),
            HttpState::Passthrough => Toread::Unlimited,
        }
    }

    /// Consume as much of `input` as possible, appending the transformed
    /// byte stream to `out`. Stops when more input is needed.
    pub fn advance(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
        ctx: &mut EvalCtx<'_>,
    ) -> Result<(), RelayError> {
        loop {
            match self.state {
                HttpState::FirstLine => {
                    let Some(raw) = take_line(input)? else { return Ok(()) };
                    let line = std::str::from_utf8(&raw).map_err(|_| match self.dir {
                        Direction::Request => RelayError::http(400, "invalid request line"),
                        Direction::Response => RelayError::http(500, "invalid response line"),
                    })?;
                    self.begin_message(line, out, ctx)?;
                }
                HttpState::Headers => {
                    let Some(raw) = take_line(input)? else { return Ok(()) };
                    if raw.is_empty() {
                        self.end_headers(out, ctx)?;
                    } else if let Ok(line) = std::str::from_utf8(&raw) {
                        self.header_line(line, out, ctx)?;
                    } else {
                        // Raw bytes pass through untouched; rules only see
                        // parseable lines.
                        out.extend_from_slice(&raw);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                HttpState::Body(remaining) => {
                    let take = remaining.min(input.len() as u64) as usize;
                    if take == 0 {
                        return Ok(());
                    }
                    out.extend_from_slice(&input.split_to(take));
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.complete();
                    } else {
                        self.state = HttpState::Body(left);
                    }
                }
                HttpState::ChunkSize => {
                    let Some(raw) = take_line(input)? else { return Ok(()) };
                    let line = std::str::from_utf8(&raw)
                        .map_err(|_| RelayError::http(500, "invalid chunk size"))?;
                    let hex = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(hex, 16)
                        .map_err(|_| RelayError::http(500, "invalid chunk size"))?;
                    out.extend_from_slice(line.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    self.state = if size == 0 { HttpState::Trailer } else { HttpState::ChunkData(size) };
                }
                HttpState::ChunkData(remaining) => {
                    let take = remaining.min(input.len() as u64) as usize;
                    if take == 0 {
                        return Ok(());
                    }
                    out.extend_from_slice(&input.split_to(take));
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = HttpState::ChunkCrlf;
                    } else {
                        self.state = HttpState::ChunkData(left);
                    }
                }
                HttpState::ChunkCrlf => {
                    let Some(raw) = take_line(input)? else { return Ok(()) };
                    if !raw.is_empty() {
                        return Err(RelayError::http(500, "invalid chunk delimiter"));
                    }
                    out.extend_from_slice(b"\r\n");
                    self.state = HttpState::ChunkSize;
                }
                HttpState::Trailer => {
                    let Some(raw) = take_line(input)? else { return Ok(()) };
                    out.extend_from_slice(&raw);
                    out.extend_from_slice(b"\r\n");
                    if raw.is_empty() {
                        self.complete();
                    }
                }
                HttpState::Passthrough => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    out.extend_from_slice(&input.split_to(input.len()));
                }
            }
        }
    }

    fn begin_message(
        &mut self,
        line: &str,
        out: &mut BytesMut,
        ctx: &mut EvalCtx<'_>,
    ) -> Result<(), RelayError> {
        // Fresh per-message rule state.
        self.eval = RuleEval::new(Arc::clone(&self.tree));
        self.content_length = None;
        self.chunked = false;

        match self.dir {
            Direction::Request => {
                let mut parts = line.split_ascii_whitespace();
                let (Some(_method), Some(target), Some(version)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(RelayError::http(400, "invalid request line"));
                };
                if !version.starts_with("HTTP/1.") {
                    return Err(RelayError::http(400, "unsupported protocol version"));
                }
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r\n");

                let (path, query) = match target.split_once('?') {
                    Some((p, q)) => (p, q),
                    None => (target, ""),
                };
                let mut extra = Vec::new();
                self.eval.apply(RuleElement::Path, path, query, ctx, &mut extra)?;
                if !query.is_empty() && self.tree.has_element(RuleElement::Query) {
                    for pair in query.split('&') {
                        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                        self.eval.apply(RuleElement::Query, k, v, ctx, &mut extra)?;
                    }
                }
            }
            Direction::Response => {
                let mut parts = line.split_ascii_whitespace();
                let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
                    return Err(RelayError::http(500, "invalid response line"));
                };
                if !version.starts_with("HTTP/1.") || code.parse::<u16>().is_err() {
                    return Err(RelayError::http(500, "invalid response line"));
                }
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        self.state = HttpState::Headers;
        Ok(())
    }

    fn header_line(
        &mut self,
        line: &str,
        out: &mut BytesMut,
        ctx: &mut EvalCtx<'_>,
    ) -> Result<(), RelayError> {
        let Some((key, raw_value)) = line.split_once(':') else {
            // No key to match a rule against (continuation lines, junk);
            // forwarded verbatim.
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
            return Ok(());
        };
        let value = raw_value.trim();

        if key.eq_ignore_ascii_case("content-length") {
            // Chunked encoding overrides any length header.
            if !self.chunked {
                let n = value
                    .parse::<u64>()
                    .map_err(|_| RelayError::http(500, "invalid content length"))?;
                self.content_length = Some(n);
            }
        } else if key.eq_ignore_ascii_case("transfer-encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                self.chunked = true;
                self.content_length = None;
            }
        }

        let mut extra = Vec::new();
        if self.tree.has_element(RuleElement::Cookie) {
            match self.dir {
                Direction::Request if key.eq_ignore_ascii_case("cookie") => {
                    for pair in value.split(';') {
                        let (k, v) = pair.trim().split_once('=').unwrap_or((pair.trim(), ""));
                        self.eval.apply(RuleElement::Cookie, k, v, ctx, &mut extra)?;
                    }
                }
                Direction::Response if key.eq_ignore_ascii_case("set-cookie") => {
                    let first = value.split(';').next().unwrap_or(value);
                    let (k, v) = first.trim().split_once('=').unwrap_or((first.trim(), ""));
                    self.eval.apply(RuleElement::Cookie, k, v, ctx, &mut extra)?;
                }
                _ => {}
            }
        }

        let disposition = self.eval.apply(RuleElement::Header, key, value, ctx, &mut extra)?;
        if disposition == Disposition::Forward {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for header in extra {
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Ok(())
    }

    fn end_headers(&mut self, out: &mut BytesMut, ctx: &mut EvalCtx<'_>) -> Result<(), RelayError> {
        let mut extra = Vec::new();
        self.eval.finish(ctx, &mut extra)?;
        for header in extra {
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if self.chunked {
            self.state = HttpState::ChunkSize;
        } else {
            match (self.content_length.take(), self.dir) {
                // A zero-length body ends the message at the header
                // boundary; the engine is immediately ready for the next
                // request line.
                (Some(0), _) | (None, Direction::Request) => self.complete(),
                (Some(n), _) => self.state = HttpState::Body(n),
                (None, Direction::Response) => self.state = HttpState::Passthrough,
            }
        }
        Ok(())
    }

    fn complete(&mut self) {
        self.messages += 1;
        self.state = HttpState::FirstLine;
        self.content_length = None;
        self.chunked = false;
    }
}

/// Pull one CRLF (or bare LF) terminated line off the buffer, as raw bytes
/// so undecodable content survives the trip unmodified.
fn take_line(input: &mut BytesMut) -> Result<Option<BytesMut>, RelayError> {
    let Some(pos) = input.iter().position(|&b| b == b'\n') else {
        if input.len() > MAX_LINE {
            return Err(RelayError::http(413, "header line too long"));
        }
        return Ok(None);
    };
    if pos > MAX_LINE {
        return Err(RelayError::http(413, "header line too long"));
    }
    let mut line = input.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Ok(Some(line))
}
