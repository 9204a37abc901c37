use std::io;

/// Failure taxonomy for the relay core.
///
/// Variants map to distinct recovery policies: transient resource errors are
/// deferred and retried, backend errors consume the session retry budget,
/// protocol errors abort the session with a client-facing error document, and
/// client I/O errors tear the session down silently.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no active hosts")]
    NoActiveHosts,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("forward failed: {0}")]
    Forward(io::Error),

    #[error("descriptor exhaustion")]
    FdExhausted,

    #[error("session limit reached")]
    SessionLimit,

    #[error("{reason}")]
    Protocol { code: u16, reason: String, label: Option<String> },

    #[error("tls handshake: {0}")]
    Tls(String),

    #[error("session aborted: {0}")]
    Aborted(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Synthesized HTTP error for a protocol-level abort.
    pub fn http(code: u16, reason: impl Into<String>) -> Self {
        RelayError::Protocol { code, reason: reason.into(), label: None }
    }

    pub fn http_labeled(code: u16, reason: impl Into<String>, label: impl Into<String>) -> Self {
        RelayError::Protocol { code, reason: reason.into(), label: Some(label.into()) }
    }

    /// HTTP status code a client should see for this failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RelayError::Protocol { code, .. } => Some(*code),
            RelayError::ConnectTimeout | RelayError::FdExhausted => Some(504),
            RelayError::Forward(_) => Some(502),
            RelayError::NoActiveHosts => Some(503),
            RelayError::Tls(_) => None,
            _ => None,
        }
    }

    /// Transient resource errors are deferred with backoff, never surfaced
    /// to the client unless the deferral budget runs out.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::FdExhausted)
    }
}

/// EMFILE/ENFILE detection for accept and dial paths.
pub fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23) | Some(24))
}
