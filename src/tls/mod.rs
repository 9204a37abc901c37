//! TLS termination, origination and inspection.
//!
//! Three roles, combinable per relay: `accept` terminates TLS toward the
//! client with a configured keypair, `connect` originates TLS toward the
//! backend, and `inspect` does both at once, impersonating the backend
//! toward the client with a leaf certificate forged under a local signing
//! CA. Handshakes run under the same deadline as the rest of session
//! establishment. Client-initiated renegotiation is rejected at the
//! protocol level by rustls, matching the relay's no-renegotiation policy.

pub mod intercept;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{NoServerSessionStorage, ServerSessionMemoryCache};
use rustls::{ClientConfig, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::timeout_at;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{TlsConfig, TlsVersion};
use crate::error::RelayError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn versions(min: Option<TlsVersion>) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match min {
        Some(TlsVersion::Tls13) => TLS13_ONLY,
        _ => rustls::ALL_VERSIONS,
    }
}

/// Client renegotiation policy for one TLS session.
///
/// rustls refuses renegotiation on the wire, so the relay never has to act
/// on a request; the state machine keeps the per-session policy accounting:
/// one renegotiation is tolerated before the initial handshake completes,
/// everything after that is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Renegotiation {
    #[default]
    Init,
    AllowOnce,
    Deny,
    Allow,
}

impl Renegotiation {
    pub fn new() -> Self {
        Renegotiation::Init
    }

    /// Policy for a session whose initial handshake already completed.
    pub fn post_handshake() -> Self {
        Renegotiation::Deny
    }

    /// The initial handshake finished; later attempts are denied.
    pub fn established(&mut self) {
        if *self != Renegotiation::Allow {
            *self = Renegotiation::Deny;
        }
    }

    /// A renegotiation request arrived; returns whether to permit it.
    pub fn request(&mut self) -> bool {
        match *self {
            Renegotiation::Init => {
                *self = Renegotiation::AllowOnce;
                true
            }
            Renegotiation::AllowOnce | Renegotiation::Deny => {
                *self = Renegotiation::Deny;
                false
            }
            Renegotiation::Allow => true,
        }
    }
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("reading certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificate {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("reading key {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parsing key {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

/// Per-relay TLS material, resolved from configuration at startup.
pub struct TlsContext {
    pub acceptor: Option<TlsAcceptor>,
    pub connector: Option<TlsConnector>,
    pub inspector: Option<intercept::Inspector>,
    min_version: Option<TlsVersion>,
    session_cache: bool,
}

impl TlsContext {
    pub fn from_config(cfg: &TlsConfig) -> anyhow::Result<Self> {
        let mut ctx = Self {
            acceptor: None,
            connector: None,
            inspector: None,
            min_version: cfg.min_version,
            session_cache: cfg.session_cache,
        };

        if let Some(keypair) = &cfg.accept {
            let certs = load_certs(&keypair.cert)?;
            let key = load_key(&keypair.key)?;
            ctx.acceptor = Some(ctx.acceptor_for(certs, key)?);
        }
        if cfg.connect || cfg.inspect.is_some() {
            ctx.connector = Some(connector(cfg.min_version, cfg.verify_backend)?);
        }
        if let Some(signer) = &cfg.inspect {
            ctx.inspector = Some(intercept::Inspector::load(&signer.cert, &signer.key)?);
        }
        Ok(ctx)
    }

    /// Build an acceptor for a specific leaf chain. Used at startup for the
    /// configured `accept` keypair and per session for forged inspection
    /// leaves.
    pub fn acceptor_for(
        &self,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<TlsAcceptor> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(versions(self.min_version))
            .context("tls protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("tls server certificate")?;
        if self.session_cache {
            config.session_storage = ServerSessionMemoryCache::new(1024);
        } else {
            config.session_storage = Arc::new(NoServerSessionStorage {});
        }
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn connector(min: Option<TlsVersion>, verify: bool) -> anyhow::Result<TlsConnector> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(versions(min))
        .context("tls protocol versions")?;
    let config = if verify {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accept-side handshake under the session deadline.
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    deadline: tokio::time::Instant,
) -> Result<ServerTlsStream<TcpStream>, RelayError> {
    match timeout_at(deadline, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(err)) => Err(RelayError::Tls(err.to_string())),
        Err(_) => Err(RelayError::Tls("handshake timeout".to_string())),
    }
}

/// Connect-side handshake under the session deadline. The server name is
/// the backend address; inspection relies on the returned peer certificate.
pub async fn connect(
    connector: &TlsConnector,
    target: SocketAddr,
    stream: TcpStream,
    deadline: tokio::time::Instant,
) -> Result<ClientTlsStream<TcpStream>, RelayError> {
    let name = ServerName::IpAddress(target.ip().into());
    match timeout_at(deadline, connector.connect(name, stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(err)) => Err(RelayError::Tls(err.to_string())),
        Err(_) => Err(RelayError::Tls("handshake timeout".to_string())),
    }
}

/// Backend verifier for relays that originate TLS without a trust
/// requirement (inspection of internal services, self-signed backends).
#[derive(Debug)]
pub struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl InsecureVerifier {
    pub fn new() -> Self {
        Self { provider: provider() }
    }
}

impl Default for InsecureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_version_narrows_protocol_list() {
        let only13 = versions(Some(TlsVersion::Tls13));
        assert_eq!(only13.len(), 1);
        assert_eq!(only13[0].version, rustls::ProtocolVersion::TLSv1_3);
        assert!(std::ptr::eq(versions(None), rustls::ALL_VERSIONS));
        assert!(std::ptr::eq(versions(Some(TlsVersion::Tls12)), rustls::ALL_VERSIONS));
    }

    #[test]
    fn renegotiation_allowed_once_before_completion() {
        let mut policy = Renegotiation::new();
        assert!(policy.request());
        assert_eq!(policy, Renegotiation::AllowOnce);
        assert!(!policy.request());
        assert_eq!(policy, Renegotiation::Deny);
        assert!(!policy.request());
    }

    #[test]
    fn renegotiation_denied_after_handshake() {
        let mut policy = Renegotiation::new();
        policy.established();
        assert_eq!(policy, Renegotiation::Deny);
        assert!(!policy.request());
        assert_eq!(Renegotiation::post_handshake(), Renegotiation::Deny);
    }

    #[test]
    fn unrestricted_policy_survives_completion() {
        let mut policy = Renegotiation::Allow;
        policy.established();
        assert!(policy.request());
        assert!(policy.request());
    }
}
