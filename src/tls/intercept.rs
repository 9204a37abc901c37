//! Leaf certificate forging for TLS inspection.
//!
//! When a relay inspects TLS it first completes the backend handshake,
//! reads the backend's presented certificate, and mints a fresh leaf that
//! mirrors its subject and names, signed by the relay's local CA. The
//! client sees the backend's identity under the inspection CA's trust.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::parse_x509_certificate;

/// The signing CA plus its original DER, appended to every forged chain.
pub struct Inspector {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
}

impl Inspector {
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("reading inspection ca {}", cert_path.display()))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("reading inspection key {}", key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem).context("parsing inspection ca key")?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .context("parsing inspection ca certificate")?;
        let ca_cert = params.self_signed(&ca_key).context("rebuilding inspection ca")?;
        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .context("no certificate in inspection ca pem")?
            .context("decoding inspection ca pem")?;
        Ok(Self { ca_cert, ca_key, ca_der })
    }

    /// Forge a leaf mirroring the backend certificate's common name, SANs
    /// and validity window, with a random serial and a fresh keypair.
    pub fn derive_leaf(
        &self,
        backend: &CertificateDer<'_>,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let (_, parsed) =
            parse_x509_certificate(backend.as_ref()).context("parsing backend certificate")?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .context("leaf certificate parameters")?;

        let mut dn = DistinguishedName::new();
        if let Some(cn) = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            dn.push(DnType::CommonName, cn);
        }
        params.distinguished_name = dn;

        for ext in parsed.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => {
                            params
                                .subject_alt_names
                                .push(SanType::DnsName((*dns).try_into().context("leaf san")?));
                        }
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                params.subject_alt_names.push(SanType::IpAddress(ip));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Ok(not_before) =
            OffsetDateTime::from_unix_timestamp(parsed.validity().not_before.timestamp())
        {
            params.not_before = not_before;
        }
        if let Ok(not_after) =
            OffsetDateTime::from_unix_timestamp(parsed.validity().not_after.timestamp())
        {
            params.not_after = not_after;
        }
        params.serial_number =
            Some(SerialNumber::from_slice(&rand::random::<u64>().to_be_bytes()));

        let leaf_key = KeyPair::generate().context("leaf keypair")?;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .context("signing forged leaf")?;

        let chain = vec![leaf.der().clone(), self.ca_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((chain, key))
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
