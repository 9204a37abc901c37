//! File configuration for relays, backend tables and protocol rule sets.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::http::rules::{RuleAction, RuleDirection, RuleElement};

/// Descriptors kept free below the inflight limit so that log files,
/// config reloads and the listeners themselves always have headroom.
pub const FD_RESERVE: usize = 5;

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_SESSIONS: usize = 1024;
pub const DEFAULT_INFLIGHT_LIMIT: usize = 1024 - FD_RESERVE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
    #[serde(default)]
    pub protocols: HashMap<String, ProtocolConfig>,
    /// Hard cap on concurrent sessions across the worker.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Upper bound on outstanding accept-to-connect descriptor credits.
    #[serde(default = "default_inflight")]
    pub max_inflight: usize,
    /// Statistics emission interval in seconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_inflight() -> usize {
    DEFAULT_INFLIGHT_LIMIT
}

fn default_stats_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub name: String,
    pub listen: SocketAddr,
    /// Name of a protocol block; a missing entry means plain TCP defaults.
    #[serde(default)]
    pub protocol: Option<String>,
    pub forward: ForwardConfig,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub proxy_protocol: Option<ProxyHeaderVersion>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Bind outbound sockets to the original client address. Requires the
    /// privileged bind-any helper.
    #[serde(default)]
    pub transparent: bool,
    /// Number of retries granted to sessions forwarded to a direct target.
    #[serde(default)]
    pub retry: u32,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where sessions are forwarded: a health-checked table or a fixed target.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub table: Option<String>,
    /// Fallback table consulted when the primary table is down.
    #[serde(default)]
    pub backup: Option<String>,
    #[serde(default)]
    pub to: Option<SocketAddr>,
    pub port: u16,
    #[serde(default)]
    pub mode: DestMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestMode {
    #[default]
    RoundRobin,
    Random,
    SourceHash,
    Hash,
    LoadBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyHeaderVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub hosts: Vec<HostConfig>,
    /// Whether an external health check gates this table. Without a check
    /// every host is treated as eligible.
    #[serde(default)]
    pub check: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub address: IpAddr,
    #[serde(default)]
    pub retry: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub kind: ProtocolKind,
    /// Disable the splice fast path for this protocol.
    #[serde(default)]
    pub no_splice: bool,
    /// Send synthesized HTTP error documents on abort.
    #[serde(default = "default_true")]
    pub return_error: bool,
    /// CSS applied to the error document.
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Tcp,
    Http,
    Dns,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub direction: RuleDirection,
    #[serde(default)]
    pub element: RuleElement,
    pub action: RuleAction,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Tag set by a `mark` action, or required by a mark-conditioned rule.
    #[serde(default)]
    pub mark: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Terminate TLS toward the client with this certificate chain.
    #[serde(default)]
    pub accept: Option<TlsKeyPairConfig>,
    /// Speak TLS toward the backend.
    #[serde(default)]
    pub connect: bool,
    /// Verify the backend certificate on the connect side.
    #[serde(default)]
    pub verify_backend: bool,
    /// SSL inspection: impersonate the backend toward the client using
    /// leaf certificates forged under this signing key.
    #[serde(default)]
    pub inspect: Option<TlsKeyPairConfig>,
    #[serde(default)]
    pub min_version: Option<TlsVersion>,
    #[serde(default)]
    pub session_cache: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsKeyPairConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "tls12")]
    Tls12,
    #[serde(rename = "tls13")]
    Tls13,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("JANUS_CONFIG").unwrap_or_else(|_| "janus.yaml".to_string());
        Self::from_file(&path)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {path}"))?;
        let cfg: Config = serde_yaml::from_str(&raw).context("parsing config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for relay in &self.relays {
            if relay.forward.table.is_none() && relay.forward.to.is_none() {
                anyhow::bail!("relay {}: no forward table or target", relay.name);
            }
            if let Some(table) = &relay.forward.table {
                if !self.tables.contains_key(table) {
                    anyhow::bail!("relay {}: unknown table {table}", relay.name);
                }
            }
            if let Some(backup) = &relay.forward.backup {
                if !self.tables.contains_key(backup) {
                    anyhow::bail!("relay {}: unknown backup table {backup}", relay.name);
                }
            }
            if let Some(proto) = &relay.protocol {
                if !self.protocols.contains_key(proto) {
                    anyhow::bail!("relay {}: unknown protocol {proto}", relay.name);
                }
            }
            if let Some(tls) = &relay.tls {
                if tls.inspect.is_some() && tls.accept.is_some() {
                    anyhow::bail!(
                        "relay {}: tls accept and inspect are mutually exclusive",
                        relay.name
                    );
                }
            }
        }
        for (name, table) in &self.tables {
            if table.hosts.is_empty() {
                anyhow::bail!("table {name}: no hosts");
            }
        }
        Ok(())
    }

    pub fn protocol(&self, relay: &RelayConfig) -> ProtocolConfig {
        relay
            .protocol
            .as_deref()
            .and_then(|name| self.protocols.get(name))
            .cloned()
            .unwrap_or_else(|| ProtocolConfig {
                kind: ProtocolKind::Tcp,
                no_splice: false,
                return_error: true,
                style: None,
                rules: Vec::new(),
            })
    }
}
