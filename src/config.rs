//! Proxy configuration: listener specs, engine-wide tunables, and hot
//! reload.
//!
//! Generalizes a hot-reloadable `ConfigManager`/`CycloneConfig` pattern
//! (serde + TOML, `RwLock`-guarded current config, change broadcaster,
//! snapshot history for rollback, pluggable validators) to carry the
//! connection engine's actual tunables instead of generic server/network
//! knobs. Listener fields are ported from
//! `original_source/NIOMan/Classes/utils/opts.h`'s `proxyspec_t`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::info;

/// Protocol tag for one listener. Selection precedence when
/// multiple flags are set is handled by [`crate::proto::select_proto`],
/// not here; this struct only carries what's configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProto {
    Tcp,
    Ssl,
    Http,
    Upgrade,
    Pop3,
    Smtp,
}

/// How a listener discovers its real destination. Ported from
/// `proxyspec_t`'s "connect_addr is set: static mode; natlookup is set:
/// NAT mode" comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DestinationMode {
    /// Statically configured connect address.
    Static(SocketAddr),
    /// NAT-engine tag (e.g. "pf", "iptables") used to look up the original
    /// destination of a redirected connection at accept time.
    Nat(String),
}

/// One listener specification: one OS listening socket, one protocol, one
/// way of discovering the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub proto: ListenerProto,
    pub listen_addr: SocketAddr,
    pub destination: DestinationMode,
    /// SNI lookahead port for TLS, used instead of a synchronous connect
    /// when the listener needs to peek the client's SNI before dialing.
    pub sni_port: Option<u16>,
    /// Divert-mode intermediary address (full MITM hands `dst` here
    /// instead of the origin).
    pub divert_addr: Option<SocketAddr>,
    /// Address the child listener binds when a second hop is required to
    /// re-identify a connection via the SSLproxy header.
    pub return_addr: Option<SocketAddr>,
    /// Full MITM (true) vs. split passthrough of server bytes (false).
    pub divert: bool,
}

impl ListenerSpec {
    pub fn name(&self) -> String {
        format!("{:?}@{}", self.proto, self.listen_addr)
    }
}

/// DNS resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// System-discovered nameservers, read before the hard-coded fallbacks
    /// are appended.
    #[serde(default)]
    pub system_nameservers: Vec<String>,
    /// Hard-coded fallback nameservers, always appended last. Defaults to
    /// `8.8.8.8`/`114.114.114.114` (mobile hosts may expose no system
    /// resolvers) but is configurable.
    #[serde(default = "default_fallback_nameservers")]
    pub fallback_nameservers: Vec<String>,
    #[serde(default = "default_dns_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fallback_nameservers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "114.114.114.114".to_string()]
}

fn default_dns_timeout_secs() -> u64 {
    5
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            system_nameservers: Vec::new(),
            fallback_nameservers: default_fallback_nameservers(),
            timeout_secs: default_dns_timeout_secs(),
        }
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker thread count; `None` means `num_cpus::get()`.
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default = "default_conn_idle_timeout_secs")]
    pub conn_idle_timeout_secs: u64,
    #[serde(default = "default_expired_check_period_secs")]
    pub expired_conn_check_period_secs: u64,
    #[serde(default = "default_stats_period_ticks")]
    pub stats_period_ticks: u64,
    #[serde(default = "default_cache_gc_interval_secs")]
    pub cache_gc_interval_secs: u64,
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,
    #[serde(default = "default_high_watermark_bytes")]
    pub high_watermark_bytes: usize,
    /// Fall back to unintercepted TCP relay if TLS interception fails.
    #[serde(default)]
    pub passthrough_on_tls_failure: bool,
}

fn default_conn_idle_timeout_secs() -> u64 {
    120
}
fn default_expired_check_period_secs() -> u64 {
    10
}
fn default_stats_period_ticks() -> u64 {
    6
}
fn default_cache_gc_interval_secs() -> u64 {
    60
}
fn default_log_queue_capacity() -> usize {
    4096
}
fn default_high_watermark_bytes() -> usize {
    256 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            conn_idle_timeout_secs: default_conn_idle_timeout_secs(),
            expired_conn_check_period_secs: default_expired_check_period_secs(),
            stats_period_ticks: default_stats_period_ticks(),
            cache_gc_interval_secs: default_cache_gc_interval_secs(),
            log_queue_capacity: default_log_queue_capacity(),
            high_watermark_bytes: default_high_watermark_bytes(),
            passthrough_on_tls_failure: false,
        }
    }
}

/// Top-level configuration: listener list plus engine tunables. Option/CLI
/// parsing and rule-file loading live outside this crate; this only models
/// the shape the engine consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Task id inherited by every connection context from global config.
    #[serde(default = "default_task_id")]
    pub task_id: String,
}

fn default_task_id() -> String {
    "relayforge".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NoListeners,
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoListeners => write!(f, "configuration has no listeners"),
            Self::InvalidValue { field, reason } => write!(f, "{field}: {reason}"),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.listeners.is_empty() {
            return Err(ValidationError::NoListeners);
        }
        if self.engine.high_watermark_bytes == 0 {
            return Err(ValidationError::InvalidValue {
                field: "engine.high_watermark_bytes".into(),
                reason: "must be > 0".into(),
            });
        }
        if self.engine.log_queue_capacity == 0 {
            return Err(ValidationError::InvalidValue {
                field: "engine.log_queue_capacity".into(),
                reason: "must be > 0".into(),
            });
        }
        for l in &self.listeners {
            if l.proto == ListenerProto::Ssl && l.sni_port.is_none() {
                if let DestinationMode::Nat(_) = &l.destination {
                    // NAT + SNI lookahead is the common TLS MITM deployment shape;
                    // absence isn't an error, just unusual, so only trace it.
                    tracing::trace!(listener = %l.name(), "SSL listener with NAT destination and no sni_port configured");
                }
            }
        }
        Ok(())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }
}

#[derive(Debug, Clone)]
struct ConfigSnapshot {
    config: ProxyConfig,
    timestamp: SystemTime,
    version: String,
}

/// Owns the live configuration, supports file-based load plus in-process
/// hot-swap with rollback history. File-system watching (a `FileWatcher`
/// polling thread) is not wired to an OS notifier here — `reload()` is the
/// explicit entry point a SIGHUP handler calls; there is no background
/// poll thread.
pub struct ConfigManager {
    current: RwLock<ProxyConfig>,
    config_path: Option<PathBuf>,
    history: RwLock<Vec<ConfigSnapshot>>,
    change_tx: mpsc::Sender<ProxyConfig>,
    change_rx: RwLock<Option<mpsc::Receiver<ProxyConfig>>>,
}

impl ConfigManager {
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = ProxyConfig::load_from_file(&path)?;
        config.validate().map_err(|e| Error::config(e.to_string()))?;
        Ok(Self::with_config(config, Some(path)))
    }

    pub fn with_config(config: ProxyConfig, path: Option<PathBuf>) -> Self {
        let (change_tx, change_rx) = mpsc::channel();
        Self {
            current: RwLock::new(config.clone()),
            config_path: path,
            history: RwLock::new(vec![ConfigSnapshot { config, timestamp: SystemTime::now(), version: "initial".into() }]),
            change_tx,
            change_rx: RwLock::new(Some(change_rx)),
        }
    }

    pub fn get(&self) -> ProxyConfig {
        self.current.read().unwrap().clone()
    }

    /// Re-reads the config file from disk and swaps it in after validation.
    /// The SIGHUP handler in the orchestrator calls this.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Err(Error::config("no config file path to reload from"));
        };
        let new_config = ProxyConfig::load_from_file(path)?;
        self.update(new_config, format!("reload-{}", self.history.read().unwrap().len()))
    }

    pub fn update(&self, new_config: ProxyConfig, version: String) -> Result<()> {
        new_config.validate().map_err(|e| Error::config(e.to_string()))?;
        *self.current.write().unwrap() = new_config.clone();
        self.history.write().unwrap().push(ConfigSnapshot { config: new_config.clone(), timestamp: SystemTime::now(), version });
        let _ = self.change_tx.send(new_config);
        info!("configuration updated");
        Ok(())
    }

    pub fn rollback(&self, version: &str) -> Result<()> {
        let history = self.history.read().unwrap();
        let snapshot = history.iter().rev().find(|s| s.version == version)
            .ok_or_else(|| Error::config(format!("configuration version '{version}' not found")))?
            .clone();
        drop(history);
        *self.current.write().unwrap() = snapshot.config.clone();
        let _ = self.change_tx.send(snapshot.config);
        Ok(())
    }

    /// Takes the change receiver once; subsequent calls return `None`. The
    /// orchestrator's main loop drains this to notice reloads between
    /// `poll_once` ticks.
    pub fn take_change_receiver(&self) -> Option<mpsc::Receiver<ProxyConfig>> {
        self.change_rx.write().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ProxyConfig {
        ProxyConfig {
            listeners: vec![ListenerSpec {
                proto: ListenerProto::Tcp,
                listen_addr: "127.0.0.1:10000".parse().unwrap(),
                destination: DestinationMode::Static("127.0.0.1:20000".parse().unwrap()),
                sni_port: None,
                divert_addr: None,
                return_addr: None,
                divert: true,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn empty_listeners_fails_validation() {
        let config = ProxyConfig::default();
        assert_eq!(config.validate(), Err(ValidationError::NoListeners));
    }

    #[test]
    fn sample_config_validates() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn update_pushes_history_and_broadcasts() {
        let mgr = ConfigManager::with_config(sample_config(), None);
        let rx = mgr.take_change_receiver().unwrap();
        let mut next = sample_config();
        next.task_id = "changed".into();
        mgr.update(next, "v2".into()).unwrap();
        assert_eq!(mgr.get().task_id, "changed");
        assert_eq!(rx.recv().unwrap().task_id, "changed");
    }

    #[test]
    fn rollback_restores_prior_version() {
        let mgr = ConfigManager::with_config(sample_config(), None);
        let mut next = sample_config();
        next.task_id = "changed".into();
        mgr.update(next, "v2".into()).unwrap();
        mgr.rollback("initial").unwrap();
        assert_eq!(mgr.get().task_id, "relayforge");
    }

    #[test]
    fn dns_fallback_defaults_present() {
        let dns = DnsConfig::default();
        assert!(dns.fallback_nameservers.contains(&"8.8.8.8".to_string()));
        assert!(dns.fallback_nameservers.contains(&"114.114.114.114".to_string()));
    }
}
