//! HaLink Configuration
//!
//! This module provides configuration structures for the coordination-store
//! link of a replicated Redis node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding `coordination.address`
pub const ENV_COORDINATION_ADDR: &str = "ETCD_ADDR";

/// Environment variable overriding `node.upstream`
pub const ENV_UPSTREAM: &str = "HALINK_UPSTREAM";

/// Main HaLink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaLinkConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Liveness key and cron configuration
    #[serde(default)]
    pub ha: HaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address replicas and clients use to reach this node
    pub advertise_address: String,

    /// Upstream (master) address; present means this node is a replica
    #[serde(default)]
    pub upstream: Option<String>,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Comma-separated endpoint list; absent disables the link entirely
    #[serde(default)]
    pub address: Option<String>,

    /// Session creation timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// TLS material (plain connection when absent)
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS material locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,

    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,

    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

/// Liveness key and cron configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Deployment namespace used in the liveness key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Resource name used in the liveness key
    #[serde(default = "default_resource")]
    pub resource: String,

    /// Lease duration of the liveness key in seconds (0 = no lease)
    #[serde(default = "default_key_ttl_secs")]
    pub key_ttl_secs: u64,

    /// Cron tick interval in milliseconds
    #[serde(default = "default_cron_interval_ms")]
    pub cron_interval_ms: u64,

    /// Stale liveness key left by a previous deployment, reclaimed once safe
    #[serde(default)]
    pub previous_key: Option<String>,

    /// Grace window before a stale key may be deleted, in seconds
    #[serde(default = "default_reclaim_grace_secs")]
    pub reclaim_grace_secs: u64,

    /// Remove our own liveness key on clean shutdown
    #[serde(default = "default_true")]
    pub resign_on_shutdown: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    500
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("/usr/bin/etcd-ca.crt")
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("/usr/bin/etcd-client.crt")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/usr/bin/etcd-key.crt")
}

fn default_namespace() -> String {
    "sys-redis".to_string()
}

fn default_resource() -> String {
    "redis-test".to_string()
}

fn default_key_ttl_secs() -> u64 {
    10
}

fn default_cron_interval_ms() -> u64 {
    1000
}

fn default_reclaim_grace_secs() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            tls: None,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: default_ca_file(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            resource: default_resource(),
            key_ttl_secs: default_key_ttl_secs(),
            cron_interval_ms: default_cron_interval_ms(),
            previous_key: None,
            reclaim_grace_secs: default_reclaim_grace_secs(),
            resign_on_shutdown: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl HaLinkConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: HaLinkConfig = toml::from_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HaLinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ETCD_ADDR` / `HALINK_UPSTREAM` style overrides.
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_COORDINATION_ADDR).filter(|v| !v.trim().is_empty()) {
            self.coordination.address = Some(addr);
        }
        if let Some(upstream) = lookup(ENV_UPSTREAM).filter(|v| !v.trim().is_empty()) {
            self.node.upstream = Some(upstream);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.advertise_address.is_empty() {
            return Err(crate::Error::Config(
                "node.advertise_address cannot be empty".into(),
            ));
        }

        if self.ha.namespace.is_empty() || self.ha.resource.is_empty() {
            return Err(crate::Error::Config(
                "ha.namespace and ha.resource cannot be empty".into(),
            ));
        }

        if self.ha.cron_interval_ms == 0 {
            return Err(crate::Error::Config("ha.cron_interval_ms must be > 0".into()));
        }

        // Each request must fit in one tick; the tick as a whole is cut off at the cron interval
        if self.coordination.request_timeout_ms >= self.ha.cron_interval_ms
            || self.coordination.connect_timeout_ms >= self.ha.cron_interval_ms
        {
            return Err(crate::Error::Config(format!(
                "coordination timeouts ({} ms connect, {} ms request) must be below ha.cron_interval_ms ({} ms)",
                self.coordination.connect_timeout_ms,
                self.coordination.request_timeout_ms,
                self.ha.cron_interval_ms
            )));
        }

        if let Some(previous) = &self.ha.previous_key {
            if previous.is_empty() || *previous == self.liveness_key() {
                return Err(crate::Error::Config(format!(
                    "ha.previous_key must name a key other than {}",
                    self.liveness_key()
                )));
            }
        }

        if self.ha.reclaim_grace_secs < self.ha.key_ttl_secs {
            return Err(crate::Error::Config(
                "ha.reclaim_grace_secs must be at least ha.key_ttl_secs".into(),
            ));
        }

        Ok(())
    }

    /// The primary liveness key for this deployment
    pub fn liveness_key(&self) -> String {
        format!("/{}-ha-default-{}", self.ha.namespace, self.ha.resource)
    }

    /// Prefix covering every HA key of this namespace
    pub fn namespace_prefix(&self) -> String {
        format!("/{}-ha-", self.ha.namespace)
    }

    /// Whether the coordination link is enabled at all
    pub fn coordination_enabled(&self) -> bool {
        self.coordination.address.is_some()
    }

    /// Get cron interval as Duration
    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.ha.cron_interval_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.request_timeout_ms)
    }

    /// Get the stale-key grace window as Duration
    pub fn reclaim_grace(&self) -> Duration {
        Duration::from_secs(self.ha.reclaim_grace_secs)
    }
}
