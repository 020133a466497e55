//! Coordination Store Client
//!
//! The narrow interface the link uses to reach the coordination store.
//! `Connector` creates sessions; a `CoordinationSession` is owned by exactly
//! one link and performs the key operations. Every call must complete in
//! bounded time: implementations enforce their own timeouts.

pub mod etcd;
pub mod memory;

pub use etcd::EtcdConnector;
pub use memory::{MemoryConnector, MemoryStore, StoreOp};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// A key read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Raw value
    pub value: Vec<u8>,
    /// Revision of the last write to this key
    pub mod_revision: i64,
}

impl KeyEntry {
    /// Value as UTF-8 text, lossily decoded
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// PEM-encoded TLS material loaded from disk
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Read the CA, certificate and key files
    pub async fn load(config: &TlsConfig) -> Result<Self> {
        let read = |path: &std::path::Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))
            }
        };

        Ok(Self {
            ca: read(&config.ca_file).await?,
            cert: read(&config.cert_file).await?,
            key: read(&config.key_file).await?,
        })
    }
}

/// Creates sessions to the coordination store
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a plain-text session
    async fn connect_plain(&self, address: &str) -> Result<Box<dyn CoordinationSession>>;

    /// Open a TLS session
    async fn connect_tls(
        &self,
        address: &str,
        tls: &TlsMaterial,
    ) -> Result<Box<dyn CoordinationSession>>;
}

/// One live session to the coordination store
#[async_trait::async_trait]
pub trait CoordinationSession: Send {
    /// Create or renew `key` with a lease of `ttl_secs`.
    /// Repeated calls keep a single key alive.
    async fn upsert(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Overwrite `key`; `ttl_secs == 0` writes it without a lease
    async fn set(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Remove every key under `prefix`, returning how many were deleted
    async fn remove_subtree(&mut self, prefix: &str) -> Result<u64>;

    /// Read a single key
    async fn get(&mut self, key: &str) -> Result<Option<KeyEntry>>;

    /// Delete `key` only if its last write is still `mod_revision`
    async fn compare_and_delete(&mut self, key: &str, mod_revision: i64) -> Result<bool>;

    /// Release the session and anything it holds
    async fn close(&mut self) -> Result<()>;
}
