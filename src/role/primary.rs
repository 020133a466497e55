//! Primary Liveness Registration
//!
//! While a node is primary it re-publishes the deployment's liveness key
//! every tick. The key is leased, so renewal keeps it alive and a dead
//! primary's key expires on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::CoordinationSession;
use crate::error::Result;
use crate::node::NodeContext;

/// Value stored under the liveness key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryRecord {
    /// Node currently holding the primary role
    pub node_id: String,
    /// Address the primary advertises
    #[serde(default)]
    pub address: String,
    /// When this node became primary
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl PrimaryRecord {
    /// Record naming `node` as primary since `since`
    pub fn for_node(node: &NodeContext, since: DateTime<Utc>) -> Self {
        Self {
            node_id: node.id.clone(),
            address: node.advertise_address.clone(),
            since: Some(since),
        }
    }

    /// Decode a stored value. Values written by other tooling are kept as
    /// an opaque identity.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            node_id: raw.to_string(),
            address: String::new(),
            since: None,
        })
    }

    /// Same node at the same address, regardless of `since`
    pub fn same_identity(&self, other: &PrimaryRecord) -> bool {
        self.node_id == other.node_id && self.address == other.address
    }

    /// Whether this record names `node`
    pub fn names(&self, node: &NodeContext) -> bool {
        self.node_id == node.id && self.address == node.advertise_address
    }
}

/// Publishes the liveness key while this node is primary
#[derive(Debug, Clone)]
pub struct PrimaryRegistrar {
    key: String,
    ttl_secs: u64,
    since: Option<DateTime<Utc>>,
}

impl PrimaryRegistrar {
    /// Create a registrar for `key` with a lease of `ttl_secs` (0 = no lease)
    pub fn new(key: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            key: key.into(),
            ttl_secs,
            since: None,
        }
    }

    /// The liveness key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease duration in seconds
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Start a new primary term; the next record carries a fresh `since`
    pub fn begin_term(&mut self) {
        self.since = Some(Utc::now());
    }

    /// The record this node publishes
    pub fn record(&mut self, node: &NodeContext) -> PrimaryRecord {
        let since = *self.since.get_or_insert_with(Utc::now);
        PrimaryRecord::for_node(node, since)
    }

    /// Publish or renew the liveness key. Idempotent: every call targets the
    /// same key with the same value.
    pub async fn register(
        &mut self,
        session: &mut dyn CoordinationSession,
        node: &NodeContext,
    ) -> Result<()> {
        let value = serde_json::to_string(&self.record(node))?;

        if self.ttl_secs == 0 {
            session.set(&self.key, &value, 0).await?;
        } else {
            session.upsert(&self.key, &value, self.ttl_secs).await?;
        }

        tracing::debug!("Renewed liveness key {} (ttl {}s)", self.key, self.ttl_secs);
        Ok(())
    }

    /// Remove the liveness key if it still names this node. Returns whether
    /// a key was deleted.
    pub async fn resign(
        &self,
        session: &mut dyn CoordinationSession,
        node: &NodeContext,
    ) -> Result<bool> {
        let Some(entry) = session.get(&self.key).await? else {
            return Ok(false);
        };

        if !PrimaryRecord::decode(&entry.value_str()).names(node) {
            tracing::info!(
                "Liveness key {} names another node, leaving it in place",
                self.key
            );
            return Ok(false);
        }

        session.compare_and_delete(&self.key, entry.mod_revision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Connector, MemoryStore, StoreOp};

    fn node() -> NodeContext {
        NodeContext::new("redis-0", "10.0.0.5:6379")
    }

    #[tokio::test]
    async fn test_repeated_register_keeps_one_key() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut registrar = PrimaryRegistrar::new("/ns-ha-default-resource", 10);

        for _ in 0..5 {
            registrar.register(session.as_mut(), &node()).await.unwrap();
        }

        assert_eq!(store.keys(), vec!["/ns-ha-default-resource".to_string()]);
        let upserts: Vec<_> = store
            .ops()
            .into_iter()
            .filter(|op| matches!(op, StoreOp::Upsert { .. }))
            .collect();
        assert_eq!(upserts.len(), 5);
        // Every renewal writes the same value
        assert!(upserts.windows(2).all(|w| w[0] == w[1]));

        let record = PrimaryRecord::decode(&store.value("/ns-ha-default-resource").unwrap());
        assert!(record.names(&node()));
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_set() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut registrar = PrimaryRegistrar::new("/k", 0);

        registrar.register(session.as_mut(), &node()).await.unwrap();
        assert!(matches!(store.ops()[1], StoreOp::Set { ttl_secs: 0, .. }));
    }

    #[tokio::test]
    async fn test_rejected_write_is_reported() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut registrar = PrimaryRegistrar::new("/k", 10);
        store.reject_writes(true);

        let err = registrar.register(session.as_mut(), &node()).await.unwrap_err();
        assert!(!err.is_link_failure());
        assert!(store.value("/k").is_none());
    }

    #[tokio::test]
    async fn test_resign_only_removes_own_key() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let registrar = PrimaryRegistrar::new("/k", 10);

        let other = PrimaryRecord {
            node_id: "redis-1".to_string(),
            address: "10.0.0.6:6379".to_string(),
            since: None,
        };
        store.put_external("/k", &serde_json::to_string(&other).unwrap(), 10);
        assert!(!registrar.resign(session.as_mut(), &node()).await.unwrap());
        assert!(store.value("/k").is_some());

        let mut registrar = registrar;
        registrar.register(session.as_mut(), &node()).await.unwrap();
        assert!(registrar.resign(session.as_mut(), &node()).await.unwrap());
        assert!(store.value("/k").is_none());
    }

    #[test]
    fn test_decode_opaque_value() {
        let record = PrimaryRecord::decode("value");
        assert_eq!(record.node_id, "value");
        assert!(record.address.is_empty());
        assert!(record.since.is_none());
    }
}
