//! Host Node Interface
//!
//! The slice of the host's configuration the link needs on every tick.
//! It is passed explicitly into each operation instead of being reachable
//! from the link state.

use crate::config::{HaLinkConfig, TlsConfig};

/// Role of the data-store node, derived from its upstream setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// No upstream configured; accepts writes
    Primary,
    /// Replicates from an upstream
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Where and how to reach the coordination store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationTarget {
    /// Comma-separated endpoint list
    pub address: String,
    /// TLS material locations (plain connection when absent)
    pub tls: Option<TlsConfig>,
}

/// Host node context
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Node identifier published in the liveness record
    pub id: String,
    /// Address published in the liveness record
    pub advertise_address: String,
    coordination: Option<CoordinationTarget>,
    upstream: Option<String>,
}

impl NodeContext {
    /// Create a context with no coordination store and no upstream
    pub fn new(id: impl Into<String>, advertise_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            advertise_address: advertise_address.into(),
            coordination: None,
            upstream: None,
        }
    }

    /// Build the context from loaded configuration
    pub fn from_config(config: &HaLinkConfig) -> Self {
        let coordination = config
            .coordination
            .address
            .as_ref()
            .map(|address| CoordinationTarget {
                address: address.clone(),
                tls: config.coordination.tls.clone(),
            });

        Self {
            id: config.node.id.clone(),
            advertise_address: config.node.advertise_address.clone(),
            coordination,
            upstream: config.node.upstream.clone(),
        }
    }

    /// Set the coordination store target
    pub fn with_coordination(mut self, target: CoordinationTarget) -> Self {
        self.coordination = Some(target);
        self
    }

    /// Coordination store target, if the link is enabled
    pub fn coordination(&self) -> Option<&CoordinationTarget> {
        self.coordination.as_ref()
    }

    /// Upstream address, if this node replicates from another
    pub fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    /// Point this node at a new upstream (`None` promotes it)
    pub fn set_upstream(&mut self, upstream: Option<String>) {
        self.upstream = upstream;
    }

    /// Current role: primary when no upstream is configured
    pub fn role(&self) -> NodeRole {
        if self.upstream.is_none() {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_follows_upstream() {
        let mut node = NodeContext::new("redis-0", "10.0.0.5:6379");
        assert_eq!(node.role(), NodeRole::Primary);

        node.set_upstream(Some("10.0.0.4:6379".to_string()));
        assert_eq!(node.role(), NodeRole::Replica);

        node.set_upstream(None);
        assert_eq!(node.role(), NodeRole::Primary);
    }

    #[test]
    fn test_from_config_without_address() {
        let config = HaLinkConfig::from_str(
            r#"
[node]
id = "redis-0"
advertise_address = "10.0.0.5:6379"
"#,
        )
        .unwrap();
        let node = NodeContext::from_config(&config);
        assert!(node.coordination().is_none());
        assert_eq!(node.role(), NodeRole::Primary);
    }
}
