//! HaLink - Coordination-Store Link for Replicated Redis
//!
//! Keeps one Redis node of a replicated deployment connected to an etcd
//! cluster and drives a small periodic state machine from the host's cron
//! tick.
//!
//! # Architecture
//!
//! The host calls `HaLink::cron_step` once per fixed interval. Each tick does
//! a bounded amount of work: allocate the link, attempt one connection, or
//! run the role-specific update. The node's role is derived from whether it
//! replicates from an upstream.
//!
//! # Features
//!
//! - Plain or mutually authenticated TLS sessions to etcd
//! - Leased primary liveness key, renewed every tick
//! - Replica-side observation of the primary published on a watch channel
//! - Revision-checked reclaim of a stale key left by a previous deployment
//! - Resign on clean shutdown

pub mod config;
pub mod coordination;
pub mod cron;
pub mod error;
pub mod link;
pub mod node;
pub mod role;

pub use config::HaLinkConfig;
pub use cron::{HaLink, LinkSettings, TickOutcome};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::HaLinkConfig;
    pub use crate::coordination::{Connector, CoordinationSession, EtcdConnector};
    pub use crate::cron::{HaLink, LinkSettings, TickOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::link::LinkStatus;
    pub use crate::node::{NodeContext, NodeRole};
    pub use crate::role::{PrimaryObservation, PrimaryRecord, WatchEvent};
}
