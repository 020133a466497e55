//! Cron Step
//!
//! `HaLink::cron_step` is called by the host once per fixed interval. Each
//! call does a bounded amount of work: allocate the link, or attempt one
//! connection, or run the role-specific update. The whole tick runs under
//! `LinkSettings::tick_budget`; a tick that overruns is abandoned and the
//! link treated as lost. Nothing it does is surfaced as an error; failures
//! are logged and retried on the next tick, so the cron interval is the only
//! reconnect backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::HaLinkConfig;
use crate::coordination::Connector;
use crate::error::{Error, Result};
use crate::link::{ensure_connected, ConnectOutcome, LinkEvent, LinkState, LinkStatus};
use crate::node::{NodeContext, NodeRole};
use crate::role::{
    try_reclaim_old_primary_path, PrimaryObservation, PrimaryRegistrar, ReclaimOutcome,
    ReplicaWatcher, WatchEvent,
};

/// Settings fixed for the lifetime of a link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Primary liveness key
    pub liveness_key: String,
    /// Lease duration of the liveness key (0 = no lease)
    pub key_ttl_secs: u64,
    /// Stale key to reclaim once safe
    pub previous_key: Option<String>,
    /// Grace window before a stale key may be deleted
    pub reclaim_grace: Duration,
    /// Remove our own liveness key on shutdown
    pub resign_on_shutdown: bool,
    /// Upper bound on the duration of one tick
    pub tick_budget: Duration,
}

impl LinkSettings {
    /// Settings for `liveness_key` with default lease and grace
    pub fn new(liveness_key: impl Into<String>) -> Self {
        Self {
            liveness_key: liveness_key.into(),
            key_ttl_secs: 10,
            previous_key: None,
            reclaim_grace: Duration::from_secs(20),
            resign_on_shutdown: true,
            tick_budget: Duration::from_secs(1),
        }
    }

    /// Settings from loaded configuration
    pub fn from_config(config: &HaLinkConfig) -> Self {
        Self {
            liveness_key: config.liveness_key(),
            key_ttl_secs: config.ha.key_ttl_secs,
            previous_key: config.ha.previous_key.clone(),
            reclaim_grace: config.reclaim_grace(),
            resign_on_shutdown: config.ha.resign_on_shutdown,
            tick_budget: config.cron_interval(),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No coordination address configured
    Disabled,
    /// Link state created; work starts next tick
    Allocated,
    /// Asynchronous connect in flight
    Waiting,
    /// Connection attempt failed
    ConnectFailed,
    /// Connection established this tick
    Connected,
    /// Primary: liveness key published
    Registered,
    /// Primary: publishing failed
    RegistrationFailed,
    /// Replica: liveness key polled
    Observed(WatchEvent),
    /// Replica: poll failed
    ObserveFailed,
    /// Tick overran its budget and was abandoned
    TimedOut,
}

/// The coordination-store link of one node
pub struct HaLink {
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    link: Option<LinkState>,
    registrar: PrimaryRegistrar,
    watcher: ReplicaWatcher,
    last_role: Option<NodeRole>,
    last_reclaim: Option<ReclaimOutcome>,
}

impl HaLink {
    /// Create a link that opens sessions through `connector`
    pub fn new(connector: Arc<dyn Connector>, settings: LinkSettings) -> Self {
        Self {
            connector,
            registrar: PrimaryRegistrar::new(settings.liveness_key.clone(), settings.key_ttl_secs),
            watcher: ReplicaWatcher::new(settings.liveness_key.clone()),
            settings,
            link: None,
            last_role: None,
            last_reclaim: None,
        }
    }

    /// Link settings
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Link state, once allocated
    pub fn link(&self) -> Option<&LinkState> {
        self.link.as_ref()
    }

    /// Link status, once allocated
    pub fn status(&self) -> Option<LinkStatus> {
        self.link.as_ref().map(LinkState::status)
    }

    /// Observations of the primary made while this node is a replica
    pub fn subscribe(&self) -> watch::Receiver<PrimaryObservation> {
        self.watcher.subscribe()
    }

    /// Outcome of the most recent stale-key reclaim attempt
    pub fn last_reclaim(&self) -> Option<&ReclaimOutcome> {
        self.last_reclaim.as_ref()
    }

    /// Run one tick
    pub async fn cron_step(&mut self, node: &NodeContext) -> TickOutcome {
        if node.coordination().is_none() {
            return TickOutcome::Disabled;
        }

        let budget = self.settings.tick_budget;
        let result = timeout(budget, self.step(node)).await;
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("Tick exceeded its {:?} budget, abandoning it", budget);
                if let Some(link) = self.link.as_mut() {
                    let event = match link.status() {
                        LinkStatus::Connected => LinkEvent::LinkLost,
                        _ => LinkEvent::ConnectFailed,
                    };
                    link.apply(event);
                }
                TickOutcome::TimedOut
            }
        }
    }

    async fn step(&mut self, node: &NodeContext) -> TickOutcome {
        let Some(target) = node.coordination() else {
            return TickOutcome::Disabled;
        };

        match ensure_connected(&mut self.link, self.connector.as_ref(), target).await {
            ConnectOutcome::Allocated => {
                self.on_allocated(node);
                return TickOutcome::Allocated;
            }
            ConnectOutcome::Waiting => return TickOutcome::Waiting,
            ConnectOutcome::Failed => return TickOutcome::ConnectFailed,
            ConnectOutcome::Connected => return TickOutcome::Connected,
            ConnectOutcome::AlreadyConnected => {}
        }

        let role = node.role();
        self.note_role(node, role);

        let HaLink {
            link,
            registrar,
            watcher,
            settings,
            last_reclaim,
            ..
        } = self;

        let Some(link) = link.as_mut() else {
            return TickOutcome::Allocated;
        };
        if link.status() != LinkStatus::Connected {
            return TickOutcome::Waiting;
        }
        let Some(session) = link.session_mut() else {
            link.apply(LinkEvent::LinkLost);
            return TickOutcome::ConnectFailed;
        };

        match role {
            NodeRole::Primary => {
                let outcome = match registrar.register(session, node).await {
                    Ok(()) => TickOutcome::Registered,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to publish liveness key {}: {}",
                            registrar.key(),
                            e
                        );
                        Self::check_link(link, &e);
                        TickOutcome::RegistrationFailed
                    }
                };

                if link.status() == LinkStatus::Connected && link.stale_key().is_some() {
                    match try_reclaim_old_primary_path(link, settings.reclaim_grace, Instant::now())
                        .await
                    {
                        Ok(reclaim) => *last_reclaim = Some(reclaim),
                        Err(e) => {
                            tracing::warn!("Stale primary key reclaim failed: {}", e);
                            Self::check_link(link, &e);
                        }
                    }
                }
                outcome
            }
            NodeRole::Replica => match watcher.observe(session).await {
                Ok(event) => TickOutcome::Observed(event),
                Err(e) => {
                    tracing::warn!("Failed to read liveness key {}: {}", settings.liveness_key, e);
                    Self::check_link(link, &e);
                    TickOutcome::ObserveFailed
                }
            },
        }
    }

    /// Attempt the stale-key reclaim outside the regular tick
    pub async fn try_reclaim_old_primary_path(&mut self) -> Result<ReclaimOutcome> {
        let Some(link) = self.link.as_mut() else {
            return Ok(ReclaimOutcome::NothingRecorded);
        };
        if link.stale_key().is_some() && link.status() != LinkStatus::Connected {
            return Err(Error::Unavailable(format!("link is {}", link.status())));
        }

        let outcome =
            try_reclaim_old_primary_path(link, self.settings.reclaim_grace, Instant::now()).await?;
        self.last_reclaim = Some(outcome.clone());
        Ok(outcome)
    }

    /// Resign the liveness key if configured and release the session
    pub async fn shutdown(&mut self, node: &NodeContext) {
        let Some(mut link) = self.link.take() else {
            return;
        };

        if link.status() == LinkStatus::Connected
            && node.role() == NodeRole::Primary
            && self.settings.resign_on_shutdown
        {
            if let Some(session) = link.session_mut() {
                match self.registrar.resign(session, node).await {
                    Ok(true) => tracing::info!("Resigned liveness key {}", self.registrar.key()),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        "Failed to resign liveness key {}: {}",
                        self.registrar.key(),
                        e
                    ),
                }
            }
        }

        if let Some(mut session) = link.take_session() {
            if let Err(e) = session.close().await {
                tracing::warn!("Failed to close coordination session: {}", e);
            }
        }
        self.last_role = None;
        tracing::info!("Coordination link for node {} released", node.id);
    }

    fn on_allocated(&mut self, node: &NodeContext) {
        tracing::info!(
            "Coordination link created for node {} (liveness key {})",
            node.id,
            self.settings.liveness_key
        );
        self.schedule_previous_key();
    }

    /// Record the configured stale key for reclaim after one grace window
    fn schedule_previous_key(&mut self) {
        if let (Some(link), Some(previous)) = (self.link.as_mut(), &self.settings.previous_key) {
            link.record_stale_key(previous.clone(), Instant::now() + self.settings.reclaim_grace);
            tracing::info!(
                "Stale primary key {} will be reclaimed no earlier than {:?} from now",
                previous,
                self.settings.reclaim_grace
            );
        }
    }

    fn note_role(&mut self, node: &NodeContext, role: NodeRole) {
        if self.last_role == Some(role) {
            return;
        }

        match self.last_role {
            Some(previous) => {
                tracing::info!("Node {} role changed: {} -> {}", node.id, previous, role)
            }
            None => tracing::info!("Node {} running as {}", node.id, role),
        }

        match role {
            NodeRole::Primary => {
                self.registrar.begin_term();
                self.watcher.reset();
                if self.last_role == Some(NodeRole::Replica) {
                    self.schedule_previous_key();
                }
            }
            NodeRole::Replica => {}
        }
        self.last_role = Some(role);
    }

    fn check_link(link: &mut LinkState, error: &Error) {
        if error.is_link_failure() {
            link.apply(LinkEvent::LinkLost);
            tracing::warn!("Lost coordination link, reconnecting on next tick");
        }
    }
}
