//! Connection Manager
//!
//! Drives a link from Uninitialized/Disconnected to Connected, one attempt
//! per tick. There is no backoff beyond the cron interval itself.

use super::{LinkEvent, LinkState, LinkStatus};
use crate::coordination::{Connector, CoordinationSession, TlsMaterial};
use crate::error::Result;
use crate::node::CoordinationTarget;

/// What `ensure_connected` did this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Link state was just created; nothing else happens this tick
    Allocated,
    /// An asynchronous connect is in flight
    Waiting,
    /// Session was already up
    AlreadyConnected,
    /// Session established this tick
    Connected,
    /// Attempt failed; retried next tick
    Failed,
}

async fn open_session(
    connector: &dyn Connector,
    target: &CoordinationTarget,
) -> Result<Box<dyn CoordinationSession>> {
    match &target.tls {
        None => connector.connect_plain(&target.address).await,
        Some(tls) => {
            let material = TlsMaterial::load(tls).await?;
            connector.connect_tls(&target.address, &material).await
        }
    }
}

/// Make sure the link has a live session. Idempotent, safe to call every tick;
/// failures are logged and absorbed.
pub async fn ensure_connected(
    slot: &mut Option<LinkState>,
    connector: &dyn Connector,
    target: &CoordinationTarget,
) -> ConnectOutcome {
    if slot.is_none() {
        *slot = Some(LinkState::new());
        return ConnectOutcome::Allocated;
    }
    let Some(link) = slot.as_mut() else {
        return ConnectOutcome::Allocated;
    };

    match link.status() {
        LinkStatus::WaitingConnect => ConnectOutcome::Waiting,
        LinkStatus::Connected => ConnectOutcome::AlreadyConnected,
        LinkStatus::Uninitialized | LinkStatus::Disconnected => {
            match open_session(connector, target).await {
                Ok(session) => {
                    link.install_session(session);
                    link.apply(LinkEvent::ConnectSucceeded);
                    tracing::info!(
                        "Connected to coordination store at [{}]{}",
                        target.address,
                        if target.tls.is_some() { " (tls)" } else { "" }
                    );
                    ConnectOutcome::Connected
                }
                Err(e) => {
                    link.apply(LinkEvent::ConnectFailed);
                    tracing::warn!(
                        "Failed to connect to coordination store at [{}] (attempt {}): {}",
                        target.address,
                        link.failed_attempts(),
                        e
                    );
                    ConnectOutcome::Failed
                }
            }
        }
    }
}
