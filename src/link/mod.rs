//! Link State
//!
//! The per-node record of the coordination-store link: one tagged status,
//! the owned session, and the stale primary key pending reclaim. Status
//! changes go through the pure `transition` function.

mod connection;

pub use connection::{ensure_connected, ConnectOutcome};

use std::time::Instant;

use crate::coordination::CoordinationSession;

/// Status of the link to the coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No session established yet
    Uninitialized,
    /// Asynchronous connect in flight (reserved, not entered today)
    WaitingConnect,
    /// Session established
    Connected,
    /// Session lost; reconnect on the next tick
    Disconnected,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Uninitialized => write!(f, "UNINITIALIZED"),
            LinkStatus::WaitingConnect => write!(f, "WAITING_CONNECT"),
            LinkStatus::Connected => write!(f, "CONNECTED"),
            LinkStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Events driving `LinkStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// An asynchronous connect was issued
    ConnectStarted,
    /// Session creation succeeded
    ConnectSucceeded,
    /// Session creation failed
    ConnectFailed,
    /// A call on a live session showed the link is gone
    LinkLost,
}

/// Next status for `status` after `event`. Pairs with no meaning leave the
/// status unchanged.
pub fn transition(status: LinkStatus, event: LinkEvent) -> LinkStatus {
    use LinkEvent::*;
    use LinkStatus::*;

    match (status, event) {
        (Uninitialized | Disconnected, ConnectStarted) => WaitingConnect,
        (Uninitialized | Disconnected | WaitingConnect, ConnectSucceeded) => Connected,
        (WaitingConnect, ConnectFailed) => Disconnected,
        (Connected, LinkLost) => Disconnected,
        (current, _) => current,
    }
}

/// A stale primary key waiting to be deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleKey {
    /// Key to delete
    pub path: String,
    /// No deletion may be attempted before this instant
    pub delete_after: Instant,
    /// Revision seen on the last inspection, if any
    pub observed_revision: Option<i64>,
}

/// Link state, exclusively owned by one node
pub struct LinkState {
    status: LinkStatus,
    session: Option<Box<dyn CoordinationSession>>,
    replace: Option<StaleKey>,
    failed_attempts: u64,
}

impl std::fmt::Debug for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkState")
            .field("status", &self.status)
            .field("has_session", &self.session.is_some())
            .field("replace", &self.replace)
            .field("failed_attempts", &self.failed_attempts)
            .finish()
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    /// Create an uninitialized link with no session
    pub fn new() -> Self {
        Self {
            status: LinkStatus::Uninitialized,
            session: None,
            replace: None,
            failed_attempts: 0,
        }
    }

    /// Current status
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// Apply an event and return the resulting status
    pub fn apply(&mut self, event: LinkEvent) -> LinkStatus {
        let next = transition(self.status, event);
        if next != self.status {
            tracing::debug!("Link {} -> {} on {:?}", self.status, next, event);
        }
        self.status = next;

        match event {
            LinkEvent::ConnectSucceeded => self.failed_attempts = 0,
            LinkEvent::ConnectFailed => self.failed_attempts += 1,
            _ => {}
        }
        next
    }

    /// Consecutive failed connection attempts
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }

    /// Whether a session has ever been installed
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// The live session
    pub fn session_mut(&mut self) -> Option<&mut (dyn CoordinationSession + 'static)> {
        self.session.as_deref_mut()
    }

    /// Replace the session, dropping any previous one
    pub(crate) fn install_session(&mut self, session: Box<dyn CoordinationSession>) {
        self.session = Some(session);
    }

    /// Take the session out, e.g. to close it on shutdown
    pub(crate) fn take_session(&mut self) -> Option<Box<dyn CoordinationSession>> {
        self.session.take()
    }

    /// Record a stale key that may be deleted once `delete_after` passes
    pub fn record_stale_key(&mut self, path: impl Into<String>, delete_after: Instant) {
        self.replace = Some(StaleKey {
            path: path.into(),
            delete_after,
            observed_revision: None,
        });
    }

    /// The stale key pending reclaim
    pub fn stale_key(&self) -> Option<&StaleKey> {
        self.replace.as_ref()
    }

    pub(crate) fn stale_key_mut(&mut self) -> Option<&mut StaleKey> {
        self.replace.as_mut()
    }

    /// Forget the stale key
    pub fn clear_stale_key(&mut self) {
        self.replace = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use LinkEvent::*;
    use LinkStatus::*;

    #[test]
    fn test_transition_table() {
        assert_eq!(transition(Uninitialized, ConnectSucceeded), Connected);
        assert_eq!(transition(Uninitialized, ConnectFailed), Uninitialized);
        assert_eq!(transition(Disconnected, ConnectSucceeded), Connected);
        assert_eq!(transition(Disconnected, ConnectFailed), Disconnected);
        assert_eq!(transition(Connected, LinkLost), Disconnected);
        assert_eq!(transition(Uninitialized, ConnectStarted), WaitingConnect);
        assert_eq!(transition(WaitingConnect, ConnectSucceeded), Connected);
        assert_eq!(transition(WaitingConnect, ConnectFailed), Disconnected);
    }

    #[test]
    fn test_meaningless_events_keep_status() {
        assert_eq!(transition(Connected, ConnectFailed), Connected);
        assert_eq!(transition(Connected, ConnectStarted), Connected);
        assert_eq!(transition(Uninitialized, LinkLost), Uninitialized);
        assert_eq!(transition(Disconnected, LinkLost), Disconnected);
        assert_eq!(transition(WaitingConnect, LinkLost), WaitingConnect);
    }

    #[test]
    fn test_failed_attempts_reset_on_connect() {
        let mut link = LinkState::new();
        link.apply(ConnectFailed);
        link.apply(ConnectFailed);
        assert_eq!(link.failed_attempts(), 2);
        assert_eq!(link.status(), Uninitialized);

        link.apply(ConnectSucceeded);
        assert_eq!(link.failed_attempts(), 0);
        assert_eq!(link.status(), Connected);
    }

    #[test]
    fn test_stale_key_carries_deadline() {
        let mut link = LinkState::new();
        assert!(link.stale_key().is_none());

        let deadline = Instant::now() + Duration::from_secs(20);
        link.record_stale_key("/old-ha-default-redis", deadline);
        let stale = link.stale_key().unwrap();
        assert_eq!(stale.path, "/old-ha-default-redis");
        assert_eq!(stale.delete_after, deadline);
        assert!(stale.observed_revision.is_none());

        link.clear_stale_key();
        assert!(link.stale_key().is_none());
    }
}
