//! Session state machine values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Session lifecycle:
///
/// ```text
/// INVALID -> STARTED -> [CONNECTING/DISCONNECTED <-> CONNECTED] -> REGISTERED -> STOPPED
/// ```
///
/// STOPPED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Invalid,
    Started,
    Connecting,
    Disconnected,
    Connected,
    Registered,
    Stopped,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Invalid => "INVALID",
            SessionState::Started => "STARTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connected => "CONNECTED",
            SessionState::Registered => "REGISTERED",
            SessionState::Stopped => "STOPPED",
        }
    }

    /// True while the stream link is up (or not needed)
    pub fn is_linked(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Registered)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared holder of the current [`SessionState`].
///
/// Backed by a watch channel so waiters can block on a change instead of
/// polling. Once STOPPED is stored nothing overwrites it.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Invalid);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.get() == SessionState::Stopped
    }

    /// Store `next`, returning the previous state if anything changed.
    pub fn set(&self, next: SessionState) -> Option<SessionState> {
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == SessionState::Stopped || *current == next {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });
        previous
    }

    /// Store `next` only if the current state is one of `from`.
    pub fn transition(&self, from: &[SessionState], next: SessionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == SessionState::Stopped || *current == next || !from.contains(current) {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Force STOPPED. Returns false if the session was already stopped.
    pub fn stop(&self) -> bool {
        self.set(SessionState::Stopped).is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Wait until the state differs from `state`, bounded by `limit`.
    /// Returns true if the state changed in time.
    pub async fn wait_until_not(&self, state: SessionState, limit: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|s| *s != state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Resolves once the session is STOPPED.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Stopped).await;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_invalid() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Invalid);
    }

    #[test]
    fn test_set_reports_previous() {
        let cell = StateCell::new();
        assert_eq!(cell.set(SessionState::Started), Some(SessionState::Invalid));
        assert_eq!(cell.set(SessionState::Started), None);
        assert_eq!(cell.set(SessionState::Connected), Some(SessionState::Started));
    }

    #[test]
    fn test_stopped_is_terminal() {
        let cell = StateCell::new();
        cell.set(SessionState::Registered);
        assert!(cell.stop());
        assert!(!cell.stop());
        assert_eq!(cell.set(SessionState::Connected), None);
        assert!(!cell.transition(&[SessionState::Stopped], SessionState::Started));
        assert_eq!(cell.get(), SessionState::Stopped);
    }

    #[test]
    fn test_transition_requires_source_state() {
        let cell = StateCell::new();
        cell.set(SessionState::Connected);
        assert!(!cell.transition(&[SessionState::Registered], SessionState::Disconnected));
        assert!(cell.transition(
            &[SessionState::Connected, SessionState::Registered],
            SessionState::Disconnected
        ));
        assert_eq!(cell.get(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_until_not() {
        let cell = std::sync::Arc::new(StateCell::new());
        cell.set(SessionState::Registered);

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move {
                cell.wait_until_not(SessionState::Registered, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cell.stop();
        assert!(waiter.await.unwrap());

        let idle = StateCell::new();
        idle.set(SessionState::Registered);
        assert!(
            !idle
                .wait_until_not(SessionState::Registered, Duration::from_millis(30))
                .await
        );
    }
}
