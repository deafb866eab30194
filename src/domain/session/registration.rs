//! Outstanding REGISTER attempts

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A register or unregister request waiting for its final response,
/// keyed by the sequence id it was sent with.
#[derive(Debug, Clone)]
pub struct RegistrationAttempt {
    pub seq: u32,
    /// Identity the request was sent for (usually the local one)
    pub identity: String,
    /// True for an unregister (Expires: 0)
    pub unregister: bool,
    /// Nonce the request was authorized with, if any
    pub nonce: Option<String>,
    pub created_at: Instant,
}

impl RegistrationAttempt {
    pub fn new(seq: u32, identity: &str, unregister: bool) -> Self {
        Self {
            seq,
            identity: identity.to_string(),
            unregister,
            nonce: None,
            created_at: Instant::now(),
        }
    }

    pub fn with_nonce(mut self, nonce: Option<String>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }
}

/// Attempts indexed by sequence id
#[derive(Debug, Default)]
pub struct RegistrationTable {
    attempts: HashMap<u32, RegistrationAttempt>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attempt: RegistrationAttempt) {
        self.attempts.insert(attempt.seq, attempt);
    }

    /// Remove and return the attempt matching a response
    pub fn take(&mut self, seq: u32) -> Option<RegistrationAttempt> {
        self.attempts.remove(&seq)
    }

    pub fn get(&self, seq: u32) -> Option<&RegistrationAttempt> {
        self.attempts.get(&seq)
    }

    /// Drop attempts older than `max_age`, returning how many went
    pub fn prune(&mut self, max_age: Duration) -> usize {
        let before = self.attempts.len();
        self.attempts.retain(|_, a| !a.is_expired(max_age));
        before - self.attempts.len()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
