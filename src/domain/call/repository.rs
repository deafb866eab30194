//! In-memory store of calls in progress

use super::entity::CallData;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Calls keyed by network call id.
///
/// Shared between the receive worker and application threads; guarded by
/// its own lock, independent of the send queue.
#[derive(Debug, Default)]
pub struct CallTable {
    calls: Mutex<HashMap<String, CallData>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a call
    pub fn insert(&self, call: CallData) {
        self.calls.lock().insert(call.call_id.clone(), call);
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.lock().contains_key(call_id)
    }

    /// Snapshot of a call
    pub fn get(&self, call_id: &str) -> Option<CallData> {
        self.calls.lock().get(call_id).cloned()
    }

    /// Mutate a call in place; `None` if it does not exist
    pub fn update<R>(&self, call_id: &str, f: impl FnOnce(&mut CallData) -> R) -> Option<R> {
        self.calls.lock().get_mut(call_id).map(f)
    }

    pub fn remove(&self, call_id: &str) -> Option<CallData> {
        self.calls.lock().remove(call_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.calls.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Drop every call, returning what was removed
    pub fn drain(&self) -> Vec<CallData> {
        self.calls.lock().drain().map(|(_, call)| call).collect()
    }
}
