//! Ephemeral per-client presence state (cursor, identity) with
//! last-writer-wins merge.
//!
//! Every client carries a monotonically increasing clock; a delta entry
//! whose clock is not greater than the stored clock for that client id is
//! discarded. An absent state marks removal, and removals keep a clock
//! tombstone so stale re-adds are rejected too.
//!
//! Presence is never persisted — it only travels over the broadcast
//! channel and dies with the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Origin;

/// Presence state for one client: arbitrary key/value pairs.
pub type PresenceState = HashMap<String, String>;

/// One tracked entry. `state: None` is the absence marker (tombstone).
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub clock: u64,
    pub state: Option<PresenceState>,
}

/// Wire shape of one delta entry (bincode encoded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireEntry {
    client_id: u64,
    clock: u64,
    state: Option<PresenceState>,
}

/// The client ids touched by a merge, grouped by effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched client ids, in added/updated/removed order.
    pub fn client_ids(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

/// Presence errors.
#[derive(Debug, Clone)]
pub enum PresenceError {
    /// Delta bytes could not be decoded
    MalformedDelta(String),
    /// Encoding failed
    EncodeFailed(String),
}

impl std::fmt::Display for PresenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedDelta(e) => write!(f, "Malformed presence delta: {e}"),
            Self::EncodeFailed(e) => write!(f, "Presence encode failed: {e}"),
        }
    }
}

impl std::error::Error for PresenceError {}

/// Callback invoked after every presence merge: `(change, origin)`.
pub type PresenceCallback = Arc<dyn Fn(&PresenceChange, Option<Origin>) + Send + Sync>;

/// Tracks presence for the local client and all observed remote clients.
pub struct PresenceTracker {
    client_id: u64,
    entries: Mutex<HashMap<u64, PresenceEntry>>,
    callbacks: Mutex<HashMap<u64, PresenceCallback>>,
    next_callback_id: AtomicU64,
}

fn relock<'a, T>(
    guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl PresenceTracker {
    /// Create a tracker with a freshly derived client id.
    pub fn new() -> Self {
        Self::with_client_id(Uuid::new_v4().as_u128() as u64)
    }

    /// Create a tracker with an explicit client id (for tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            client_id,
            entries: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(1),
        }
    }

    /// This tracker's own client id.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Register a merge callback. Returns an id for [`off_update`].
    ///
    /// [`off_update`]: PresenceTracker::off_update
    pub fn on_update(
        &self,
        callback: impl Fn(&PresenceChange, Option<Origin>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        relock(self.callbacks.lock()).insert(id, Arc::new(callback));
        id
    }

    /// Deregister a merge callback. Returns whether it was registered.
    pub fn off_update(&self, id: u64) -> bool {
        relock(self.callbacks.lock()).remove(&id).is_some()
    }

    /// Set the local client's presence state. Bumps the local clock.
    pub fn set_local_state(&self, state: PresenceState, origin: Option<Origin>) {
        let change = {
            let mut entries = relock(self.entries.lock());
            let entry = entries.entry(self.client_id).or_insert(PresenceEntry {
                clock: 0,
                state: None,
            });
            let had_state = entry.state.is_some();
            entry.clock += 1;
            entry.state = Some(state);
            if had_state {
                PresenceChange {
                    updated: vec![self.client_id],
                    ..Default::default()
                }
            } else {
                PresenceChange {
                    added: vec![self.client_id],
                    ..Default::default()
                }
            }
        };
        self.notify(&change, origin);
    }

    /// Clear the local client's presence state (marks it absent).
    pub fn clear_local_state(&self, origin: Option<Origin>) {
        self.remove(&[self.client_id], origin);
    }

    /// The local client's presence state, if set.
    pub fn local_state(&self) -> Option<PresenceState> {
        relock(self.entries.lock())
            .get(&self.client_id)
            .and_then(|e| e.state.clone())
    }

    /// All present clients and their states.
    pub fn states(&self) -> HashMap<u64, PresenceState> {
        relock(self.entries.lock())
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Whether a client id currently has presence state.
    pub fn contains(&self, client_id: u64) -> bool {
        relock(self.entries.lock())
            .get(&client_id)
            .map(|e| e.state.is_some())
            .unwrap_or(false)
    }

    /// Number of present clients.
    pub fn len(&self) -> usize {
        relock(self.entries.lock())
            .values()
            .filter(|e| e.state.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The stored clock for a client id, if known (tombstones included).
    pub fn clock(&self, client_id: u64) -> Option<u64> {
        relock(self.entries.lock()).get(&client_id).map(|e| e.clock)
    }

    /// Encode every known entry, tombstones included.
    pub fn encode_full(&self) -> Result<Vec<u8>, PresenceError> {
        let entries = relock(self.entries.lock());
        let wire: Vec<WireEntry> = entries
            .iter()
            .map(|(id, e)| WireEntry {
                client_id: *id,
                clock: e.clock,
                state: e.state.clone(),
            })
            .collect();
        encode_wire(&wire)
    }

    /// Encode a delta covering just the given client ids.
    ///
    /// Unknown ids are skipped; tombstoned ids are encoded with the absence
    /// marker so removals propagate.
    pub fn encode_delta(&self, client_ids: &[u64]) -> Result<Vec<u8>, PresenceError> {
        let entries = relock(self.entries.lock());
        let wire: Vec<WireEntry> = client_ids
            .iter()
            .filter_map(|id| {
                entries.get(id).map(|e| WireEntry {
                    client_id: *id,
                    clock: e.clock,
                    state: e.state.clone(),
                })
            })
            .collect();
        encode_wire(&wire)
    }

    /// Merge a received delta. Stale entries (clock not greater than the
    /// stored clock) are discarded. Returns what actually changed.
    pub fn apply_delta(
        &self,
        bytes: &[u8],
        origin: Option<Origin>,
    ) -> Result<PresenceChange, PresenceError> {
        let (wire, _): (Vec<WireEntry>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| PresenceError::MalformedDelta(e.to_string()))?;

        let mut change = PresenceChange::default();
        {
            let mut entries = relock(self.entries.lock());
            for incoming in wire {
                match entries.get_mut(&incoming.client_id) {
                    Some(current) => {
                        if incoming.clock <= current.clock {
                            continue; // stale
                        }
                        let had_state = current.state.is_some();
                        current.clock = incoming.clock;
                        match (&incoming.state, had_state) {
                            (Some(_), true) => change.updated.push(incoming.client_id),
                            (Some(_), false) => change.added.push(incoming.client_id),
                            (None, true) => change.removed.push(incoming.client_id),
                            (None, false) => {} // tombstone refresh
                        }
                        current.state = incoming.state;
                    }
                    None => {
                        let is_present = incoming.state.is_some();
                        entries.insert(
                            incoming.client_id,
                            PresenceEntry {
                                clock: incoming.clock,
                                state: incoming.state,
                            },
                        );
                        if is_present {
                            change.added.push(incoming.client_id);
                        }
                    }
                }
            }
        }

        if !change.is_empty() {
            self.notify(&change, origin);
        }
        Ok(change)
    }

    /// Mark the given client ids absent. Bumps each clock so peers accept
    /// the removal over any earlier state.
    pub fn remove(&self, client_ids: &[u64], origin: Option<Origin>) {
        let mut change = PresenceChange::default();
        {
            let mut entries = relock(self.entries.lock());
            for id in client_ids {
                let entry = entries.entry(*id).or_insert(PresenceEntry {
                    clock: 0,
                    state: None,
                });
                let had_state = entry.state.is_some();
                entry.clock += 1;
                entry.state = None;
                if had_state {
                    change.removed.push(*id);
                }
            }
        }
        if !change.is_empty() {
            self.notify(&change, origin);
        }
    }

    fn notify(&self, change: &PresenceChange, origin: Option<Origin>) {
        let callbacks: Vec<PresenceCallback> =
            relock(self.callbacks.lock()).values().cloned().collect();
        for cb in callbacks {
            cb(change, origin);
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_wire(wire: &[WireEntry]) -> Result<Vec<u8>, PresenceError> {
    bincode::serde::encode_to_vec(wire, bincode::config::standard())
        .map_err(|e| PresenceError::EncodeFailed(e.to_string()))
}
