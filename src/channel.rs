//! Broadcast channel abstraction and the wire format that travels on it.
//!
//! Two message kinds share one topic per document: CRDT updates and
//! presence deltas, both carried as base64 inside a JSON envelope:
//!
//! ```text
//! {"type":"broadcast","event":"update","payload":{"content":"<base64>"}}
//! {"type":"broadcast","event":"presence","payload":{"presence":"<base64>"}}
//! ```
//!
//! The channel guarantees nothing: at-most-once delivery per subscriber,
//! no ordering, loss across disconnects. Subscribers tolerate duplicates
//! and reordering because CRDT apply is idempotent and presence merges
//! reject stale clocks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Envelope kind accepted on the wire. Anything else is rejected.
const KIND_BROADCAST: &str = "broadcast";

/// Default per-subscriber buffer before lagging subscribers drop messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// The two event kinds, adjacently tagged as `event` + `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum ChannelEvent {
    /// Incremental CRDT update
    Update { content: String },
    /// Presence delta
    Presence { presence: String },
}

impl ChannelEvent {
    /// Decode the base64 payload of either variant.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        let encoded = match self {
            ChannelEvent::Update { content } => content,
            ChannelEvent::Presence { presence } => presence,
        };
        BASE64
            .decode(encoded)
            .map_err(|e| ChannelError::InvalidPayload(e.to_string()))
    }
}

/// Channel envelope: `{"type":"broadcast", ...event/payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub event: ChannelEvent,
}

impl ChannelMessage {
    /// Build an update message from raw CRDT update bytes.
    pub fn update(update: &[u8]) -> Self {
        Self {
            kind: KIND_BROADCAST.to_string(),
            event: ChannelEvent::Update {
                content: BASE64.encode(update),
            },
        }
    }

    /// Build a presence message from encoded presence delta bytes.
    pub fn presence(delta: &[u8]) -> Self {
        Self {
            kind: KIND_BROADCAST.to_string(),
            event: ChannelEvent::Presence {
                presence: BASE64.encode(delta),
            },
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(self).map_err(|e| ChannelError::EncodeFailed(e.to_string()))
    }

    /// Deserialize from the JSON wire format. Unknown envelope kinds and
    /// unknown event tags are rejected explicitly.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let msg: ChannelMessage = serde_json::from_slice(bytes)
            .map_err(|e| ChannelError::MalformedMessage(e.to_string()))?;
        if msg.kind != KIND_BROADCAST {
            return Err(ChannelError::UnknownKind(msg.kind));
        }
        Ok(msg)
    }
}

/// Channel errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    EncodeFailed(String),
    MalformedMessage(String),
    UnknownKind(String),
    InvalidPayload(String),
    /// The topic or transport is gone
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncodeFailed(e) => write!(f, "Message encode failed: {e}"),
            Self::MalformedMessage(e) => write!(f, "Malformed channel message: {e}"),
            Self::UnknownKind(k) => write!(f, "Unknown message kind: {k}"),
            Self::InvalidPayload(e) => write!(f, "Invalid message payload: {e}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Identifies one subscription for later [`BroadcastChannel::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub topic: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Build a handle for a custom [`BroadcastChannel`] transport.
    pub fn new(topic: impl Into<String>, id: u64) -> Self {
        Self {
            topic: topic.into(),
            id,
        }
    }
}

/// A live subscription: the handle plus the message stream.
pub struct TopicSubscription {
    pub handle: SubscriptionHandle,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Named publish/subscribe transport.
///
/// Implementations may be shared across many controllers; delivery is
/// best-effort with no ordering guarantee.
pub trait BroadcastChannel: Send + Sync {
    /// Subscribe to a topic. Messages published after this call are
    /// delivered at most once to the returned receiver.
    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, ChannelError>;

    /// Best-effort publish. Publishing to a topic with no subscribers
    /// succeeds silently.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Stop delivery for a subscription. Idempotent.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

struct Topic {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: HashSet<u64>,
}

/// In-process [`BroadcastChannel`] mapping topic names to fan-out channels.
///
/// One `LocalBroadcast` is shared by every controller in the process; each
/// topic gets an independent channel so documents are isolated from each
/// other.
pub struct LocalBroadcast {
    topics: RwLock<HashMap<String, Topic>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LocalBroadcast {
    /// Create with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Number of live topics.
    pub fn topic_count(&self) -> usize {
        self.read_topics().len()
    }

    /// Number of subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.read_topics()
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    fn read_topics(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Topic>> {
        self.topics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_topics(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Topic>> {
        self.topics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastChannel for LocalBroadcast {
    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut topics = self.write_topics();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            Topic {
                sender,
                subscribers: HashSet::new(),
            }
        });
        entry.subscribers.insert(id);
        Ok(TopicSubscription {
            handle: SubscriptionHandle {
                topic: topic.to_string(),
                id,
            },
            receiver: entry.sender.subscribe(),
        })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        // Fast path: existing topic under the read lock
        {
            let topics = self.read_topics();
            if let Some(t) = topics.get(topic) {
                let _ = t.sender.send(Arc::new(payload));
                return Ok(());
            }
        }

        // Slow path: create the topic so later subscribers can attach;
        // this send has no receivers and is dropped (best-effort).
        let mut topics = self.write_topics();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            Topic {
                sender,
                subscribers: HashSet::new(),
            }
        });
        let _ = entry.sender.send(Arc::new(payload));
        Ok(())
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut topics = self.write_topics();
        if let Some(t) = topics.get_mut(&handle.topic) {
            t.subscribers.remove(&handle.id);
            if t.subscribers.is_empty() && t.sender.receiver_count() == 0 {
                topics.remove(&handle.topic);
            }
        }
    }
}
