//! # collab-sync — Real-time collaborative document synchronization
//!
//! Keeps one CRDT-backed document converged across clients: local edits
//! are debounced, broadcast to peers, and persisted; remote updates are
//! applied without echoing back; ephemeral presence travels alongside.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   observe/apply   ┌────────────────────┐
//! │ SyncController │ ◄───────────────► │ ReplicatedDocument │
//! │  (per doc)     │                   │ (Yrs CRDT)         │
//! └───┬────┬───┬───┘                   └────────────────────┘
//!     │    │   │
//!     │    │   └──────────► ┌─────────────────┐
//!     │    │   presence     │ PresenceTracker │  (never persisted)
//!     │    │                └─────────────────┘
//!     │    └──── debounced ► ┌──────────────────┐
//!     │         broadcast    │ BroadcastChannel │ ◄── peers
//!     │                      └──────────────────┘
//!     └───────── debounced ► ┌───────────────────┐
//!                write       │ PersistenceBridge │  (RocksDB)
//!                            └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`controller`] — lifecycle orchestration, debounced flush, echo suppression
//! - [`document`] — the injectable CRDT replica contract and its Yrs default
//! - [`presence`] — last-writer-wins presence merge with clock tombstones
//! - [`channel`] — JSON wire format and the in-process broadcast transport
//! - [`debounce`] — trailing-edge coalescing for broadcast and persistence
//! - [`storage`] — persistence bridge contract, RocksDB and in-memory backends

pub mod channel;
pub mod controller;
pub mod debounce;
pub mod document;
pub mod presence;
pub mod storage;

// Re-exports for convenience
pub use channel::{
    BroadcastChannel, ChannelError, ChannelEvent, ChannelMessage, LocalBroadcast,
    SubscriptionHandle, TopicSubscription, DEFAULT_CHANNEL_CAPACITY,
};
pub use controller::{
    ConfigError, SharedFlag, SyncConfig, SyncController, SyncError, SyncEvent, SyncState,
};
pub use debounce::{Debouncer, DEFAULT_DEBOUNCE_WINDOW};
pub use document::{
    DocumentError, Origin, ReplicatedDocument, UpdateCallback, UpdateObserver, YrsDocument,
};
pub use presence::{
    PresenceChange, PresenceEntry, PresenceError, PresenceState, PresenceTracker,
};
pub use storage::{
    BridgeStats, MemoryBridge, PersistenceBridge, RocksBridge, RocksConfig, StorageDescriptor,
    StoreError,
};
