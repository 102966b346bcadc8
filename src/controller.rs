//! The sync controller: orchestrates one replicated document, one presence
//! tracker, one channel subscription, and one persistence bridge.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──subscribed──► Syncing ──fetch/apply──► Synced
//!      ▲                                                                          │
//!      └───────────────── channel close / destroy() ◄──────────────────────────────┘
//! ```
//!
//! Local edits are observed off the document, debounced, then broadcast as
//! one cumulative update and persisted as the full merged state. Updates
//! the controller itself applied (initial snapshot, channel messages) are
//! tagged with the controller's origin token and filtered out by the
//! observer, which is what breaks echo loops. Presence changes are
//! debounced and broadcast but never persisted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{
    BroadcastChannel, ChannelError, ChannelEvent, ChannelMessage, SubscriptionHandle,
};
use crate::debounce::{Debouncer, DEFAULT_DEBOUNCE_WINDOW};
use crate::document::{DocumentError, Origin, ReplicatedDocument, UpdateObserver, YrsDocument};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::storage::{PersistenceBridge, StorageDescriptor, StoreError};

/// Shared boolean cell gating persistence writes.
///
/// Contract: the host writes it, the controller only reads it at each
/// debounced flush. While true, writes are skipped but applying and
/// broadcasting continue.
pub type SharedFlag = Arc<AtomicBool>;

/// Event channel depth before events are dropped for slow consumers.
const EVENT_CAPACITY: usize = 256;

/// Consecutive write failures before logging escalates to error level.
const WRITE_FAILURE_ESCALATION: u64 = 3;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
}

/// Notifications for external listeners (e.g. UI). None carry document
/// content; content is read directly off the document.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Channel subscription confirmed
    Connect,
    /// Channel lost or controller torn down
    Disconnect,
    /// Initial state fetched and applied
    Synced,
    /// A debounced persistence write succeeded
    Save { version: u64 },
    /// Presence entries changed
    Presence { change: PresenceChange },
}

/// Construction-time configuration.
pub struct SyncConfig {
    /// Identity of the shared document (required)
    pub document_id: String,
    /// Pub/sub topic name (required)
    pub channel_name: String,
    /// Where persisted rows live (required)
    pub storage: StorageDescriptor,
    /// Injectable replica (default: fresh empty Yrs document)
    pub document: Option<Arc<dyn ReplicatedDocument>>,
    /// Injectable presence tracker (default: fresh tracker)
    pub presence: Option<Arc<PresenceTracker>>,
    /// Optional shared cell pausing persistence writes
    pub updates_disabled: Option<SharedFlag>,
    /// Trailing-edge window for broadcast/persist coalescing
    pub debounce_window: Duration,
}

impl SyncConfig {
    pub fn new(
        document_id: impl Into<String>,
        channel_name: impl Into<String>,
        storage: StorageDescriptor,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            channel_name: channel_name.into(),
            storage,
            document: None,
            presence: None,
            updates_disabled: None,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.document_id.is_empty() {
            return Err(ConfigError::MissingField("document_id"));
        }
        if self.channel_name.is_empty() {
            return Err(ConfigError::MissingField("channel_name"));
        }
        if let Some(field) = self.storage.missing_field() {
            return Err(ConfigError::MissingField(field));
        }
        Ok(())
    }
}

/// Configuration errors — the only fatal class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingField(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "Missing required config field: {field}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Controller errors.
#[derive(Debug)]
pub enum SyncError {
    Config(ConfigError),
    Channel(ChannelError),
    Document(DocumentError),
    Store(StoreError),
    /// Operation on a destroyed controller
    Destroyed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Channel(e) => write!(f, "{e}"),
            Self::Document(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Destroyed => write!(f, "Controller already destroyed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ChannelError> for SyncError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

impl From<DocumentError> for SyncError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// State shared between the controller handle, its observers, and its
/// spawned tasks.
struct Shared {
    document_id: String,
    channel_name: String,
    descriptor: StorageDescriptor,
    origin: Origin,
    doc: Arc<dyn ReplicatedDocument>,
    presence: Arc<PresenceTracker>,
    channel: Arc<dyn BroadcastChannel>,
    store: Arc<dyn PersistenceBridge>,
    state: RwLock<SyncState>,
    event_tx: mpsc::Sender<SyncEvent>,
    destroyed: AtomicBool,
    /// True only while in `Synced`; debounced flushes are inert otherwise
    /// so a half-connected replica never broadcasts or persists.
    synced: AtomicBool,
    updates_disabled: Option<SharedFlag>,
    doc_debounce: Debouncer,
    presence_debounce: Debouncer,
    /// Version vector at the last broadcast; the next flush publishes the
    /// cumulative diff since this point.
    last_broadcast_sv: Mutex<Vec<u8>>,
    /// Client ids with presence changes awaiting the next flush.
    pending_presence: Mutex<HashSet<u64>>,
    save_version: AtomicU64,
    write_failures: AtomicU64,
}

fn relock<'a, T>(
    guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::debug!("[{}] event listener lagging, event dropped", self.document_id);
        }
    }

    fn publish(&self, msg: &ChannelMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[{}] message encode failed: {e}", self.document_id);
                return;
            }
        };
        if let Err(e) = self.channel.publish(&self.channel_name, bytes) {
            log::warn!("[{}] publish failed: {e}", self.document_id);
        }
    }

    /// Debounced document flush: one broadcast carrying the cumulative
    /// update since the last flush, then one persistence write of the full
    /// merged state.
    fn flush_document(&self) {
        if self.is_destroyed() || !self.synced.load(Ordering::SeqCst) {
            return;
        }

        // Capture the vector before encoding the diff: an edit committing
        // between the two calls is then re-sent on the next flush (absorbed
        // by idempotent apply) instead of silently skipped.
        let since = relock(self.last_broadcast_sv.lock()).clone();
        let reached = self.doc.state_vector();
        let update = match self.doc.encode_update_since(&since) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("[{}] diff encode failed: {e}", self.document_id);
                return;
            }
        };
        *relock(self.last_broadcast_sv.lock()) = reached;
        self.publish(&ChannelMessage::update(&update));

        if self
            .updates_disabled
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
        {
            log::debug!("[{}] updates disabled, skipping write", self.document_id);
            return;
        }

        let content = self.doc.encode_state();
        match self
            .store
            .write(&self.descriptor, &self.document_id, &content)
        {
            Ok(()) => {
                self.write_failures.store(0, Ordering::SeqCst);
                let version = self.save_version.fetch_add(1, Ordering::SeqCst) + 1;
                self.emit(SyncEvent::Save { version });
            }
            Err(e) => {
                // Nothing is lost in memory; the next successful flush
                // carries the latest cumulative state.
                let failures = self.write_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= WRITE_FAILURE_ESCALATION {
                    log::error!(
                        "[{}] persistence write failed {failures} times in a row: {e}",
                        self.document_id
                    );
                } else {
                    log::warn!("[{}] persistence write failed: {e}", self.document_id);
                }
            }
        }
    }

    /// Debounced presence flush: one broadcast covering every client id
    /// that changed since the last flush.
    fn flush_presence(&self) {
        if self.is_destroyed() || !self.synced.load(Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u64> = relock(self.pending_presence.lock()).drain().collect();
        if ids.is_empty() {
            return;
        }
        match self.presence.encode_delta(&ids) {
            Ok(delta) => self.publish(&ChannelMessage::presence(&delta)),
            Err(e) => log::warn!("[{}] presence encode failed: {e}", self.document_id),
        }
    }

    /// Broadcast the local client's current presence entry.
    fn publish_own_presence(&self) {
        match self.presence.encode_delta(&[self.presence.client_id()]) {
            Ok(delta) => self.publish(&ChannelMessage::presence(&delta)),
            Err(e) => log::warn!("[{}] presence encode failed: {e}", self.document_id),
        }
    }

    /// Mark the local client absent and broadcast the removal immediately
    /// (not debounced) so peers drop it promptly.
    fn publish_presence_removal(&self) {
        let own = self.presence.client_id();
        self.presence.remove(&[own], Some(self.origin));
        self.publish_own_presence();
    }

    /// Apply one received channel payload. Malformed messages are logged
    /// and discarded; processing continues.
    fn handle_channel_payload(&self, bytes: &[u8]) {
        let msg = match ChannelMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("[{}] discarding channel message: {e}", self.document_id);
                return;
            }
        };
        let payload = match msg.event.payload_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("[{}] discarding channel payload: {e}", self.document_id);
                return;
            }
        };
        match msg.event {
            ChannelEvent::Update { .. } => {
                if let Err(e) = self.doc.apply_update(&payload, self.origin) {
                    log::warn!("[{}] discarding update: {e}", self.document_id);
                }
            }
            ChannelEvent::Presence { .. } => {
                if let Err(e) = self.presence.apply_delta(&payload, Some(self.origin)) {
                    log::warn!("[{}] discarding presence delta: {e}", self.document_id);
                }
            }
        }
    }

    /// Subscribe, fetch-or-create the persisted record, apply it, enter
    /// `Synced`. Returns the subscription handle and the reader task.
    async fn run_connect(
        self: &Arc<Self>,
    ) -> Result<(SubscriptionHandle, JoinHandle<()>), SyncError> {
        self.synced.store(false, Ordering::SeqCst);
        *self.state.write().await = SyncState::Connecting;

        let subscription = match self.channel.subscribe(&self.channel_name) {
            Ok(sub) => sub,
            Err(e) => {
                *self.state.write().await = SyncState::Disconnected;
                self.emit(SyncEvent::Disconnect);
                return Err(e.into());
            }
        };
        *self.state.write().await = SyncState::Syncing;
        self.emit(SyncEvent::Connect);

        // Initial sync. A failed fetch aborts the connect: entering Synced
        // with an empty replica would let the next debounced write replace
        // the committed snapshot.
        match self.store.fetch(&self.descriptor, &self.document_id) {
            Ok(Some(content)) => {
                if content.is_empty() {
                    log::debug!("[{}] persisted record is empty", self.document_id);
                } else if let Err(e) = self.doc.apply_update(&content, self.origin) {
                    log::warn!(
                        "[{}] discarding undecodable persisted state: {e}",
                        self.document_id
                    );
                }
            }
            Ok(None) => {
                if let Err(e) = self.store.create_empty(&self.descriptor, &self.document_id) {
                    log::warn!("[{}] create_empty failed: {e}", self.document_id);
                }
            }
            Err(e) => {
                log::warn!("[{}] initial fetch failed: {e}", self.document_id);
                self.channel.unsubscribe(&subscription.handle);
                *self.state.write().await = SyncState::Disconnected;
                self.emit(SyncEvent::Disconnect);
                return Err(e.into());
            }
        }

        // Snapshot the vector so the first local edit does not re-broadcast
        // the loaded state.
        *relock(self.last_broadcast_sv.lock()) = self.doc.state_vector();

        *self.state.write().await = SyncState::Synced;
        self.synced.store(true, Ordering::SeqCst);
        self.emit(SyncEvent::Synced);
        log::info!("[{}] synced", self.document_id);

        if self.presence.local_state().is_some() {
            self.publish_own_presence();
        }

        let reader = tokio::spawn(reader_loop(Arc::downgrade(self), subscription.receiver));
        Ok((subscription.handle, reader))
    }
}

/// Drains the channel subscription until it closes or the controller goes
/// away. Lagged receivers skip messages and keep going; convergence is
/// carried by CRDT idempotence, not by delivery guarantees.
async fn reader_loop(weak: Weak<Shared>, mut receiver: broadcast::Receiver<Arc<Vec<u8>>>) {
    loop {
        match receiver.recv().await {
            Ok(bytes) => {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_channel_payload(&bytes);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("channel receiver lagged, skipped {skipped} messages");
            }
            Err(broadcast::error::RecvError::Closed) => {
                if let Some(shared) = weak.upgrade() {
                    if !shared.is_destroyed() {
                        shared.synced.store(false, Ordering::SeqCst);
                        // Best-effort: the publish may fail on the dead
                        // transport, but the local tracker and its
                        // listeners still see the removal
                        shared.publish_presence_removal();
                        *shared.state.write().await = SyncState::Disconnected;
                        shared.emit(SyncEvent::Disconnect);
                        log::warn!("[{}] channel closed", shared.document_id);
                    }
                }
                break;
            }
        }
    }
}

/// The orchestrator. One instance per open document; the channel and the
/// bridge may be shared across instances.
///
/// Must live inside a tokio runtime: debounce timers and the channel
/// reader are spawned tasks.
pub struct SyncController {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    doc_observer: Mutex<Option<UpdateObserver>>,
    presence_callback: u64,
    subscription: Mutex<Option<SubscriptionHandle>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncController {
    /// Validate the config, wire the observers, and begin connecting.
    ///
    /// Only configuration errors are fatal. A transport failure during the
    /// initial subscribe leaves the controller in `Disconnected`, to be
    /// retried with [`reconnect`].
    ///
    /// [`reconnect`]: SyncController::reconnect
    pub async fn connect(
        config: SyncConfig,
        channel: Arc<dyn BroadcastChannel>,
        store: Arc<dyn PersistenceBridge>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let doc = config
            .document
            .unwrap_or_else(|| Arc::new(YrsDocument::new()) as Arc<dyn ReplicatedDocument>);
        let presence = config.presence.unwrap_or_default();

        let shared = Arc::new(Shared {
            document_id: config.document_id,
            channel_name: config.channel_name,
            descriptor: config.storage,
            origin: Origin::new(),
            doc,
            presence,
            channel,
            store,
            state: RwLock::new(SyncState::Disconnected),
            event_tx,
            destroyed: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            updates_disabled: config.updates_disabled,
            doc_debounce: Debouncer::new(config.debounce_window),
            presence_debounce: Debouncer::new(config.debounce_window),
            last_broadcast_sv: Mutex::new(Vec::new()),
            pending_presence: Mutex::new(HashSet::new()),
            save_version: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        });

        // Local document mutations: skip our own applies (echo
        // suppression), debounce everything else.
        let doc_observer = {
            let weak = Arc::downgrade(&shared);
            shared.doc.observe_updates(Box::new(move |_update, origin| {
                let Some(shared) = weak.upgrade() else { return };
                if shared.is_destroyed() {
                    return;
                }
                if origin == Some(shared.origin) {
                    return;
                }
                let flush_target = Weak::clone(&weak);
                shared.doc_debounce.schedule(move || {
                    if let Some(shared) = flush_target.upgrade() {
                        shared.flush_document();
                    }
                });
            }))?
        };

        // Presence mutations: surface every change to listeners; queue and
        // debounce only changes that did not come from our own applies.
        let presence_callback = {
            let weak = Arc::downgrade(&shared);
            shared.presence.on_update(move |change, origin| {
                let Some(shared) = weak.upgrade() else { return };
                if shared.is_destroyed() {
                    return;
                }
                shared.emit(SyncEvent::Presence {
                    change: change.clone(),
                });
                if origin == Some(shared.origin) {
                    return;
                }
                relock(shared.pending_presence.lock()).extend(change.client_ids());
                let flush_target = Weak::clone(&weak);
                shared.presence_debounce.schedule(move || {
                    if let Some(shared) = flush_target.upgrade() {
                        shared.flush_presence();
                    }
                });
            })
        };

        // Process shutdown: flush our presence removal so peers drop us.
        let shutdown_task = tokio::spawn({
            let weak = Arc::downgrade(&shared);
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if let Some(shared) = weak.upgrade() {
                        shared.publish_presence_removal();
                    }
                }
            }
        });

        let controller = Self {
            shared: Arc::clone(&shared),
            event_rx: Some(event_rx),
            doc_observer: Mutex::new(Some(doc_observer)),
            presence_callback,
            subscription: Mutex::new(None),
            reader_task: Mutex::new(None),
            shutdown_task: Mutex::new(Some(shutdown_task)),
        };

        match shared.run_connect().await {
            Ok((handle, reader)) => {
                *relock(controller.subscription.lock()) = Some(handle);
                *relock(controller.reader_task.lock()) = Some(reader);
            }
            Err(e) => {
                // Recoverable: caller may reconnect()
                log::warn!("[{}] initial connect failed: {e}", shared.document_id);
            }
        }

        Ok(controller)
    }

    /// Re-enter `Connecting` after a disconnect: resubscribe and re-run
    /// the initial sync path.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        if self.shared.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        if let Some(handle) = relock(self.subscription.lock()).take() {
            self.shared.channel.unsubscribe(&handle);
        }
        if let Some(task) = relock(self.reader_task.lock()).take() {
            task.abort();
        }
        let (handle, reader) = self.shared.run_connect().await?;
        *relock(self.subscription.lock()) = Some(handle);
        *relock(self.reader_task.lock()) = Some(reader);
        Ok(())
    }

    /// Scoped teardown. Safe to call multiple times; no side effects after
    /// return.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.synced.store(false, Ordering::SeqCst);
        self.shared.doc_debounce.cancel();
        self.shared.presence_debounce.cancel();

        // Flush the pending removal before the subscription goes away
        self.shared.publish_presence_removal();

        if let Some(handle) = relock(self.subscription.lock()).take() {
            self.shared.channel.unsubscribe(&handle);
        }
        if let Some(task) = relock(self.reader_task.lock()).take() {
            task.abort();
        }
        if let Some(task) = relock(self.shutdown_task.lock()).take() {
            task.abort();
        }
        *relock(self.doc_observer.lock()) = None;
        self.shared.presence.off_update(self.presence_callback);

        *self.shared.state.write().await = SyncState::Disconnected;
        self.shared.emit(SyncEvent::Disconnect);
        log::info!("[{}] destroyed", self.shared.document_id);
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SyncState {
        *self.shared.state.read().await
    }

    /// The replica this controller owns.
    pub fn document(&self) -> Arc<dyn ReplicatedDocument> {
        Arc::clone(&self.shared.doc)
    }

    /// The presence tracker this controller owns.
    pub fn presence(&self) -> Arc<PresenceTracker> {
        Arc::clone(&self.shared.presence)
    }

    pub fn document_id(&self) -> &str {
        &self.shared.document_id
    }

    /// Number of successful persistence writes so far.
    pub fn save_version(&self) -> u64 {
        self.shared.save_version.load(Ordering::SeqCst)
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        // Best-effort teardown for handles dropped without destroy()
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.shared.doc_debounce.cancel();
        self.shared.presence_debounce.cancel();
        if let Some(task) = relock(self.reader_task.lock()).take() {
            task.abort();
        }
        if let Some(task) = relock(self.shutdown_task.lock()).take() {
            task.abort();
        }
        if let Some(handle) = relock(self.subscription.lock()).take() {
            self.shared.channel.unsubscribe(&handle);
        }
        self.shared.presence.off_update(self.presence_callback);
    }
}
