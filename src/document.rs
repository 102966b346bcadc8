//! Replicated document abstraction over opaque CRDT update buffers.
//!
//! The sync layer never inspects document content. It only needs four
//! capabilities from a replica: encode the full state, encode a cumulative
//! update since a prior version vector, apply an update tagged with an
//! origin, and observe updates as they are committed. [`YrsDocument`] is
//! the default implementation over a Yrs `Doc`; hosts may inject any other
//! [`ReplicatedDocument`].
//!
//! Apply is commutative, associative, and idempotent, so duplicated or
//! reordered delivery converges to the same state.

use std::any::Any;

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Opaque origin token attached to every applied update.
///
/// Each controller owns a unique token and tags every update it applies
/// (persisted state, channel-received updates) with it. The update observer
/// drops updates carrying the controller's own token, which is what breaks
/// echo loops. Local edits carry no origin (or a host-chosen one) and pass
/// through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin([u8; 16]);

impl Origin {
    /// Create a fresh, unique origin token.
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Raw bytes for transport into the CRDT transaction.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Reconstruct a token from transaction origin bytes.
    ///
    /// Returns `None` for origins of a different shape (e.g. host-assigned
    /// string origins), which the sync layer treats as "not mine".
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked for every committed update: `(update_bytes, origin)`.
pub type UpdateCallback = Box<dyn Fn(&[u8], Option<Origin>) + Send + Sync + 'static>;

/// Guard for a registered update callback.
///
/// Dropping the observer detaches the callback, so every `on` has a
/// matching `off`.
pub struct UpdateObserver {
    _guard: Box<dyn Any + Send>,
}

impl UpdateObserver {
    /// Wrap a backend-specific subscription guard. Custom
    /// [`ReplicatedDocument`] implementations hand back whatever keeps
    /// their callback registered.
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// Update or state-vector bytes could not be decoded
    MalformedUpdate(String),
    /// Decoded update could not be integrated
    ApplyFailed(String),
    /// Observer registration failed
    ObserveFailed(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            Self::ApplyFailed(e) => write!(f, "Apply failed: {e}"),
            Self::ObserveFailed(e) => write!(f, "Observer registration failed: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// The injectable replicated-document abstraction.
///
/// Implementations must guarantee idempotent, commutative apply; the
/// controller never filters or reorders updates based on assumed
/// sequencing.
pub trait ReplicatedDocument: Send + Sync {
    /// Encode the full document state as an update buffer.
    fn encode_state(&self) -> Vec<u8>;

    /// Encode the current version vector.
    fn state_vector(&self) -> Vec<u8>;

    /// Encode the cumulative update since a previously captured vector.
    fn encode_update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError>;

    /// Apply an update buffer, tagging the transaction with `origin`.
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), DocumentError>;

    /// Register an update callback. Fires on the committing thread for
    /// every transaction, local or applied.
    fn observe_updates(&self, callback: UpdateCallback) -> Result<UpdateObserver, DocumentError>;
}

/// Default [`ReplicatedDocument`] backed by a Yrs CRDT document.
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Wrap an existing Yrs document.
    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    /// The underlying Yrs document, for host-side editing.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDocument for YrsDocument {
    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), DocumentError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.as_bytes().as_ref());
        txn.apply_update(decoded)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))
    }

    fn observe_updates(&self, callback: UpdateCallback) -> Result<UpdateObserver, DocumentError> {
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().and_then(|o| Origin::from_slice(o.as_ref()));
                callback(&event.update, origin);
            })
            .map_err(|e| DocumentError::ObserveFailed(e.to_string()))?;
        Ok(UpdateObserver::new(sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use yrs::{GetString, Text};

    fn edit(doc: &YrsDocument, text: &str) {
        let body = doc.doc().get_or_insert_text("body");
        let mut txn = doc.doc().transact_mut();
        body.insert(&mut txn, 0, text);
    }

    fn read_body(doc: &YrsDocument) -> String {
        let body = doc.doc().get_or_insert_text("body");
        let txn = doc.doc().transact();
        body.get_string(&txn)
    }

    #[test]
    fn test_origin_uniqueness() {
        let a = Origin::new();
        let b = Origin::new();
        assert_ne!(a, b);
        assert_eq!(a, Origin::from_slice(a.as_bytes()).unwrap());
    }

    #[test]
    fn test_origin_rejects_foreign_shapes() {
        assert!(Origin::from_slice(b"short").is_none());
        assert!(Origin::from_slice(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_state_roundtrip_between_replicas() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        edit(&a, "hello");

        b.apply_update(&a.encode_state(), Origin::new()).unwrap();
        assert_eq!(read_body(&b), "hello");
        assert_eq!(a.encode_state(), b.encode_state());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        edit(&a, "dup");

        let update = a.encode_state();
        let origin = Origin::new();
        b.apply_update(&update, origin).unwrap();
        let first = b.encode_state();
        b.apply_update(&update, origin).unwrap();
        assert_eq!(first, b.encode_state());
    }

    #[test]
    fn test_apply_commutes() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        edit(&a, "left");
        edit(&b, "right");

        let ua = a.encode_state();
        let ub = b.encode_state();

        let x = YrsDocument::new();
        let y = YrsDocument::new();
        let origin = Origin::new();
        x.apply_update(&ua, origin).unwrap();
        x.apply_update(&ub, origin).unwrap();
        y.apply_update(&ub, origin).unwrap();
        y.apply_update(&ua, origin).unwrap();

        assert_eq!(x.encode_state(), y.encode_state());
    }

    #[test]
    fn test_update_since_is_cumulative() {
        let doc = YrsDocument::new();
        let before = doc.state_vector();
        edit(&doc, "one");
        edit(&doc, "two");

        let diff = doc.encode_update_since(&before).unwrap();
        let replica = YrsDocument::new();
        replica.apply_update(&diff, Origin::new()).unwrap();
        assert_eq!(read_body(&replica), read_body(&doc));
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = YrsDocument::new();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xFE, 0xFD], Origin::new()),
            Err(DocumentError::MalformedUpdate(_))
        ));
        assert!(doc.encode_update_since(&[0xFF; 3]).is_err());
    }

    #[test]
    fn test_observer_sees_origin() {
        let doc = YrsDocument::new();
        let seen: Arc<Mutex<Vec<Option<Origin>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _obs = doc
            .observe_updates(Box::new(move |_update, origin| {
                seen_cb.lock().unwrap().push(origin);
            }))
            .unwrap();

        // Local edit carries no origin
        edit(&doc, "local");

        // Tagged apply carries the token
        let other = YrsDocument::new();
        edit(&other, "remote");
        let origin = Origin::new();
        doc.apply_update(&other.encode_state(), origin).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], None);
        assert_eq!(seen[1], Some(origin));
    }

    #[test]
    fn test_observer_detaches_on_drop() {
        let doc = YrsDocument::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = Arc::clone(&count);
        let obs = doc
            .observe_updates(Box::new(move |_, _| {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        edit(&doc, "a");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(obs);
        edit(&doc, "b");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
