//! Durable persistence for merged document state.
//!
//! The [`PersistenceBridge`] contract is deliberately small: fetch the
//! latest snapshot for a document id (absent is not an error), create an
//! empty record, upsert the merged snapshot. Presence never goes through
//! here.
//!
//! Rows are JSON objects shaped by a [`StorageDescriptor`]:
//!
//! ```text
//! { "<id_column>": "<document id>", "<content_column>": "<base64 state>", "updated_at": <secs> }
//! ```
//!
//! Backends:
//! - [`RocksBridge`] — RocksDB, one column family per table, LZ4-compressed rows
//! - [`MemoryBridge`] — in-memory map for tests and ephemeral hosts

mod memory;
mod rocks;

pub use memory::{BridgeStats, MemoryBridge};
pub use rocks::{RocksBridge, RocksConfig};

use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Where and how document rows live in the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescriptor {
    /// Table (column family) holding document rows
    pub table_name: String,
    /// Column carrying the document id
    pub id_column_name: String,
    /// Column carrying the base64 snapshot
    pub content_column_name: String,
    /// Upsert conflict key
    pub conflict_key: String,
}

impl StorageDescriptor {
    pub fn new(
        table_name: impl Into<String>,
        id_column_name: impl Into<String>,
        content_column_name: impl Into<String>,
        conflict_key: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            id_column_name: id_column_name.into(),
            content_column_name: content_column_name.into(),
            conflict_key: conflict_key.into(),
        }
    }

    /// First empty required field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.table_name.is_empty() {
            Some("storage.table_name")
        } else if self.id_column_name.is_empty() {
            Some("storage.id_column_name")
        } else if self.content_column_name.is_empty() {
            Some("storage.content_column_name")
        } else if self.conflict_key.is_empty() {
            Some("storage.conflict_key")
        } else {
            None
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure
    DatabaseError(String),
    /// Row could not be serialized
    SerializationError(String),
    /// Stored row could not be read back
    MalformedRow(String),
    /// Compression failed
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatabaseError(e) => write!(f, "Database error: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::MalformedRow(e) => write!(f, "Malformed row: {e}"),
            Self::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable store contract. One bridge may serve many controllers, bound to
/// different tables via the per-call descriptor.
pub trait PersistenceBridge: Send + Sync {
    /// Latest snapshot for the document id. Absent is `Ok(None)`, never an
    /// error.
    fn fetch(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert a record with empty content; returns the (empty) content.
    fn create_empty(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
    ) -> Result<Vec<u8>, StoreError>;

    /// Upsert the snapshot, overwriting on conflict.
    fn write(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
        content: &[u8],
    ) -> Result<(), StoreError>;
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serialize a row for the given descriptor.
pub(crate) fn encode_row(
    descriptor: &StorageDescriptor,
    document_id: &str,
    content: &[u8],
) -> Result<Vec<u8>, StoreError> {
    let mut row = serde_json::Map::new();
    row.insert(
        descriptor.id_column_name.clone(),
        serde_json::Value::from(document_id),
    );
    row.insert(
        descriptor.content_column_name.clone(),
        serde_json::Value::from(BASE64.encode(content)),
    );
    row.insert("updated_at".to_string(), serde_json::Value::from(now_secs()));
    serde_json::to_vec(&row).map_err(|e| StoreError::SerializationError(e.to_string()))
}

/// Extract the content blob from a stored row.
pub(crate) fn decode_row(
    descriptor: &StorageDescriptor,
    bytes: &[u8],
) -> Result<Vec<u8>, StoreError> {
    let row: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| StoreError::MalformedRow(e.to_string()))?;
    let encoded = row
        .get(descriptor.content_column_name.as_str())
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            StoreError::MalformedRow(format!(
                "missing content column '{}'",
                descriptor.content_column_name
            ))
        })?;
    BASE64
        .decode(encoded)
        .map_err(|e| StoreError::MalformedRow(e.to_string()))
}
