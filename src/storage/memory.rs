//! In-memory persistence bridge for tests and ephemeral hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{decode_row, encode_row, PersistenceBridge, StorageDescriptor, StoreError};

/// Call counters, for asserting bridge traffic in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub fetches: u64,
    pub creates: u64,
    pub writes: u64,
}

/// [`PersistenceBridge`] over a process-local map, keyed by
/// `(table, document id)`. Stores the same JSON row bytes as the durable
/// backend so row-shape behavior is identical.
pub struct MemoryBridge {
    rows: Mutex<HashMap<(String, String), Vec<u8>>>,
    fetches: AtomicU64,
    creates: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
    fail_fetches: AtomicBool,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            fetches: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
        }
    }

    /// Snapshot of call counters.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            fetches: self.fetches.load(Ordering::SeqCst),
            creates: self.creates.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    /// Fault injection: make subsequent `write` calls fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fault injection: make subsequent `fetch` calls fail until reset.
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Number of stored rows across all tables.
    pub fn row_count(&self) -> usize {
        self.lock_rows().len()
    }

    fn lock_rows(&self) -> MutexGuard<'_, HashMap<(String, String), Vec<u8>>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceBridge for MemoryBridge {
    fn fetch(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected fetch failure".into()));
        }
        let rows = self.lock_rows();
        match rows.get(&(descriptor.table_name.clone(), document_id.to_string())) {
            Some(row) => decode_row(descriptor, row).map(Some),
            None => Ok(None),
        }
    }

    fn create_empty(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
    ) -> Result<Vec<u8>, StoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let row = encode_row(descriptor, document_id, &[])?;
        self.lock_rows()
            .insert((descriptor.table_name.clone(), document_id.to_string()), row);
        Ok(Vec::new())
    }

    fn write(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected write failure".into()));
        }
        let row = encode_row(descriptor, document_id, content)?;
        self.lock_rows()
            .insert((descriptor.table_name.clone(), document_id.to_string()), row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> StorageDescriptor {
        StorageDescriptor::new("documents", "id", "content", "id")
    }

    #[test]
    fn test_bridge_contract() {
        let bridge = MemoryBridge::new();
        assert!(bridge.fetch(&desc(), "doc-1").unwrap().is_none());

        assert!(bridge.create_empty(&desc(), "doc-1").unwrap().is_empty());
        assert_eq!(bridge.fetch(&desc(), "doc-1").unwrap(), Some(Vec::new()));

        bridge.write(&desc(), "doc-1", b"state").unwrap();
        assert_eq!(
            bridge.fetch(&desc(), "doc-1").unwrap(),
            Some(b"state".to_vec())
        );

        assert_eq!(
            bridge.stats(),
            BridgeStats {
                fetches: 3,
                creates: 1,
                writes: 1
            }
        );
    }

    #[test]
    fn test_tables_are_isolated() {
        let bridge = MemoryBridge::new();
        let notes = StorageDescriptor::new("notes", "id", "content", "id");

        bridge.write(&desc(), "doc-1", b"a").unwrap();
        assert!(bridge.fetch(&notes, "doc-1").unwrap().is_none());
    }

    #[test]
    fn test_write_fault_injection() {
        let bridge = MemoryBridge::new();
        bridge.set_fail_writes(true);
        assert!(bridge.write(&desc(), "doc-1", b"x").is_err());

        bridge.set_fail_writes(false);
        assert!(bridge.write(&desc(), "doc-1", b"x").is_ok());
    }

    #[test]
    fn test_fetch_fault_injection() {
        let bridge = MemoryBridge::new();
        bridge.write(&desc(), "doc-1", b"x").unwrap();

        bridge.set_fail_fetches(true);
        assert!(bridge.fetch(&desc(), "doc-1").is_err());

        bridge.set_fail_fetches(false);
        assert_eq!(bridge.fetch(&desc(), "doc-1").unwrap(), Some(b"x".to_vec()));
    }
}
