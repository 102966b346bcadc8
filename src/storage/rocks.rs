//! RocksDB-backed persistence bridge.
//!
//! One column family per table name, created on demand the first time a
//! descriptor references it. Rows are LZ4-compressed at rest; keys are the
//! raw document id, so the upsert-on-conflict contract is a plain put.

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded,
};

use super::{decode_row, encode_row, PersistenceBridge, StorageDescriptor, StoreError};

type Db = DBWithThreadMode<SingleThreaded>;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Config for testing (small caches, caller-provided temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// RocksDB-backed [`PersistenceBridge`].
///
/// Single-threaded RocksDB mode; the write lock is only taken to create a
/// missing column family, reads and puts go through the read lock.
pub struct RocksBridge {
    db: RwLock<Db>,
    config: RocksConfig,
}

impl RocksBridge {
    /// Open (or create) the database at the configured path, reattaching
    /// any previously created tables.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let db_opts = Self::db_options(&config);
        let existing = Db::list_cf(&db_opts, &config.path).unwrap_or_default();

        let db = if existing.is_empty() {
            Db::open(&db_opts, &config.path)?
        } else {
            let descriptors: Vec<ColumnFamilyDescriptor> = existing
                .iter()
                .map(|name| ColumnFamilyDescriptor::new(name, Self::cf_options(&config)))
                .collect();
            Db::open_cf_descriptors(&db_opts, &config.path, descriptors)?
        };

        Ok(Self {
            db: RwLock::new(db),
            config,
        })
    }

    fn db_options(config: &RocksConfig) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(5);
        opts
    }

    fn cf_options(config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Rows are already LZ4-compressed before the put
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn read_db(&self) -> RwLockReadGuard<'_, Db> {
        self.db.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_db(&self) -> RwLockWriteGuard<'_, Db> {
        self.db.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        {
            let db = self.read_db();
            if db.cf_handle(table).is_some() {
                return Ok(());
            }
        }
        let mut db = self.write_db();
        if db.cf_handle(table).is_none() {
            db.create_cf(table, &Self::cf_options(&self.config))?;
            log::debug!("created table '{table}'");
        }
        Ok(())
    }

    fn put_row(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        self.ensure_table(&descriptor.table_name)?;
        let row = encode_row(descriptor, document_id, content)?;
        let compressed = lz4_flex::compress_prepend_size(&row);

        let db = self.read_db();
        let cf = db.cf_handle(&descriptor.table_name).ok_or_else(|| {
            StoreError::DatabaseError(format!("missing table '{}'", descriptor.table_name))
        })?;
        db.put_cf(&cf, document_id.as_bytes(), compressed)?;
        Ok(())
    }
}

impl PersistenceBridge for RocksBridge {
    fn fetch(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.read_db();
        let cf = match db.cf_handle(&descriptor.table_name) {
            Some(cf) => cf,
            // Table never written: no record
            None => return Ok(None),
        };
        let stored = match db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let row = lz4_flex::decompress_size_prepended(&stored)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        decode_row(descriptor, &row).map(Some)
    }

    fn create_empty(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
    ) -> Result<Vec<u8>, StoreError> {
        self.put_row(descriptor, document_id, &[])?;
        log::debug!(
            "created empty record for '{document_id}' in '{}'",
            descriptor.table_name
        );
        Ok(Vec::new())
    }

    fn write(
        &self,
        descriptor: &StorageDescriptor,
        document_id: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        self.put_row(descriptor, document_id, content)
    }
}
