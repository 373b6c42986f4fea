//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `lines` - Settlement lines with their reservations (key: equivalent || neighbor)
//! - `exchange` - Exchange rates and commissions (key: owner-defined)
//! - `transactions` - In-flight and terminal transaction records (key: uuid)
//! - `recovery_log` - Append-only recovery log (key: uuid || nanos || seq)
//! - `meta` - Node metadata such as the signing key seed

use crate::{
    error::{Error, Result},
    LedgerConfig,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, IteratorMode, Options, WriteBatch,
    DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Column families used by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Settlement lines
    Lines,
    /// Exchange rates and commissions
    Exchange,
    /// Transaction records
    Transactions,
    /// Recovery log entries
    RecoveryLog,
    /// Node metadata
    Meta,
}

impl Column {
    /// RocksDB column family name
    pub fn name(&self) -> &'static str {
        match self {
            Column::Lines => "lines",
            Column::Exchange => "exchange",
            Column::Transactions => "transactions",
            Column::RecoveryLog => "recovery_log",
            Column::Meta => "meta",
        }
    }

    const ALL: [Column; 5] = [
        Column::Lines,
        Column::Exchange,
        Column::Transactions,
        Column::RecoveryLog,
        Column::Meta,
    ];
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    log_sequence: AtomicU32,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|column| ColumnFamilyDescriptor::new(column.name(), Self::cf_options(*column)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened node storage");

        Ok(Self {
            db: Arc::new(db),
            log_sequence: AtomicU32::new(0),
        })
    }

    fn cf_options(column: Column) -> Options {
        let mut opts = Options::default();
        match column {
            // Read on every protocol step, use LZ4 for speed
            Column::Lines | Column::Exchange | Column::Transactions => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
            Column::RecoveryLog => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            Column::Meta => {}
        }
        opts
    }

    fn cf_handle(&self, column: Column) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(column.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", column.name())))
    }

    #[cfg(test)]
    pub(crate) fn drop_column(&self, column: Column) -> Result<()> {
        self.db.drop_cf(column.name())?;
        Ok(())
    }

    /// Write one value
    pub fn put<T: Serialize>(&self, column: Column, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf_handle(column)?;
        let bytes = bincode::serialize(value)?;
        self.db.put_cf(&cf, key, bytes)?;
        Ok(())
    }

    /// Write several values atomically
    pub fn put_batch<T: Serialize>(&self, column: Column, entries: &[(Vec<u8>, T)]) -> Result<()> {
        let cf = self.cf_handle(column)?;
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put_cf(&cf, key, bincode::serialize(value)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Read one value
    pub fn get<T: DeserializeOwned>(&self, column: Column, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(column)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete one value
    pub fn delete(&self, column: Column, key: &[u8]) -> Result<()> {
        let cf = self.cf_handle(column)?;
        self.db.delete_cf(&cf, key)?;
        Ok(())
    }

    /// Delete every value of a column
    pub fn clear(&self, column: Column) -> Result<()> {
        let keys: Vec<Vec<u8>> = self
            .scan_raw(column, &[])?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let cf = self.cf_handle(column)?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Read every value of a column
    pub fn scan<T: DeserializeOwned>(&self, column: Column) -> Result<Vec<(Vec<u8>, T)>> {
        self.scan_prefix(column, &[])
    }

    /// Read every value whose key starts with `prefix`
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        self.scan_raw(column, prefix)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, bincode::deserialize(&bytes)?)))
            .collect()
    }

    fn scan_raw(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(column)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                entries.push((key.to_vec(), value.to_vec()));
            }
        }
        Ok(entries)
    }

    /// Append an entry under `prefix`, keeping insertion order within the prefix
    pub fn append<T: Serialize>(&self, column: Column, prefix: &[u8], value: &T) -> Result<()> {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let sequence = self.log_sequence.fetch_add(1, Ordering::Relaxed);

        let mut key = prefix.to_vec();
        key.extend_from_slice(&nanos.to_be_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        self.put(column, &key, value)
    }
}
