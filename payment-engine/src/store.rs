//! Durable transaction records and recovery log
//!
//! Records are kept in memory behind a per-transaction mutex and written
//! through to the `transactions` column under that mutex. Settled records
//! leave memory once their observing window has passed; the column keeps
//! them, and lookups fall back to it. Recovery log entries are appended to
//! `recovery_log`, keyed by transaction first so a single transaction's
//! history is one prefix scan.

use crate::types::{RecoveryEntry, RecoveryEvent, TransactionRecord};
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use line_ledger::{Column, NodeId, Storage};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Transaction records of one node
pub struct TransactionStore {
    node: NodeId,
    storage: Arc<Storage>,
    records: DashMap<Uuid, Arc<Mutex<TransactionRecord>>>,
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("node", &self.node)
            .field("records", &self.records.len())
            .finish()
    }
}

impl TransactionStore {
    /// Load every persisted record still in flight
    pub fn open(node: NodeId, storage: Arc<Storage>) -> Result<Self> {
        let persisted: Vec<(Vec<u8>, TransactionRecord)> = storage.scan(Column::Transactions)?;
        let records = DashMap::new();
        for (_, record) in persisted {
            if !record.stage.is_terminal() {
                records.insert(record.transaction, Arc::new(Mutex::new(record)));
            }
        }
        tracing::info!(node = %node, records = records.len(), "Loaded transaction records");

        Ok(Self {
            node,
            storage,
            records,
        })
    }

    fn persist(&self, record: &TransactionRecord) -> Result<()> {
        self.storage
            .put(Column::Transactions, record.transaction.as_bytes(), record)?;
        Ok(())
    }

    /// Insert a record unless one exists already; true when inserted
    pub fn insert(&self, record: TransactionRecord) -> Result<bool> {
        match self.records.entry(record.transaction) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                self.persist(&record)?;
                vacant.insert(Arc::new(Mutex::new(record)));
                Ok(true)
            }
        }
    }

    fn load(&self, transaction: Uuid) -> Result<Option<TransactionRecord>> {
        self.storage
            .get(Column::Transactions, transaction.as_bytes())
            .map_err(Into::into)
    }

    /// Bring a settled record back into memory
    fn entry(&self, transaction: Uuid) -> Result<Option<Arc<Mutex<TransactionRecord>>>> {
        if let Some(entry) = self.records.get(&transaction) {
            return Ok(Some(entry.value().clone()));
        }
        let Some(record) = self.load(transaction)? else {
            return Ok(None);
        };
        Ok(Some(
            self.records
                .entry(transaction)
                .or_insert_with(|| Arc::new(Mutex::new(record)))
                .value()
                .clone(),
        ))
    }

    /// Copy of a record
    pub fn get(&self, transaction: Uuid) -> Option<TransactionRecord> {
        if let Some(entry) = self.records.get(&transaction) {
            return Some(entry.value().lock().clone());
        }
        match self.load(transaction) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(node = %self.node, %transaction, error = %e, "Reading settled record failed");
                None
            }
        }
    }

    /// Number of records held in memory
    pub fn resident(&self) -> usize {
        self.records.len()
    }

    /// Mutate a record and write it through; `None` when absent
    pub fn update<R>(
        &self,
        transaction: Uuid,
        f: impl FnOnce(&mut TransactionRecord) -> Result<R>,
    ) -> Result<Option<R>> {
        let Some(record) = self.entry(transaction)? else {
            return Ok(None);
        };
        let mut guard = record.lock();
        let result = f(&mut guard)?;
        guard.updated_at = Utc::now();
        self.persist(&guard)?;
        Ok(Some(result))
    }

    /// Mutate a record, creating it first when absent
    pub fn upsert<R>(
        &self,
        transaction: Uuid,
        init: impl FnOnce() -> TransactionRecord,
        f: impl FnOnce(&mut TransactionRecord) -> Result<R>,
    ) -> Result<R> {
        let record = match self.entry(transaction)? {
            Some(record) => record,
            None => self
                .records
                .entry(transaction)
                .or_insert_with(|| Arc::new(Mutex::new(init())))
                .value()
                .clone(),
        };
        let mut guard = record.lock();
        let result = f(&mut guard)?;
        guard.updated_at = Utc::now();
        self.persist(&guard)?;
        Ok(result)
    }

    /// Copies of the records held in memory, oldest first
    pub fn list(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<TransactionRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// Copies of every record ever stored, oldest first
    pub fn history(&self) -> Result<Vec<TransactionRecord>> {
        let persisted: Vec<(Vec<u8>, TransactionRecord)> =
            self.storage.scan(Column::Transactions)?;
        let mut records: Vec<TransactionRecord> = persisted
            .into_iter()
            .map(|(_, record)| match self.records.get(&record.transaction) {
                Some(entry) => entry.value().lock().clone(),
                None => record,
            })
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    /// Drop settled records untouched since `cutoff` from memory
    ///
    /// Records locked by a running update stay. Returns how many left.
    pub fn evict_settled(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| match record.try_lock() {
            Some(record) => !(record.stage.is_terminal() && record.updated_at < cutoff),
            None => true,
        });
        before.saturating_sub(self.records.len())
    }

    /// Append a recovery log entry
    pub fn log(&self, transaction: Uuid, event: RecoveryEvent) -> Result<()> {
        let entry = RecoveryEntry {
            transaction,
            node: self.node.clone(),
            at: Utc::now(),
            event,
        };
        self.storage
            .append(Column::RecoveryLog, transaction.as_bytes(), &entry)?;
        Ok(())
    }

    /// Recovery log of one transaction, or of every transaction
    pub fn recovery_log(&self, transaction: Option<Uuid>) -> Result<Vec<RecoveryEntry>> {
        let entries: Vec<(Vec<u8>, RecoveryEntry)> = match transaction {
            Some(tx) => self.storage.scan_prefix(Column::RecoveryLog, tx.as_bytes())?,
            None => self.storage.scan(Column::RecoveryLog)?,
        };
        let mut entries: Vec<RecoveryEntry> = entries.into_iter().map(|(_, e)| e).collect();
        if transaction.is_none() {
            entries.sort_by_key(|entry| entry.at);
        }
        Ok(entries)
    }
}
