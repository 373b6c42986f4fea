//! Observing ledger state machine
//!
//! Shared by every node of a network. All operations are synchronous and
//! guarded by one mutex; block sealing and window expiry happen lazily at
//! the start of each operation.

use crate::types::{Block, Claim, ObservingRecord, ObservingState};
use crate::{merkle_root, Error, ObservingConfig, Result};
use chrono::Utc;
use line_ledger::NodeId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use uuid::Uuid;

struct Inner {
    records: HashMap<Uuid, ObservingRecord>,
    blocks: BTreeMap<u64, Block>,
    pending: BTreeMap<u64, Vec<Uuid>>,
    last_hash: [u8; 32],
}

/// Append-only arbiter of transaction outcomes
pub struct ObservingLedger {
    config: ObservingConfig,
    genesis: Instant,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ObservingLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservingLedger")
            .field("config", &self.config)
            .field("height", &self.height())
            .finish()
    }
}

impl ObservingLedger {
    /// Create an empty ledger starting at height 0
    pub fn new(config: ObservingConfig) -> Self {
        Self {
            config,
            genesis: Instant::now(),
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                blocks: BTreeMap::new(),
                pending: BTreeMap::new(),
                last_hash: [0u8; 32],
            }),
        }
    }

    /// Configuration
    pub fn config(&self) -> &ObservingConfig {
        &self.config
    }

    /// Current block height
    pub fn height(&self) -> u64 {
        (self.genesis.elapsed().as_millis() / self.config.block_interval().as_millis()) as u64
    }

    fn advance(&self, inner: &mut Inner) -> u64 {
        let height = self.height();

        // Seal every height strictly below the current one
        let still_open = inner.pending.split_off(&height);
        let to_seal = std::mem::replace(&mut inner.pending, still_open);
        for (block_height, transactions) in to_seal {
            let leaves: Vec<[u8; 32]> = transactions
                .iter()
                .filter_map(|tx| inner.records.get(tx))
                .filter_map(|record| record.claim.as_ref())
                .map(Claim::leaf_hash)
                .collect();

            let mut block = Block {
                height: block_height,
                merkle_root: merkle_root(&leaves),
                previous_hash: inner.last_hash,
                hash: [0u8; 32],
                transactions: transactions.clone(),
                sealed_at: Utc::now(),
            };
            block.hash = block.compute_hash();
            inner.last_hash = block.hash;

            for tx in &transactions {
                if let Some(record) = inner.records.get_mut(tx) {
                    record.state = ObservingState::Committed;
                    record.block_height = Some(block_height);
                }
            }

            tracing::debug!(height = block_height, claims = transactions.len(), "Sealed observing block");
            inner.blocks.insert(block_height, block);
        }

        for record in inner.records.values_mut() {
            let expired = record.window_end.map_or(false, |end| height >= end);
            if record.state == ObservingState::NoInfo && expired {
                record.state = ObservingState::Rejected;
                tracing::info!(
                    transaction = %record.transaction,
                    height,
                    "Claim window closed without claim"
                );
            }
        }

        height
    }

    /// Open a claim window for a transaction (idempotent)
    pub fn request_arbitration(&self, transaction: Uuid, node: &NodeId) -> ObservingState {
        let mut inner = self.inner.lock();
        let height = self.advance(&mut inner);
        let window = self.config.cnt_blocks_for_claiming;

        let record = inner
            .records
            .entry(transaction)
            .or_insert_with(|| ObservingRecord::new(transaction));
        if record.window_end.is_none() && record.state == ObservingState::NoInfo {
            record.window_end = Some(height + window.max(1));
            tracing::info!(
                %transaction,
                node = %node,
                height,
                window_end = height + window.max(1),
                "Arbitration requested"
            );
        }
        if !record.requested_by.contains(node) {
            record.requested_by.push(node.clone());
        }

        record.state
    }

    /// Submit a claim carrying every participant signature
    pub fn claim(&self, claim: Claim) -> Result<ObservingState> {
        claim.verify()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let height = self.advance(inner);
        let transaction = claim.transaction;

        let record = inner
            .records
            .entry(transaction)
            .or_insert_with(|| ObservingRecord::new(transaction));

        match record.state {
            ObservingState::Claimed | ObservingState::Committed => {
                let same = record
                    .claim
                    .as_ref()
                    .map_or(false, |accepted| accepted.digest == claim.digest);
                if same {
                    Ok(record.state)
                } else {
                    Err(Error::ConflictingClaim(transaction))
                }
            }
            ObservingState::Rejected => {
                if record.window_end.map_or(false, |end| height >= end) {
                    Err(Error::WindowClosed(transaction))
                } else {
                    Err(Error::AlreadyRejected(transaction))
                }
            }
            ObservingState::NoInfo => {
                tracing::info!(
                    %transaction,
                    node = %claim.submitted_by,
                    signatures = claim.signatures.len(),
                    height,
                    "Claim accepted"
                );
                record.state = ObservingState::Claimed;
                record.claim = Some(claim);
                record.claimed_at = Some(height);
                inner.pending.entry(height).or_default().push(transaction);
                Ok(ObservingState::Claimed)
            }
        }
    }

    /// Record a rejection notice from the coordinator
    pub fn reject(&self, transaction: Uuid, node: &NodeId) -> Result<ObservingState> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);

        let record = inner
            .records
            .entry(transaction)
            .or_insert_with(|| ObservingRecord::new(transaction));
        match record.state {
            ObservingState::Claimed | ObservingState::Committed => {
                Err(Error::AlreadyClaimed(transaction))
            }
            ObservingState::Rejected => Ok(ObservingState::Rejected),
            ObservingState::NoInfo => {
                tracing::info!(%transaction, node = %node, "Rejection recorded");
                record.state = ObservingState::Rejected;
                Ok(ObservingState::Rejected)
            }
        }
    }

    /// State of a transaction
    pub fn state(&self, transaction: Uuid) -> ObservingState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner
            .records
            .get(&transaction)
            .map_or(ObservingState::NoInfo, |record| record.state)
    }

    /// Full record of a transaction
    pub fn record(&self, transaction: Uuid) -> Option<ObservingRecord> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.records.get(&transaction).cloned()
    }

    /// Transactions whose claim window is open and still unclaimed
    pub fn open_arbitrations(&self) -> Vec<Uuid> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        let mut open: Vec<Uuid> = inner
            .records
            .values()
            .filter(|record| record.state == ObservingState::NoInfo && record.window_end.is_some())
            .map(|record| record.transaction)
            .collect();
        open.sort();
        open
    }

    /// Sealed blocks, by height
    pub fn blocks(&self) -> Vec<Block> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.blocks.values().cloned().collect()
    }
}
