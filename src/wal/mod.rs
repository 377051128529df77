//! Write-ahead log: a totally-ordered, append-only chain of transaction
//! outcomes, durable across crashes.
//!
//! Each [`WalEntry`] is content-addressed and links to its parent via
//! `prev_cid`, so the chain can be walked back from the head and any break
//! or cycle is detectable without a separate index.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::block_store::{BlockStore, Cid};
use crate::tx::TxId;
use crate::{Error, Result};

/// Terminal or in-flight state a WAL entry records for its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalState {
    Committing,
    Committed,
    Aborted,
}

/// Kind of a single buffered mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    WriteNode,
    DeleteNode,
    WriteRel,
    DeleteRel,
    SetProperty,
}

/// One recorded mutation within a WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalOperation {
    pub kind: OperationKind,
    pub target_id: String,
    pub payload: serde_json::Value,
}

/// A single link in the WAL chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub tx_id: u64,
    pub state: WalState,
    pub timestamp: i64,
    pub prev_cid: Option<Cid>,
    pub operations: Vec<WalOperation>,
}

/// Result of [`Wal::recover`]: which transactions to treat as committed,
/// which to roll back, which to discard outright.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub committed: Vec<u64>,
    pub rolled_back: Vec<u64>,
    pub discarded: Vec<u64>,
}

/// Append-only log stored as a chain of blocks in a [`BlockStore`], with a
/// mutable head pointer naming the newest entry's CID.
pub struct Wal {
    store: std::sync::Arc<BlockStore>,
    head: Mutex<Option<Cid>>,
}

impl Wal {
    pub fn new(store: std::sync::Arc<BlockStore>) -> Self {
        Self { store, head: Mutex::new(None) }
    }

    pub fn head(&self) -> Option<Cid> {
        self.head.lock().clone()
    }

    /// Computes the entry's CID, links `prev_cid` to the current head,
    /// writes the block, and updates the head pointer. Single-writer
    /// discipline is the caller's responsibility (the transaction manager
    /// serializes commits).
    pub async fn append(&self, mut entry: WalEntry) -> Result<Cid> {
        entry.prev_cid = self.head.lock().clone();
        let cid = self.store.store_json(&entry).await?;
        *self.head.lock() = Some(cid.clone());
        Ok(cid)
    }

    /// Newest-to-oldest iteration, following `prev_cid`. Detects cycles
    /// (a CID seen twice) and flags them as corruption rather than looping
    /// forever.
    pub async fn read(&self) -> Result<Vec<WalEntry>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.head.lock().clone();
        while let Some(cid) = cursor {
            if !seen.insert(cid.clone()) {
                return Err(Error::StorageError(format!("WAL chain cycle detected at {cid}")));
            }
            let entry: WalEntry = self.store.retrieve_json(&cid).await.map_err(|_| {
                Error::StorageError(format!("malformed WAL entry at {cid}"))
            })?;
            cursor = entry.prev_cid.clone();
            out.push(entry);
        }
        Ok(out)
    }

    /// Walks the chain and returns the ordered history of one transaction's
    /// entries (there is normally exactly one, but retried commits may
    /// leave more than one COMMITTING attempt).
    pub async fn get_transaction_history(&self, tx_id: TxId) -> Result<Vec<WalEntry>> {
        let all = self.read().await?;
        Ok(all.into_iter().filter(|e| e.tx_id == tx_id.0).collect())
    }

    /// Rewrites the log starting from a fresh snapshot: the chain is reset
    /// so `up_to_cid` becomes (conceptually) the new origin. Concretely,
    /// for an append-only block store this means dropping the in-memory
    /// head back to `up_to_cid` and letting pre-compaction blocks become
    /// unreachable garbage — the blocks themselves are immutable and
    /// content-addressed, so nothing is rewritten in place.
    pub async fn compact(&self, up_to_cid: Cid) -> Result<()> {
        // Confirm the target is actually reachable before committing to it.
        let chain = self.read().await?;
        if !chain.is_empty() && !chain_contains(&self.store, &up_to_cid, &chain).await? {
            return Err(Error::StorageError(format!("compact target {up_to_cid} not found in chain")));
        }
        *self.head.lock() = Some(up_to_cid);
        Ok(())
    }

    /// Replays the chain to classify each transaction: COMMITTED entries
    /// replay idempotently (same CIDs, so reapplying is a no-op); a
    /// COMMITTING entry with no matching COMMITTED successor is rolled
    /// back; ABORTED entries are discarded.
    pub async fn recover(&self) -> Result<RecoveryPlan> {
        let chain = self.read().await?; // newest-first
        let mut plan = RecoveryPlan::default();
        let mut seen_tx = HashSet::new();
        for entry in &chain {
            if !seen_tx.insert(entry.tx_id) {
                continue; // only the newest entry per tx_id governs its outcome
            }
            match entry.state {
                WalState::Committed => plan.committed.push(entry.tx_id),
                WalState::Committing => plan.rolled_back.push(entry.tx_id),
                WalState::Aborted => plan.discarded.push(entry.tx_id),
            }
        }
        Ok(plan)
    }

    /// Walks the chain; `false` if any link is broken, any entry has zero
    /// operations, or any CID is unreachable.
    pub async fn verify_integrity(&self) -> Result<bool> {
        let Some(head) = self.head.lock().clone() else { return Ok(true) };
        let mut cursor = Some(head);
        let mut seen = HashSet::new();
        while let Some(cid) = cursor {
            if !seen.insert(cid.clone()) {
                return Ok(false);
            }
            let entry: WalEntry = match self.store.retrieve_json(&cid).await {
                Ok(e) => e,
                Err(_) => return Ok(false),
            };
            if entry.operations.is_empty() {
                return Ok(false);
            }
            cursor = entry.prev_cid.clone();
        }
        Ok(true)
    }
}

async fn chain_contains(store: &BlockStore, target: &Cid, _chain: &[WalEntry]) -> Result<bool> {
    Ok(store.retrieve(target).await.is_ok())
}
