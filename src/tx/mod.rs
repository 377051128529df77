//! Transaction management.
//!
//! Two layers live here:
//! - `TxMode` / `TxId` / `Transaction` — the minimal, backend-agnostic
//!   contract every `StorageBackend::Tx` must satisfy.
//! - `TransactionManager` — the real engine `MemoryBackend` composes:
//!   per-transaction read/write sets, isolation-level conflict detection,
//!   and the NEW → ACTIVE → (COMMITTING → COMMITTED) | ABORTED state
//!   machine. Terminal states never revert.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{NodeId, PropertyMap, RelId, Value};
use crate::{Error, Result};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Transaction trait that all backends must implement.
pub trait Transaction: Send + Sync {
    fn mode(&self) -> TxMode;
    fn id(&self) -> TxId;
}

/// Isolation level, configurable per transaction via
/// `TransactionManager::begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// No conflict check: writes always overwrite.
    #[default]
    ReadCommitted,
    /// Abort if any entity in this tx's read-set was modified by another
    /// concurrently-committed tx.
    RepeatableRead,
    /// Abort if read-set OR write-set intersects a concurrently-committed
    /// tx's write-set.
    Serializable,
}

/// State machine. Terminal states (`Committed`, `Aborted`) never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    New,
    Active,
    Committing,
    Committed,
    Aborted,
}

/// A graph entity identified for read/write-set tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Node(NodeId),
    Relationship(RelId),
}

impl From<NodeId> for EntityKey {
    fn from(id: NodeId) -> Self { EntityKey::Node(id) }
}

impl From<RelId> for EntityKey {
    fn from(id: RelId) -> Self { EntityKey::Relationship(id) }
}

/// A single buffered write, recorded against the write-set and replayed by
/// the storage engine (and WAL) once `check_conflicts` has cleared.
#[derive(Debug, Clone)]
pub enum Operation {
    CreateNode { id: NodeId, labels: Vec<String>, props: PropertyMap },
    DeleteNode { id: NodeId },
    SetNodeProperty { id: NodeId, key: String, value: Value },
    RemoveNodeProperty { id: NodeId, key: String },
    AddLabel { id: NodeId, label: String },
    RemoveLabel { id: NodeId, label: String },
    CreateRelationship { id: RelId, src: NodeId, dst: NodeId, rel_type: String, props: PropertyMap },
    DeleteRelationship { id: RelId },
    SetRelationshipProperty { id: RelId, key: String, value: Value },
    RemoveRelationshipProperty { id: RelId, key: String },
}

struct TxRecord {
    mode: TxMode,
    isolation: IsolationLevel,
    state: TxState,
    /// Global commit-version counter observed at `begin` — the snapshot.
    began_at_version: u64,
    read_set: HashSet<EntityKey>,
    write_set: HashSet<EntityKey>,
    operations: Vec<Operation>,
}

/// Tracks active transactions, enforcing isolation via read/write-set
/// intersection against commits that happened after a transaction's
/// snapshot was taken.
///
/// Deterministic: given the same sequence of begin/commit/rollback calls
/// over the same graph, conflict outcomes are reproducible — there is no
/// background compaction or clock dependency in the decision path.
pub struct TransactionManager {
    next_tx_id: AtomicU64,
    /// Bumped once per successful commit; a tx's snapshot is this counter's
    /// value at `begin` time.
    commit_version: AtomicU64,
    /// Last commit-version that touched each entity, used for conflict
    /// detection. Entries are never removed — memory cost is bounded by
    /// live entity count, not transaction count.
    entity_versions: Mutex<HashMap<EntityKey, u64>>,
    active: Mutex<HashMap<TxId, TxRecord>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_tx_id: AtomicU64::new(1),
            commit_version: AtomicU64::new(0),
            entity_versions: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Records a snapshot of the current commit-version counter.
    pub fn begin(&self, mode: TxMode, isolation: IsolationLevel) -> TxId {
        let id = TxId(self.next_tx_id.fetch_add(1, AtomicOrdering::SeqCst));
        let snapshot = self.commit_version.load(AtomicOrdering::SeqCst);
        self.active.lock().insert(id, TxRecord {
            mode,
            isolation,
            state: TxState::Active,
            began_at_version: snapshot,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            operations: Vec::new(),
        });
        id
    }

    /// `None` once the transaction has reached a terminal state and been
    /// reaped (see `finalize_commit`/`rollback`).
    pub fn state(&self, tx: TxId) -> Option<TxState> {
        self.active.lock().get(&tx).map(|r| r.state)
    }

    pub fn isolation(&self, tx: TxId) -> Option<IsolationLevel> {
        self.active.lock().get(&tx).map(|r| r.isolation)
    }

    pub fn mode(&self, tx: TxId) -> Option<TxMode> {
        self.active.lock().get(&tx).map(|r| r.mode)
    }

    fn with_active<F, T>(&self, tx: TxId, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxRecord) -> Result<T>,
    {
        let mut active = self.active.lock();
        let record = active.get_mut(&tx).ok_or_else(|| Error::TxError(format!("unknown transaction {}", tx.0)))?;
        if record.state != TxState::Active {
            return Err(Error::TxError(format!("transaction {} is not active", tx.0)));
        }
        f(record)
    }

    /// Updates the read-set. Only consulted for REPEATABLE_READ/SERIALIZABLE.
    pub fn add_read(&self, tx: TxId, entity: EntityKey) -> Result<()> {
        self.with_active(tx, |r| {
            r.read_set.insert(entity);
            Ok(())
        })
    }

    /// Buffers a write and updates the write-set.
    pub fn add_operation(&self, tx: TxId, entity: EntityKey, op: Operation) -> Result<()> {
        self.with_active(tx, |r| {
            r.write_set.insert(entity);
            r.operations.push(op);
            Ok(())
        })
    }

    /// Step 1 of commit: detect conflicts against transactions that
    /// committed after this tx's snapshot was taken. Does not mutate any
    /// entity state. On success transitions the tx to `Committing`; on
    /// conflict transitions it straight to `Aborted` and reaps it.
    pub fn check_conflicts(&self, tx: TxId) -> Result<()> {
        let mut active = self.active.lock();
        let record = active.get_mut(&tx).ok_or_else(|| Error::TxError(format!("unknown transaction {}", tx.0)))?;
        if record.state != TxState::Active {
            return Err(Error::TxError(format!("transaction {} is not active", tx.0)));
        }
        let versions = self.entity_versions.lock();
        let conflicts = match record.isolation {
            IsolationLevel::ReadCommitted => false,
            IsolationLevel::RepeatableRead => record.read_set.iter().any(|e| {
                versions.get(e).is_some_and(|&v| v > record.began_at_version)
            }),
            IsolationLevel::Serializable => {
                record.read_set.iter().chain(record.write_set.iter()).any(|e| {
                    versions.get(e).is_some_and(|&v| v > record.began_at_version)
                })
            }
        };
        drop(versions);
        if conflicts {
            active.remove(&tx);
            return Err(Error::TxError(format!(
                "transaction {} aborted: conflicting concurrent commit", tx.0
            )));
        }
        record.state = TxState::Committing;
        Ok(())
    }

    /// The buffered operations, in the order they were added. The caller
    /// (the storage engine) applies these to its node/relationship maps and
    /// the index manager between `check_conflicts` and `finalize_commit`.
    pub fn operations(&self, tx: TxId) -> Vec<Operation> {
        self.active.lock().get(&tx).map(|r| r.operations.clone()).unwrap_or_default()
    }

    /// Step 4 of commit: bump the commit-version counter, stamp every
    /// touched entity with it, and move the tx to its terminal `Committed`
    /// state. Must only be called after the caller has durably applied
    /// `operations()` (persisted manifest + WAL COMMITTED entry).
    pub fn finalize_commit(&self, tx: TxId) -> Result<()> {
        let mut active = self.active.lock();
        let record = active.get_mut(&tx).ok_or_else(|| Error::TxError(format!("unknown transaction {}", tx.0)))?;
        if record.state != TxState::Committing {
            return Err(Error::TxError(format!("transaction {} is not committing", tx.0)));
        }
        let new_version = self.commit_version.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let mut versions = self.entity_versions.lock();
        for entity in &record.write_set {
            versions.insert(*entity, new_version);
        }
        drop(versions);
        active.remove(&tx);
        Ok(())
    }

    /// Discards buffers and moves the tx to its terminal `Aborted` state,
    /// returning the operations that were discarded (for callers that need
    /// to undo partially-applied in-memory state, e.g. optimistic backends
    /// that mutate eagerly).
    pub fn rollback(&self, tx: TxId) -> Result<Vec<Operation>> {
        let mut active = self.active.lock();
        let record = active.remove(&tx).ok_or_else(|| Error::TxError(format!("unknown transaction {}", tx.0)))?;
        Ok(record.operations)
    }

    /// Number of transactions currently active (for diagnostics/tests).
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_committed_never_conflicts() {
        let mgr = TransactionManager::new();
        let t1 = mgr.begin(TxMode::ReadWrite, IsolationLevel::ReadCommitted);
        let t2 = mgr.begin(TxMode::ReadWrite, IsolationLevel::ReadCommitted);

        mgr.add_operation(t1, EntityKey::Node(NodeId(1)), Operation::DeleteNode { id: NodeId(1) }).unwrap();
        mgr.check_conflicts(t1).unwrap();
        mgr.finalize_commit(t1).unwrap();

        mgr.add_read(t2, EntityKey::Node(NodeId(1))).unwrap();
        mgr.add_operation(t2, EntityKey::Node(NodeId(1)), Operation::DeleteNode { id: NodeId(1) }).unwrap();
        assert!(mgr.check_conflicts(t2).is_ok());
    }

    #[test]
    fn repeatable_read_aborts_on_concurrent_write() {
        let mgr = TransactionManager::new();
        let t1 = mgr.begin(TxMode::ReadWrite, IsolationLevel::RepeatableRead);
        mgr.add_read(t1, EntityKey::Node(NodeId(1))).unwrap();

        // A second tx commits a write to the same entity while t1 is active.
        let t2 = mgr.begin(TxMode::ReadWrite, IsolationLevel::ReadCommitted);
        mgr.add_operation(t2, EntityKey::Node(NodeId(1)), Operation::DeleteNode { id: NodeId(1) }).unwrap();
        mgr.check_conflicts(t2).unwrap();
        mgr.finalize_commit(t2).unwrap();

        mgr.add_operation(t1, EntityKey::Node(NodeId(1)), Operation::SetNodeProperty {
            id: NodeId(1), key: "x".into(), value: Value::Int(1),
        }).unwrap();
        assert!(mgr.check_conflicts(t1).is_err());
        assert_eq!(mgr.state(t1), None); // removed on abort
    }

    #[test]
    fn serializable_aborts_on_write_write_conflict() {
        let mgr = TransactionManager::new();
        let t1 = mgr.begin(TxMode::ReadWrite, IsolationLevel::Serializable);
        let t2 = mgr.begin(TxMode::ReadWrite, IsolationLevel::ReadCommitted);

        mgr.add_operation(t2, EntityKey::Node(NodeId(5)), Operation::DeleteNode { id: NodeId(5) }).unwrap();
        mgr.check_conflicts(t2).unwrap();
        mgr.finalize_commit(t2).unwrap();

        mgr.add_operation(t1, EntityKey::Node(NodeId(5)), Operation::DeleteNode { id: NodeId(5) }).unwrap();
        assert!(mgr.check_conflicts(t1).is_err());
    }

    #[test]
    fn rollback_discards_operations() {
        let mgr = TransactionManager::new();
        let t1 = mgr.begin(TxMode::ReadWrite, IsolationLevel::ReadCommitted);
        mgr.add_operation(t1, EntityKey::Node(NodeId(1)), Operation::DeleteNode { id: NodeId(1) }).unwrap();
        let ops = mgr.rollback(t1).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(mgr.state(t1).is_none());
    }
}
