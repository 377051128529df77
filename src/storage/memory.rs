//! In-memory, WAL-durable, index-backed graph engine.
//!
//! This is the reference implementation of `StorageBackend`. It composes
//! the four layered subsystems underneath it:
//!
//! - [`crate::block_store`] — content-addressed bytes for manifests and
//!   WAL entries (`save_graph`/`load_graph`).
//! - [`crate::wal`] — durability: every commit appends a chained entry.
//! - [`crate::index`] — secondary access paths kept consistent via hooks.
//! - [`crate::tx`] — the transaction state machine and conflict detection.
//!
//! Mutations are applied to the live node/relationship maps as they happen
//! (read-your-own-writes within a transaction), with an undo log recorded
//! alongside so a conflict or explicit rollback can unwind them before the
//! transaction's write-set ever reaches a committed WAL entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::tx::{
    EntityKey, IsolationLevel, Operation as TxOp, Transaction, TransactionManager, TxMode,
};
use crate::index::{IndexManager, IndexType};
use crate::wal::{OperationKind, Wal, WalEntry, WalOperation, WalState};
use crate::block_store::{BlockStore, Cid};
use crate::{Error, Result};
use super::{StorageBackend, ExpandDepth};

pub use crate::tx::TxId;

/// Default index order (config key `index.btree.order`, default 64).
pub const DEFAULT_BTREE_ORDER: usize = 64;

// ============================================================================
// Durable layout
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeBlock(Node);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelBlock(Relationship);

/// Block listing the current set of node/rel CIDs plus metadata, per
/// spec's `GraphManifest`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphManifest {
    pub node_cids: Vec<Cid>,
    pub rel_cids: Vec<Cid>,
    pub metadata: HashMap<String, Value>,
    pub version: u64,
}

// ============================================================================
// MemoryBackend / GraphEngine
// ============================================================================

/// In-memory property graph storage, durable via an append-only block
/// store + WAL, indexed via [`IndexManager`], transactional via
/// [`TransactionManager`].
///
/// Cheaply `Clone` — the clone shares the same underlying engine via
/// `Arc`, which is what lets `execute_async` dispatch onto a worker task
/// without the task borrowing from the caller's stack.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<GraphEngine>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct GraphEngine {
    nodes: RwLock<HashMap<NodeId, Node>>,
    relationships: RwLock<HashMap<RelId, Relationship>>,
    /// node_id → list of relationship IDs
    adjacency: RwLock<HashMap<NodeId, Vec<RelId>>>,
    /// label → set of node IDs (kept in sync by the index manager, mirrored
    /// here too for the zero-index-configured fast path).
    label_index: RwLock<HashMap<String, Vec<NodeId>>>,
    /// CIDs of the last-persisted form of each entity, for lazy hydration
    /// and for building the next manifest without re-serializing entities
    /// that did not change.
    node_cids: RwLock<HashMap<NodeId, Cid>>,
    rel_cids: RwLock<HashMap<RelId, Cid>>,
    next_node_id: AtomicU64,
    next_rel_id: AtomicU64,
    version: AtomicU64,

    block_store: Arc<BlockStore>,
    wal: Wal,
    index: IndexManager,
    txm: TransactionManager,
    head: Mutex<Option<Cid>>,
    /// Per-transaction undo log, applied in reverse on rollback or
    /// conflict-abort. Keyed by `TxId` so concurrent transactions don't
    /// interfere with each other's undo state.
    undo_logs: Mutex<HashMap<TxId, Vec<UndoOp>>>,
}

/// Inverse of a single applied mutation, used to unwind a transaction's
/// eagerly-applied writes on rollback/abort.
enum UndoOp {
    DeleteNode(NodeId),
    RestoreNode(Node),
    DeleteRelationship(RelId),
    RestoreRelationship(Relationship),
    SetNodeProperty { id: NodeId, key: String, previous: Option<Value> },
    SetRelProperty { id: RelId, key: String, previous: Option<Value> },
    RemoveLabel { id: NodeId, label: String },
    AddLabel { id: NodeId, label: String },
}

/// A transaction handle. Carries the isolation level it was opened with
/// and the set of node ids created within it (so a relationship can
/// reference an endpoint created earlier in the same, still-uncommitted
/// transaction).
pub struct MemoryTx {
    id: TxId,
    mode: TxMode,
}

impl Transaction for MemoryTx {
    fn mode(&self) -> TxMode { self.mode }
    fn id(&self) -> TxId { self.id }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_btree_order(DEFAULT_BTREE_ORDER)
    }

    pub fn with_btree_order(order: usize) -> Self {
        Self::from_parts(
            Arc::new(BlockStore::in_memory()),
            Arc::new(BlockStore::in_memory()),
            order,
        )
    }

    /// A graph engine backed by a filesystem block store rooted at `path`:
    /// blocks under `path/blocks`, the WAL chain under `path/wal`.
    pub fn with_fs_store(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let blocks = Arc::new(BlockStore::new(
            crate::block_store::FsRawBackend::new(path.join("blocks"))?,
            crate::block_store::DEFAULT_CACHE_CAPACITY,
        ));
        let wal_blocks = Arc::new(BlockStore::new(
            crate::block_store::FsRawBackend::new(path.join("wal"))?,
            crate::block_store::DEFAULT_CACHE_CAPACITY,
        ));
        Ok(Self::from_parts(blocks, wal_blocks, DEFAULT_BTREE_ORDER))
    }

    fn from_parts(block_store: Arc<BlockStore>, wal_blocks: Arc<BlockStore>, order: usize) -> Self {
        Self {
            inner: Arc::new(GraphEngine {
                nodes: RwLock::new(HashMap::new()),
                relationships: RwLock::new(HashMap::new()),
                adjacency: RwLock::new(HashMap::new()),
                label_index: RwLock::new(HashMap::new()),
                node_cids: RwLock::new(HashMap::new()),
                rel_cids: RwLock::new(HashMap::new()),
                next_node_id: AtomicU64::new(1),
                next_rel_id: AtomicU64::new(1),
                version: AtomicU64::new(0),
                block_store,
                wal: Wal::new(wal_blocks),
                index: IndexManager::new(order),
                txm: TransactionManager::new(),
                head: Mutex::new(None),
                undo_logs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin a transaction with an explicit isolation level.
    /// `StorageBackend::begin_tx` delegates here with
    /// `IsolationLevel::ReadCommitted` for callers that don't care.
    pub async fn begin_tx_with_isolation(&self, mode: TxMode, isolation: IsolationLevel) -> Result<MemoryTx> {
        let id = self.inner.txm.begin(mode, isolation);
        self.inner.undo_logs.lock().insert(id, Vec::new());
        Ok(MemoryTx { id, mode })
    }

    /// Direct access to the index manager, for `create_index`/`drop_index`/
    /// `list_indexes`/`get_index_stats` callers above the `StorageBackend`
    /// trait surface.
    pub fn indexes(&self) -> &IndexManager {
        &self.inner.index
    }

    /// Direct access to the WAL, for `recover()`/`verify_integrity()`
    /// callers above the trait surface.
    pub fn wal(&self) -> &Wal {
        &self.inner.wal
    }

    pub fn current_version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Serialize the current graph as a new manifest block, updating the
    /// head pointer.
    pub async fn save_graph(&self) -> Result<Cid> {
        let nodes = self.inner.nodes.read();
        let rels = self.inner.relationships.read();
        let mut node_cids = Vec::with_capacity(nodes.len());
        {
            let mut cid_map = self.inner.node_cids.write();
            for (id, node) in nodes.iter() {
                let cid = self.inner.block_store.store_json(&NodeBlock(node.clone())).await?;
                cid_map.insert(*id, cid.clone());
                node_cids.push(cid);
            }
        }
        let mut rel_cids = Vec::with_capacity(rels.len());
        {
            let mut cid_map = self.inner.rel_cids.write();
            for (id, rel) in rels.iter() {
                let cid = self.inner.block_store.store_json(&RelBlock(rel.clone())).await?;
                cid_map.insert(*id, cid.clone());
                rel_cids.push(cid);
            }
        }
        let version = self.inner.version.load(Ordering::SeqCst);
        let manifest = GraphManifest { node_cids, rel_cids, metadata: HashMap::new(), version };
        let manifest_cid = self.inner.block_store.store_json(&manifest).await?;
        *self.inner.head.lock() = Some(manifest_cid.clone());
        Ok(manifest_cid)
    }

    /// Rehydrate from the head manifest. Idempotent; an absent head yields
    /// an empty graph.
    pub async fn load_graph(&self) -> Result<()> {
        let Some(head) = self.inner.head.lock().clone() else { return Ok(()) };
        let manifest: GraphManifest = self.inner.block_store.retrieve_json(&head).await?;

        let mut nodes = HashMap::new();
        let mut node_cids = HashMap::new();
        for cid in &manifest.node_cids {
            let NodeBlock(node) = self.inner.block_store.retrieve_json(cid).await?;
            node_cids.insert(node.id, cid.clone());
            nodes.insert(node.id, node);
        }
        let mut rels = HashMap::new();
        let mut rel_cids = HashMap::new();
        for cid in &manifest.rel_cids {
            let RelBlock(rel) = self.inner.block_store.retrieve_json(cid).await?;
            rel_cids.insert(rel.id, cid.clone());
            rels.insert(rel.id, rel);
        }

        let mut adjacency: HashMap<NodeId, Vec<RelId>> = HashMap::new();
        let mut label_index: HashMap<String, Vec<NodeId>> = HashMap::new();
        for (id, node) in &nodes {
            adjacency.entry(*id).or_default();
            for label in &node.labels {
                label_index.entry(label.clone()).or_default().push(*id);
            }
        }
        for (id, rel) in &rels {
            adjacency.entry(rel.src).or_default().push(*id);
            if rel.src != rel.dst {
                adjacency.entry(rel.dst).or_default().push(*id);
            }
        }

        let max_node = nodes.keys().map(|n| n.0).max().unwrap_or(0);
        let max_rel = rels.keys().map(|r| r.0).max().unwrap_or(0);

        *self.inner.nodes.write() = nodes;
        *self.inner.relationships.write() = rels;
        *self.inner.adjacency.write() = adjacency;
        *self.inner.label_index.write() = label_index;
        *self.inner.node_cids.write() = node_cids;
        *self.inner.rel_cids.write() = rel_cids;
        self.inner.next_node_id.store(max_node + 1, Ordering::SeqCst);
        self.inner.next_rel_id.store(max_rel + 1, Ordering::SeqCst);
        self.inner.version.store(manifest.version, Ordering::SeqCst);
        Ok(())
    }

    /// Replays the WAL to classify in-flight transactions on startup:
    /// COMMITTED entries are idempotent no-ops against the
    /// already-persisted manifest, COMMITTING is treated as rolled back,
    /// ABORTED is discarded. Returns the plan for callers that want to
    /// inspect it; the live graph state already reflects `head`.
    pub async fn recover(&self) -> Result<crate::wal::RecoveryPlan> {
        self.load_graph().await?;
        self.inner.wal.recover().await
    }

    fn push_undo(&self, tx: TxId, op: UndoOp) {
        if let Some(log) = self.inner.undo_logs.lock().get_mut(&tx) {
            log.push(op);
        }
    }

    fn record_write(&self, tx: &MemoryTx, entity: EntityKey, op: TxOp) -> Result<()> {
        self.inner.txm.add_operation(tx.id, entity, op)
    }

    fn record_read(&self, tx: &MemoryTx, entity: EntityKey) {
        // Best-effort: read-tracking only matters for REPEATABLE_READ/
        // SERIALIZABLE and is a no-op (by construction) under READ_COMMITTED.
        let _ = self.inner.txm.add_read(tx.id, entity);
    }

    /// Unwind a transaction's eagerly-applied mutations, in reverse order.
    fn undo(&self, tx: TxId) {
        let ops = self.inner.undo_logs.lock().remove(&tx).unwrap_or_default();
        for op in ops.into_iter().rev() {
            match op {
                UndoOp::DeleteNode(id) => {
                    self.inner.nodes.write().remove(&id);
                }
                UndoOp::RestoreNode(node) => {
                    let id = node.id;
                    for label in &node.labels {
                        self.inner.label_index.write().entry(label.clone()).or_default().push(id);
                    }
                    self.inner.nodes.write().insert(id, node);
                }
                UndoOp::DeleteRelationship(id) => {
                    self.inner.relationships.write().remove(&id);
                }
                UndoOp::RestoreRelationship(rel) => {
                    let id = rel.id;
                    let mut adj = self.inner.adjacency.write();
                    adj.entry(rel.src).or_default().push(id);
                    if rel.src != rel.dst {
                        adj.entry(rel.dst).or_default().push(id);
                    }
                    drop(adj);
                    self.inner.relationships.write().insert(id, rel);
                }
                UndoOp::SetNodeProperty { id, key, previous } => {
                    if let Some(node) = self.inner.nodes.write().get_mut(&id) {
                        match previous {
                            Some(v) => { node.properties.insert(key, v); }
                            None => { node.properties.remove(&key); }
                        }
                    }
                }
                UndoOp::SetRelProperty { id, key, previous } => {
                    if let Some(rel) = self.inner.relationships.write().get_mut(&id) {
                        match previous {
                            Some(v) => { rel.properties.insert(key, v); }
                            None => { rel.properties.remove(&key); }
                        }
                    }
                }
                UndoOp::RemoveLabel { id, label } => {
                    if let Some(node) = self.inner.nodes.write().get_mut(&id) {
                        node.labels.retain(|l| l != &label);
                    }
                    if let Some(ids) = self.inner.label_index.write().get_mut(&label) {
                        ids.retain(|nid| *nid != id);
                    }
                }
                UndoOp::AddLabel { id, label } => {
                    if let Some(node) = self.inner.nodes.write().get_mut(&id) {
                        if !node.labels.contains(&label) {
                            node.labels.push(label.clone());
                        }
                    }
                    self.inner.label_index.write().entry(label).or_default().push(id);
                }
            }
        }
    }

    async fn wal_operations_for(&self, tx: TxId) -> Vec<WalOperation> {
        self.inner.txm.operations(tx).into_iter().map(|op| match op {
            TxOp::CreateNode { id, .. } => WalOperation {
                kind: OperationKind::WriteNode, target_id: id.to_string(), payload: serde_json::Value::Null,
            },
            TxOp::DeleteNode { id } => WalOperation {
                kind: OperationKind::DeleteNode, target_id: id.to_string(), payload: serde_json::Value::Null,
            },
            TxOp::SetNodeProperty { id, key, value } => WalOperation {
                kind: OperationKind::SetProperty, target_id: id.to_string(),
                payload: serde_json::json!({"key": key, "value": format!("{value}")}),
            },
            TxOp::RemoveNodeProperty { id, key } => WalOperation {
                kind: OperationKind::SetProperty, target_id: id.to_string(),
                payload: serde_json::json!({"key": key, "removed": true}),
            },
            TxOp::AddLabel { id, label } => WalOperation {
                kind: OperationKind::WriteNode, target_id: id.to_string(),
                payload: serde_json::json!({"add_label": label}),
            },
            TxOp::RemoveLabel { id, label } => WalOperation {
                kind: OperationKind::WriteNode, target_id: id.to_string(),
                payload: serde_json::json!({"remove_label": label}),
            },
            TxOp::CreateRelationship { id, .. } => WalOperation {
                kind: OperationKind::WriteRel, target_id: id.to_string(), payload: serde_json::Value::Null,
            },
            TxOp::DeleteRelationship { id } => WalOperation {
                kind: OperationKind::DeleteRel, target_id: id.to_string(), payload: serde_json::Value::Null,
            },
            TxOp::SetRelationshipProperty { id, key, value } => WalOperation {
                kind: OperationKind::SetProperty, target_id: id.to_string(),
                payload: serde_json::json!({"key": key, "value": format!("{value}")}),
            },
            TxOp::RemoveRelationshipProperty { id, key } => WalOperation {
                kind: OperationKind::SetProperty, target_id: id.to_string(),
                payload: serde_json::json!({"key": key, "removed": true}),
            },
        }).collect()
    }

    /// Commit path: (1) detect conflicts, (2) operations are
    /// already applied eagerly, (3) persist a manifest, (4) append a
    /// COMMITTED WAL entry. Any failure in 1–3 rolls back; a failure
    /// appending the WAL entry is retried once before surfacing
    /// `Error::TxError` with the transaction left `Committing`.
    async fn commit_internal(&self, tx: MemoryTx) -> Result<()> {
        if let Err(e) = self.inner.txm.check_conflicts(tx.id) {
            // Nothing was ever durably applied for this transaction, so
            // there is no WAL entry to write — only a successful commit's
            // manifest+WAL pair needs to be recorded (an entry with no
            // operations would trip `Wal::verify_integrity`).
            self.undo(tx.id);
            return Err(e);
        }

        let ops = self.wal_operations_for(tx.id).await;
        if ops.is_empty() {
            // Nothing buffered (read-only transaction) — nothing to persist.
            self.inner.undo_logs.lock().remove(&tx.id);
            self.inner.txm.finalize_commit(tx.id)?;
            return Ok(());
        }

        self.inner.version.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.save_graph().await {
            self.undo(tx.id);
            let _ = self.inner.txm.rollback(tx.id);
            return Err(e);
        }

        let entry = WalEntry {
            tx_id: tx.id.0,
            state: WalState::Committed,
            timestamp: wal_timestamp(),
            prev_cid: None,
            operations: ops,
        };
        match self.inner.wal.append(entry.clone()).await {
            Ok(_) => {}
            Err(_) => {
                // Retry once; on repeated failure surface a TxError and
                // leave the tx manager record as COMMITTING.
                if self.inner.wal.append(entry).await.is_err() {
                    return Err(Error::TxError(format!(
                        "transaction {} committed its manifest but failed to durably record its WAL entry after retry",
                        tx.id.0
                    )));
                }
            }
        }

        self.inner.undo_logs.lock().remove(&tx.id);
        self.inner.txm.finalize_commit(tx.id)?;
        Ok(())
    }

    async fn rollback_internal(&self, tx: MemoryTx) -> Result<()> {
        // Symmetric with the conflict-abort path in `commit_internal`:
        // an explicit rollback never reached the WAL either, so there is
        // nothing to record there.
        self.undo(tx.id);
        self.inner.txm.rollback(tx.id)?;
        Ok(())
    }
}

fn wal_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// StorageBackend impl
// ============================================================================

#[async_trait]
impl StorageBackend for MemoryBackend {
    type Tx = MemoryTx;

    async fn shutdown(&self) -> Result<()> { Ok(()) }

    async fn begin_tx(&self, mode: TxMode) -> Result<MemoryTx> {
        self.begin_tx_with_isolation(mode, IsolationLevel::ReadCommitted).await
    }

    async fn commit_tx(&self, tx: MemoryTx) -> Result<()> {
        self.commit_internal(tx).await
    }

    async fn rollback_tx(&self, tx: MemoryTx) -> Result<()> {
        self.rollback_internal(tx).await
    }

    // ========================================================================
    // Node CRUD
    // ========================================================================

    async fn create_node(
        &self,
        tx: &mut MemoryTx,
        labels: &[&str],
        props: PropertyMap,
    ) -> Result<NodeId> {
        let labels_vec: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        self.inner.index.check_unique_constraints(&labels_vec, &props)?;

        let id = NodeId(self.inner.next_node_id.fetch_add(1, Ordering::Relaxed));
        let node = Node {
            id,
            element_id: Some(id.to_string()),
            labels: labels_vec.clone(),
            properties: props.clone(),
        };

        {
            let mut idx = self.inner.label_index.write();
            for label in &node.labels {
                idx.entry(label.clone()).or_default().push(id);
            }
        }
        self.inner.nodes.write().insert(id, node);
        self.inner.adjacency.write().insert(id, Vec::new());
        self.inner.index.on_create_node(id, &labels_vec, &props)?;

        self.push_undo(tx.id, UndoOp::DeleteNode(id));
        self.record_write(tx, EntityKey::Node(id), TxOp::CreateNode { id, labels: labels_vec, props })?;
        Ok(id)
    }

    async fn get_node(&self, tx: &MemoryTx, id: NodeId) -> Result<Option<Node>> {
        self.record_read(tx, EntityKey::Node(id));
        Ok(self.inner.nodes.read().get(&id).cloned())
    }

    async fn delete_node(&self, tx: &mut MemoryTx, id: NodeId) -> Result<bool> {
        {
            let adj = self.inner.adjacency.read();
            if let Some(rels) = adj.get(&id) {
                if !rels.is_empty() {
                    return Err(Error::ConstraintViolation(
                        format!("Cannot delete node {id} with {} relationships. Delete relationships first.", rels.len())
                    ));
                }
            }
        }

        let removed = self.inner.nodes.write().remove(&id);
        self.inner.adjacency.write().remove(&id);

        if let Some(node) = &removed {
            let mut idx = self.inner.label_index.write();
            for label in &node.labels {
                if let Some(ids) = idx.get_mut(label) {
                    ids.retain(|nid| *nid != id);
                }
            }
            drop(idx);
            self.inner.index.on_delete_node(id, &node.labels, &node.properties)?;
            self.push_undo(tx.id, UndoOp::RestoreNode(node.clone()));
            self.record_write(tx, EntityKey::Node(id), TxOp::DeleteNode { id })?;
        }

        Ok(removed.is_some())
    }

    async fn set_node_property(
        &self,
        tx: &mut MemoryTx,
        id: NodeId,
        key: &str,
        val: Value,
    ) -> Result<()> {
        let (labels, old_props, new_props, previous) = {
            let mut nodes = self.inner.nodes.write();
            let node = nodes.get_mut(&id).ok_or_else(|| Error::NotFound(format!("Node {id}")))?;
            let old_props = node.properties.clone();
            let previous = node.properties.insert(key.to_string(), val.clone());
            (node.labels.clone(), old_props, node.properties.clone(), previous)
        };
        self.inner.index.on_update_node(id, &labels, &old_props, &new_props)?;
        self.push_undo(tx.id, UndoOp::SetNodeProperty { id, key: key.to_string(), previous });
        self.record_write(tx, EntityKey::Node(id), TxOp::SetNodeProperty { id, key: key.to_string(), value: val })?;
        Ok(())
    }

    async fn remove_node_property(
        &self,
        tx: &mut MemoryTx,
        id: NodeId,
        key: &str,
    ) -> Result<()> {
        let (labels, old_props, new_props, previous) = {
            let mut nodes = self.inner.nodes.write();
            let node = nodes.get_mut(&id).ok_or_else(|| Error::NotFound(format!("Node {id}")))?;
            let old_props = node.properties.clone();
            let previous = node.properties.remove(key);
            (node.labels.clone(), old_props, node.properties.clone(), previous)
        };
        self.inner.index.on_update_node(id, &labels, &old_props, &new_props)?;
        self.push_undo(tx.id, UndoOp::SetNodeProperty { id, key: key.to_string(), previous });
        self.record_write(tx, EntityKey::Node(id), TxOp::RemoveNodeProperty { id, key: key.to_string() })?;
        Ok(())
    }

    async fn add_label(&self, tx: &mut MemoryTx, id: NodeId, label: &str) -> Result<()> {
        let added = {
            let mut nodes = self.inner.nodes.write();
            let node = nodes.get_mut(&id).ok_or_else(|| Error::NotFound(format!("Node {id}")))?;
            if node.labels.contains(&label.to_string()) {
                false
            } else {
                node.labels.push(label.to_string());
                true
            }
        };
        if added {
            self.inner.label_index.write().entry(label.to_string()).or_default().push(id);
            self.push_undo(tx.id, UndoOp::RemoveLabel { id, label: label.to_string() });
            self.record_write(tx, EntityKey::Node(id), TxOp::AddLabel { id, label: label.to_string() })?;
        }
        Ok(())
    }

    async fn remove_label(&self, tx: &mut MemoryTx, id: NodeId, label: &str) -> Result<()> {
        let removed = {
            let mut nodes = self.inner.nodes.write();
            let node = nodes.get_mut(&id).ok_or_else(|| Error::NotFound(format!("Node {id}")))?;
            let had = node.labels.contains(&label.to_string());
            node.labels.retain(|l| l != label);
            had
        };
        if removed {
            if let Some(ids) = self.inner.label_index.write().get_mut(label) {
                ids.retain(|nid| *nid != id);
            }
            self.push_undo(tx.id, UndoOp::AddLabel { id, label: label.to_string() });
            self.record_write(tx, EntityKey::Node(id), TxOp::RemoveLabel { id, label: label.to_string() })?;
        }
        Ok(())
    }

    // ========================================================================
    // Relationship CRUD
    // ========================================================================

    async fn create_relationship(
        &self,
        tx: &mut MemoryTx,
        src: NodeId,
        dst: NodeId,
        rel_type: &str,
        props: PropertyMap,
    ) -> Result<RelId> {
        {
            let nodes = self.inner.nodes.read();
            if !nodes.contains_key(&src) {
                return Err(Error::NotFound(format!("Node {src}")));
            }
            if !nodes.contains_key(&dst) {
                return Err(Error::NotFound(format!("Node {dst}")));
            }
        }

        let id = RelId(self.inner.next_rel_id.fetch_add(1, Ordering::Relaxed));
        let rel = Relationship {
            id,
            element_id: Some(id.to_string()),
            src,
            dst,
            rel_type: rel_type.to_string(),
            properties: props.clone(),
        };

        self.inner.relationships.write().insert(id, rel);

        let mut adj = self.inner.adjacency.write();
        adj.entry(src).or_default().push(id);
        if src != dst {
            adj.entry(dst).or_default().push(id);
        }
        drop(adj);

        self.inner.index.on_create_relationship(id, rel_type);
        self.push_undo(tx.id, UndoOp::DeleteRelationship(id));
        self.record_write(
            tx, EntityKey::Relationship(id),
            TxOp::CreateRelationship { id, src, dst, rel_type: rel_type.to_string(), props },
        )?;
        Ok(id)
    }

    async fn get_relationship(&self, tx: &MemoryTx, id: RelId) -> Result<Option<Relationship>> {
        self.record_read(tx, EntityKey::Relationship(id));
        Ok(self.inner.relationships.read().get(&id).cloned())
    }

    async fn set_relationship_property(
        &self,
        tx: &mut MemoryTx,
        id: RelId,
        key: &str,
        val: Value,
    ) -> Result<()> {
        let mut rels = self.inner.relationships.write();
        let rel = rels.get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Relationship {id}")))?;
        let previous = rel.properties.insert(key.to_string(), val.clone());
        drop(rels);
        self.push_undo(tx.id, UndoOp::SetRelProperty { id, key: key.to_string(), previous });
        self.record_write(tx, EntityKey::Relationship(id), TxOp::SetRelationshipProperty { id, key: key.to_string(), value: val })?;
        Ok(())
    }

    async fn remove_relationship_property(
        &self,
        tx: &mut MemoryTx,
        id: RelId,
        key: &str,
    ) -> Result<()> {
        let mut rels = self.inner.relationships.write();
        let rel = rels.get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Relationship {id}")))?;
        let previous = rel.properties.remove(key);
        drop(rels);
        self.push_undo(tx.id, UndoOp::SetRelProperty { id, key: key.to_string(), previous });
        self.record_write(tx, EntityKey::Relationship(id), TxOp::RemoveRelationshipProperty { id, key: key.to_string() })?;
        Ok(())
    }

    async fn delete_relationship(&self, tx: &mut MemoryTx, id: RelId) -> Result<bool> {
        let removed = self.inner.relationships.write().remove(&id);
        if let Some(rel) = &removed {
            let mut adj = self.inner.adjacency.write();
            if let Some(rels) = adj.get_mut(&rel.src) {
                rels.retain(|rid| *rid != id);
            }
            if rel.src != rel.dst {
                if let Some(rels) = adj.get_mut(&rel.dst) {
                    rels.retain(|rid| *rid != id);
                }
            }
            drop(adj);
            self.inner.index.on_delete_relationship(id, &rel.rel_type);
            self.push_undo(tx.id, UndoOp::RestoreRelationship(rel.clone()));
            self.record_write(tx, EntityKey::Relationship(id), TxOp::DeleteRelationship { id })?;
        }
        Ok(removed.is_some())
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    async fn get_relationships(
        &self,
        tx: &MemoryTx,
        node: NodeId,
        dir: Direction,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        let adj = self.inner.adjacency.read();
        let rels = self.inner.relationships.read();

        let rel_ids = adj.get(&node).cloned().unwrap_or_default();
        let mut result = Vec::new();

        for rid in rel_ids {
            if let Some(rel) = rels.get(&rid) {
                let matches_dir = match dir {
                    Direction::Outgoing => rel.src == node,
                    Direction::Incoming => rel.dst == node,
                    Direction::Both => true,
                };
                let matches_type = rel_type.map_or(true, |t| rel.rel_type == t);

                if matches_dir && matches_type {
                    result.push(rel.clone());
                }
            }
        }
        let _ = tx;
        Ok(result)
    }

    async fn expand(
        &self,
        tx: &MemoryTx,
        node: NodeId,
        dir: Direction,
        rel_types: &[&str],
        depth: ExpandDepth,
    ) -> Result<Vec<Path>> {
        let (min_depth, max_depth) = match depth {
            ExpandDepth::Exact(d) => (d, d),
            ExpandDepth::Range { min, max } => (min, max),
            ExpandDepth::Unbounded => (1, 100),
        };

        let mut results = Vec::new();
        let Some(start_node) = self.get_node(tx, node).await? else {
            // Missing start node: traversal yields no results, not an error.
            return Ok(results);
        };

        // `Both` traversal deduplicates at row level by a canonical path key:
        // the sorted pair of (node_id, node_id)
        // per hop plus the relationship id set, so the same simple path
        // reached by two edge-direction orderings isn't emitted twice.
        let mut seen_keys: std::collections::HashSet<Vec<(u64, u64, u64)>> = std::collections::HashSet::new();

        let mut queue: Vec<Path> = vec![Path::single(start_node)];

        for current_depth in 0..max_depth {
            let mut next_queue = Vec::new();

            for path in &queue {
                let tip = path.end();
                let rels = self.get_relationships(tx, tip.id, dir, None).await?;

                for rel in rels {
                    if !rel_types.is_empty() && !rel_types.contains(&rel.rel_type.as_str()) {
                        continue;
                    }

                    let next_id = match dir {
                        Direction::Both => rel.other_node(tip.id).unwrap_or(rel.dst),
                        _ => rel.other_node(tip.id).unwrap_or(rel.dst),
                    };

                    if path.nodes.iter().any(|n| n.id == next_id) {
                        continue;
                    }

                    if let Some(next_node) = self.get_node(tx, next_id).await? {
                        let mut new_path = path.clone();
                        new_path.append(rel, next_node);

                        if current_depth + 1 >= min_depth {
                            if dir == Direction::Both {
                                let key = canonical_path_key(&new_path);
                                if !seen_keys.insert(key) {
                                    continue;
                                }
                            }
                            results.push(new_path.clone());
                        }
                        if current_depth + 1 < max_depth {
                            next_queue.push(new_path);
                        }
                    }
                }
            }

            queue = next_queue;
            if queue.is_empty() { break; }
        }

        Ok(results)
    }

    // ========================================================================
    // Index
    // ========================================================================

    async fn create_index(&self, label: &str, property: &str, index_type: IndexType) -> Result<()> {
        match index_type {
            IndexType::FullText => { self.inner.index.create_fulltext_index(label, property)?; }
            _ => { self.inner.index.create_property_index(label, &[property.to_string()], index_type, index_type == IndexType::Unique)?; }
        }
        Ok(())
    }

    async fn drop_index(&self, label: &str, property: &str) -> Result<()> {
        self.inner.index.drop_index(&format!("{label}:{property}"))?;
        self.inner.index.drop_index(&format!("fulltext:{label}:{property}"))
    }

    // ========================================================================
    // Schema introspection
    // ========================================================================

    async fn node_count(&self, _tx: &MemoryTx) -> Result<u64> {
        Ok(self.inner.nodes.read().len() as u64)
    }

    async fn relationship_count(&self, _tx: &MemoryTx) -> Result<u64> {
        Ok(self.inner.relationships.read().len() as u64)
    }

    async fn labels(&self, _tx: &MemoryTx) -> Result<Vec<String>> {
        Ok(self.inner.label_index.read().keys().cloned().collect())
    }

    async fn relationship_types(&self, _tx: &MemoryTx) -> Result<Vec<String>> {
        let rels = self.inner.relationships.read();
        let mut types: Vec<String> = rels.values().map(|r| r.rel_type.clone()).collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    // ========================================================================
    // Scan
    // ========================================================================

    async fn all_nodes(&self, _tx: &MemoryTx) -> Result<Vec<Node>> {
        Ok(self.inner.nodes.read().values().cloned().collect())
    }

    async fn nodes_by_label(&self, _tx: &MemoryTx, label: &str) -> Result<Vec<Node>> {
        let idx = self.inner.label_index.read();
        let nodes = self.inner.nodes.read();
        let ids = idx.get(label).cloned().unwrap_or_default();
        Ok(ids.iter().filter_map(|id| nodes.get(id).cloned()).collect())
    }

    async fn nodes_by_property(
        &self,
        _tx: &MemoryTx,
        label: &str,
        key: &str,
        value: &Value,
    ) -> Result<Vec<Node>> {
        // Prefer an index if one exists over (label, key); fall back to a
        // full scan otherwise.
        if let Some(ids) = self.inner.index.lookup_equality(label, key, value) {
            let nodes = self.inner.nodes.read();
            return Ok(ids.iter().filter_map(|id| nodes.get(id).cloned()).collect());
        }
        let idx = self.inner.label_index.read();
        let nodes = self.inner.nodes.read();
        let ids = idx.get(label).cloned().unwrap_or_default();
        Ok(ids.iter()
            .filter_map(|id| nodes.get(id))
            .filter(|n| n.get(key) == Some(value))
            .cloned()
            .collect())
    }
}

/// Sorted-pair path key used to dedup `Both`-direction expansion rows.
fn canonical_path_key(path: &Path) -> Vec<(u64, u64, u64)> {
    path.triples().map(|(a, rel, b)| {
        let (lo, hi) = if a.id.0 <= b.id.0 { (a.id.0, b.id.0) } else { (b.id.0, a.id.0) };
        (lo, hi, rel.id.0)
    }).collect()
}
