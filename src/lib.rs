//! # contentgraph — content-addressed property graph engine
//!
//! An embedded knowledge-graph engine with a Cypher-compatible query layer,
//! ACID transactions, secondary indexing and a pluggable migration format
//! registry. All graph state is an append-only log of content-addressed
//! blocks (`block_store`) plus a mutable head pointer, giving cheap
//! versioning and crash recovery (`wal`).
//!
//! ## Design principles
//!
//! 1. **Trait-first**: `StorageBackend` is the contract between query engine and storage
//! 2. **Clean DTOs**: `Node`, `Relationship`, `Value` cross all boundaries
//! 3. **Parser owns nothing**: Cypher → AST is a pure function
//! 4. **Backend-agnostic planner**: logical plans don't know about storage
//! 5. **Layered default backend**: `MemoryBackend` composes `block_store` +
//!    `wal` + `index` + `tx` rather than reimplementing graph state ad hoc.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use contentgraph::{Graph, Node, Value, PropertyMap};
//!
//! # async fn example() -> contentgraph::Result<()> {
//! // Connect to storage backend
//! let graph = Graph::open_memory().await?;
//!
//! // Execute Cypher
//! let mut params = PropertyMap::new();
//! params.insert("name".into(), Value::from("Ada"));
//! let result = graph.execute(
//!     "CREATE (n:Person {name: $name}) RETURN n",
//!     params,
//! ).await?;
//!
//! for row in &result.rows {
//!     println!("{:?}", row.get::<Node>("n")?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage backends
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | Memory | (default) | Content-addressed, WAL-durable, index-backed graph engine |
//! | Bolt | `bolt` | Connect to external Neo4j via Bolt protocol |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod cypher;
pub mod planner;
pub mod execution;
pub mod storage;
pub mod tx;
pub mod index;
pub mod block_store;
pub mod wal;
pub mod export;
pub mod format;
pub mod partition;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Node, Relationship, Path, Value, PropertyMap,
    NodeId, RelId, Direction,
};

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::{
    StorageBackend, BackendConfig, ConstraintType,
    BackendCapabilities, ProcedureResult,
};

// ============================================================================
// Re-exports: Transactions
// ============================================================================

pub use tx::{Transaction, TxMode, TxId};

// ============================================================================
// Re-exports: Execution
// ============================================================================

pub use execution::{CancellationToken, ExecutionOptions, QueryResult, ResultRow};

// ============================================================================
// Re-exports: Block store / WAL / format registry
// ============================================================================

pub use block_store::Cid;
pub use format::{FormatRegistry, GraphSnapshot};

// ============================================================================
// Top-level Graph handle
// ============================================================================

/// The primary entry point. A `Graph` wraps a storage backend and
/// provides Cypher execution.
pub struct Graph<B: StorageBackend> {
    backend: B,
    // Future: schema cache, index registry, prepared statement cache
}

impl<B: StorageBackend> Graph<B> {
    /// Create a Graph with the given backend.
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Execute a Cypher query with parameters.
    pub async fn execute<P>(&self, query: &str, params: P) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        // Phase 1: Parse
        let ast = cypher::parse(query)?;

        // Phase 2: Plan
        let params = params.into();
        let logical = planner::plan(&ast, &params)?;

        // Phase 3: Optimize
        let optimized = planner::optimize(logical)?;

        // Phase 4: Execute
        let mut tx = self.backend.begin_tx(TxMode::ReadOnly).await?;
        let result = execution::execute(&self.backend, &mut tx, optimized, params).await?;
        self.backend.commit_tx(tx).await?;

        Ok(result)
    }

    /// Execute a write query (CREATE, MERGE, DELETE, SET, etc.)
    pub async fn mutate<P>(&self, query: &str, params: P) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let ast = cypher::parse(query)?;
        let params = params.into();
        let logical = planner::plan(&ast, &params)?;
        let optimized = planner::optimize(logical)?;

        let mut tx = self.backend.begin_tx(TxMode::ReadWrite).await?;
        let result = execution::execute(&self.backend, &mut tx, optimized, params).await?;
        self.backend.commit_tx(tx).await?;

        Ok(result)
    }

    /// Execute a read query under a per-call deadline. On expiry the
    /// in-flight transaction is rolled back and the call returns
    /// `Error::QueryTimeout` rather than a partial result.
    pub async fn execute_with_timeout<P>(
        &self,
        query: &str,
        params: P,
        timeout: std::time::Duration,
    ) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        self.execute_with_options(query, params, execution::ExecutionOptions::with_timeout(timeout)).await
    }

    /// Execute a read query cooperatively cancellable via `token`. Calling
    /// `token.cancel()` from another task causes the next operator
    /// boundary the executor reaches to roll the transaction back and
    /// return `Error::Cancelled`.
    pub async fn execute_cancellable<P>(
        &self,
        query: &str,
        params: P,
        token: execution::CancellationToken,
    ) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        self.execute_with_options(query, params, execution::ExecutionOptions::with_cancellation(token)).await
    }

    async fn execute_with_options<P>(
        &self,
        query: &str,
        params: P,
        options: execution::ExecutionOptions,
    ) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let ast = cypher::parse(query)?;
        let params = params.into();
        let logical = planner::plan(&ast, &params)?;
        let optimized = planner::optimize(logical)?;

        let mut tx = self.backend.begin_tx(TxMode::ReadOnly).await?;
        let result = execution::execute_with_options(&self.backend, &mut tx, optimized, params, options).await;
        match result {
            Ok(result) => {
                self.backend.commit_tx(tx).await?;
                Ok(result)
            }
            Err(e) => {
                let _ = self.backend.rollback_tx(tx).await;
                Err(e)
            }
        }
    }

    /// Begin an explicit transaction.
    pub async fn begin(&self, mode: TxMode) -> Result<ExplicitTx<'_, B>> {
        let tx = self.backend.begin_tx(mode).await?;
        Ok(ExplicitTx { graph: self, tx })
    }

    /// Access the underlying backend (for advanced use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Create a secondary index.
    pub async fn create_index(
        &self,
        label: &str,
        property: &str,
        index_type: index::IndexType,
    ) -> Result<()> {
        self.backend.create_index(label, property, index_type).await
    }

    /// Drop a secondary index.
    pub async fn drop_index(&self, label: &str, property: &str) -> Result<()> {
        self.backend.drop_index(label, property).await
    }

    /// Register a migration format plug-in with the process-wide registry.
    pub fn register_format(&self, name: impl Into<String>, codec: format::FormatCodec) {
        format::registry().register(name, codec);
    }
}

/// In-memory graph for testing and embedding.
impl Graph<storage::MemoryBackend> {
    pub async fn open_memory() -> Result<Self> {
        let backend = storage::MemoryBackend::new();
        Ok(Self::with_backend(backend))
    }

    /// An in-memory engine that loads its graph from a filesystem-backed
    /// block store rooted at `path` if one already exists there, and
    /// persists to it on every `save`.
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let backend = storage::MemoryBackend::with_fs_store(path)?;
        backend.load_graph().await?;
        Ok(Self::with_backend(backend))
    }

    /// Persist the current graph as a new manifest and advance head. The
    /// path was fixed at `open` time for the filesystem-backed store;
    /// this just triggers the save.
    pub async fn save(&self) -> Result<Cid> {
        self.backend.save_graph().await
    }

    /// Rehydrate the in-memory graph from the backing store's head
    /// manifest.
    pub async fn load(&self) -> Result<()> {
        self.backend.load_graph().await
    }

    /// List all live indexes.
    pub fn list_indexes(&self) -> Vec<index::IndexDescriptor> {
        self.backend.indexes().list_indexes()
    }

    /// Execute a query on a worker task without blocking the caller's
    /// scheduler. The spawned task holds no mutable state of the caller —
    /// it owns a cloned `Arc`-backed backend handle, the query string and
    /// params.
    pub async fn execute_async<P>(
        &self,
        query: impl Into<String>,
        params: P,
    ) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let backend = self.backend.clone();
        let query = query.into();
        let params = params.into();
        let handle = tokio::task::spawn(async move {
            let graph = Graph::with_backend(backend);
            graph.execute(&query, params).await
        });
        handle.await.map_err(|e| Error::ExecutionError(format!("async task join failed: {e}")))?
    }
}

/// Explicit transaction handle with auto-rollback on drop.
pub struct ExplicitTx<'g, B: StorageBackend> {
    graph: &'g Graph<B>,
    tx: B::Tx,
}

impl<'g, B: StorageBackend> ExplicitTx<'g, B> {
    pub async fn execute<P>(&mut self, query: &str, params: P) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let ast = cypher::parse(query)?;
        let params = params.into();
        let logical = planner::plan(&ast, &params)?;
        let optimized = planner::optimize(logical)?;
        execution::execute(&self.graph.backend, &mut self.tx, optimized, params).await
    }

    pub async fn commit(self) -> Result<()> {
        self.graph.backend.commit_tx(self.tx).await
    }

    pub async fn rollback(self) -> Result<()> {
        self.graph.backend.rollback_tx(self.tx).await
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cypher syntax error at position {position}: {message}")]
    SyntaxError { position: usize, message: String },

    #[error("Semantic error: {0}")]
    SemanticError(String),

    #[error("Type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("Planning error: {0}")]
    PlanError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query timed out")]
    QueryTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;
