//! Migration format registry: a process-wide table of named codecs, each
//! able to serialize a [`GraphSnapshot`] to a writer and rehydrate one
//! from a reader. Built-ins are registered lazily on first access to
//! [`registry`].

mod csv_format;
mod json_format;
mod pajek;
mod rdf;
mod xml_format;
#[cfg(feature = "car")]
mod car;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::storage::StorageBackend;
use crate::tx::TxMode;
use crate::{Error, Result};

/// The 64 KiB buffer size the streaming exporter writes in.
pub const STREAM_CHUNK_BYTES: usize = 64 * 1024;
/// Default node/relationship page size for the chunked iterators.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// An in-memory, format-agnostic snapshot of a graph: every node and
/// relationship, detached from any particular backend. Format codecs read
/// and write this shape; backend-specific code only has to translate to
/// and from it once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

impl GraphSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull every node and relationship out of a live backend.
    pub async fn from_backend<B: StorageBackend>(backend: &B) -> Result<Self> {
        let tx = backend.begin_tx(TxMode::ReadOnly).await?;
        let nodes = backend.all_nodes(&tx).await?;
        let mut relationships = Vec::new();
        for node in &nodes {
            let rels = backend.get_relationships(&tx, node.id, Direction::Outgoing, None).await?;
            relationships.extend(rels);
        }
        backend.commit_tx(tx).await?;
        Ok(Self { nodes, relationships })
    }

    /// Recreate this snapshot's nodes and relationships in a (presumably
    /// empty) backend. Original ids are not preserved across backends —
    /// relationships are re-pointed through an id translation table, so
    /// the result is equivalent under graph isomorphism modulo id
    /// renaming — that's all any round trip through an external format
    /// can promise.
    pub async fn apply_to_backend<B: StorageBackend>(&self, backend: &B) -> Result<()> {
        let mut tx = backend.begin_tx(TxMode::ReadWrite).await?;
        let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();
        for node in &self.nodes {
            let label_refs: Vec<&str> = node.labels.iter().map(|s| s.as_str()).collect();
            let new_id = backend.create_node(&mut tx, &label_refs, node.properties.clone()).await?;
            id_map.insert(node.id, new_id);
        }
        for rel in &self.relationships {
            let src = *id_map.get(&rel.src)
                .ok_or_else(|| Error::ExecutionError(format!("dangling relationship source {}", rel.src)))?;
            let dst = *id_map.get(&rel.dst)
                .ok_or_else(|| Error::ExecutionError(format!("dangling relationship target {}", rel.dst)))?;
            backend.create_relationship(&mut tx, src, dst, &rel.rel_type, rel.properties.clone()).await?;
        }
        backend.commit_tx(tx).await?;
        Ok(())
    }

    /// Iterate nodes in fixed-size pages.
    pub fn iter_nodes_chunked(&self, chunk_size: usize) -> impl Iterator<Item = &[Node]> {
        self.nodes.chunks(chunk_size.max(1))
    }

    /// Iterate relationships in fixed-size pages.
    pub fn iter_relationships_chunked(&self, chunk_size: usize) -> impl Iterator<Item = &[Relationship]> {
        self.relationships.chunks(chunk_size.max(1))
    }
}

/// A registered format plug-in: a pair of save/load functions operating on
/// byte streams.
pub struct FormatCodec {
    pub save: Box<dyn Fn(&GraphSnapshot, &mut dyn Write) -> Result<()> + Send + Sync>,
    pub load: Box<dyn Fn(&mut dyn Read) -> Result<GraphSnapshot> + Send + Sync>,
}

impl FormatCodec {
    pub fn new(
        save: impl Fn(&GraphSnapshot, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
        load: impl Fn(&mut dyn Read) -> Result<GraphSnapshot> + Send + Sync + 'static,
    ) -> Self {
        Self { save: Box::new(save), load: Box::new(load) }
    }
}

/// Process-wide table of named format codecs. The registry is shared
/// across all `Engine` instances; graph state itself is not.
pub struct FormatRegistry {
    codecs: RwLock<HashMap<String, FormatCodec>>,
}

impl FormatRegistry {
    fn with_builtins() -> Self {
        let registry = Self { codecs: RwLock::new(HashMap::new()) };
        registry.register("json", json_format::json_codec());
        registry.register("dag-json", json_format::dag_json_codec());
        registry.register("json-lines", json_format::json_lines_codec());
        registry.register("jsonl", json_format::json_lines_codec());
        registry.register("json-ld", json_format::json_ld_codec());
        registry.register("csv", csv_format::csv_codec());
        registry.register("graphml", xml_format::graphml_codec());
        registry.register("gexf", xml_format::gexf_codec());
        registry.register("pajek", pajek::pajek_codec());
        registry.register("rdf", rdf::ntriples_codec());
        registry.register("ntriples", rdf::ntriples_codec());
        #[cfg(feature = "car")]
        registry.register("car", car::car_codec());
        registry
    }

    pub fn register(&self, name: impl Into<String>, codec: FormatCodec) {
        self.codecs.write().unwrap().insert(name.into(), codec);
    }

    pub fn save(&self, snapshot: &GraphSnapshot, writer: &mut dyn Write, format: &str) -> Result<()> {
        let codecs = self.codecs.read().unwrap();
        let codec = codecs.get(format).ok_or_else(|| {
            Error::ExecutionError(format!("format '{format}' is not registered (missing crate feature?)"))
        })?;
        (codec.save)(snapshot, writer)
    }

    pub fn load(&self, reader: &mut dyn Read, format: &str) -> Result<GraphSnapshot> {
        let codecs = self.codecs.read().unwrap();
        let codec = codecs.get(format).ok_or_else(|| {
            Error::ExecutionError(format!("format '{format}' is not registered (missing crate feature?)"))
        })?;
        (codec.load)(reader)
    }

    /// Names of every currently-registered format.
    pub fn names(&self) -> Vec<String> {
        self.codecs.read().unwrap().keys().cloned().collect()
    }
}

static REGISTRY: OnceLock<FormatRegistry> = OnceLock::new();

/// Access the process-wide format registry, initializing it with the
/// built-in codecs on first call.
pub fn registry() -> &'static FormatRegistry {
    REGISTRY.get_or_init(FormatRegistry::with_builtins)
}

/// Serialize a backend's whole graph to a file in the given format.
pub async fn save_to_file<B: StorageBackend>(backend: &B, path: impl AsRef<Path>, format: &str) -> Result<()> {
    let snapshot = GraphSnapshot::from_backend(backend).await?;
    let file = std::fs::File::create(path.as_ref())?;
    let mut writer = std::io::BufWriter::with_capacity(STREAM_CHUNK_BYTES, file);
    registry().save(&snapshot, &mut writer, format)?;
    writer.flush()?;
    Ok(())
}

/// Load a graph from a file in the given format. Populates `backend`
/// with the loaded snapshot rather than constructing a fresh backend, so
/// callers can choose which engine the loaded graph lands in.
pub async fn load_from_file<B: StorageBackend>(backend: &B, path: impl AsRef<Path>, format: &str) -> Result<()> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut reader = std::io::BufReader::with_capacity(STREAM_CHUNK_BYTES, file);
    let snapshot = registry().load(&mut reader, format)?;
    snapshot.apply_to_backend(backend).await
}

/// Like [`save_to_file`] but against a caller-supplied writer rather
/// than a path, wrapped in the same `STREAM_CHUNK_BYTES` buffer so a
/// socket or pipe destination never sees
/// more than one 64 KiB write in flight at a time. Still builds one
/// in-memory [`GraphSnapshot`] up front — individual codecs that want to
/// avoid that (e.g. CSV/JSON-Lines, which are naturally row-at-a-time)
/// can instead drive [`GraphSnapshot::iter_nodes_chunked`]/
/// [`GraphSnapshot::iter_relationships_chunked`] directly.
pub async fn export_streaming<B: StorageBackend, W: Write>(backend: &B, writer: W, format: &str) -> Result<()> {
    let snapshot = GraphSnapshot::from_backend(backend).await?;
    let mut buffered = std::io::BufWriter::with_capacity(STREAM_CHUNK_BYTES, writer);
    registry().save(&snapshot, &mut buffered, format)?;
    buffered.flush()?;
    Ok(())
}

/// Render a [`Value`] as a bool-before-int typed string — `Value::Bool`
/// must be checked before `Int`/`Float`, since it would otherwise
/// satisfy an `is_numeric`-style check meant for those variants.
pub(crate) fn typed_literal(value: &Value) -> (&'static str, String) {
    match value {
        Value::Bool(b) => ("boolean", b.to_string()),
        Value::Int(i) => ("integer", i.to_string()),
        Value::Float(f) => ("double", f.to_string()),
        Value::String(s) => ("string", s.clone()),
        Value::Null => ("string", String::new()),
        other => ("string", format!("{other}")),
    }
}

/// Inverse of [`typed_literal`]: reconstruct a [`Value`] from the type tag
/// an exporter wrote and the literal text. Unknown tags fall back to a
/// plain string rather than failing the whole load — a typed value that
/// doesn't round-trip exactly is still better than an aborted import.
pub(crate) fn value_from_typed(tag: &str, text: &str) -> Value {
    match tag {
        "boolean" => text.parse::<bool>().map(Value::Bool).unwrap_or(Value::Null),
        "integer" | "int" | "long" => text.parse::<i64>().map(Value::Int).unwrap_or(Value::Null),
        "double" | "float" => text.parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
        "string" if text.is_empty() => Value::Null,
        _ => Value::String(text.to_string()),
    }
}
