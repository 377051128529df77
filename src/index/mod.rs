//! Secondary index management.
//!
//! Keeps B-tree property indexes, composite indexes, label indexes,
//! relationship indexes and full-text indexes consistent with the graph
//! engine's node/rel maps. Coupling with `storage::memory` is one-way:
//! the engine calls into `IndexManager` on every mutation; the manager
//! never reaches back into the node/rel maps itself.

mod btree;

pub use btree::BTree;

use std::cmp::Ordering;
use std::collections::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::{NodeId, RelId, Value};
use crate::{Error, Result};

/// Total-order wrapper around a composite property key.
///
/// `Value` intentionally has no `Ord` impl — Neo4j comparison semantics
/// return `None` for incomparable operands (nulls, cross-type), which is
/// right for query evaluation but wrong for a tree that needs every pair
/// of keys ordered. This gives the index its own canonical order: by
/// type rank first (so a tree never panics on heterogeneous properties),
/// then by value within a type.
#[derive(Debug, Clone, PartialEq)]
struct IndexKey(Vec<Value>);

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = value_rank_cmp(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

fn value_type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::String(_) => 3,
        _ => 4,
    }
}

fn value_rank_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => value_type_rank(a).cmp(&value_type_rank(b)),
    }
}

/// Type of index to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    /// B-tree index for equality and range queries.
    BTree,
    /// Full-text search index.
    FullText,
    /// Unique constraint (implies B-tree).
    Unique,
    /// Vector similarity index.
    Vector,
}

/// Statistics reported for a single index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub entries: usize,
    pub depth: usize,
    pub bytes: usize,
    pub hit_rate: f64,
}

/// A handle describing one live index, returned by `IndexManager::list`.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub label: String,
    pub properties: Vec<String>,
    pub index_type: IndexType,
    pub unique: bool,
}

struct PropertyIndex {
    label: String,
    properties: Vec<String>,
    unique: bool,
    index_type: IndexType,
    tree: BTree<IndexKey, NodeId>,
    lookups: u64,
    hits: u64,
}

struct RelTypeIndex {
    /// (rel_type) -> relationship ids
    by_type: HashMap<String, Vec<RelId>>,
}

struct FullTextIndex {
    label: String,
    property: String,
    /// token -> node ids containing that token (lowercased, whitespace split)
    postings: HashMap<String, Vec<NodeId>>,
}

/// Central registry of secondary indexes over the graph.
///
/// Every index has its own lock. `IndexManager` never mutates nodes/rels;
/// the graph engine calls it on
/// every CRUD operation to keep indexes in sync.
pub struct IndexManager {
    order: usize,
    property_indexes: RwLock<HashMap<String, PropertyIndex>>,
    label_index: RwLock<HashMap<String, Vec<NodeId>>>,
    rel_type_index: RwLock<RelTypeIndex>,
    fulltext_indexes: RwLock<HashMap<String, FullTextIndex>>,
}

fn index_name(label: &str, properties: &[String]) -> String {
    format!("{label}:{}", properties.join(","))
}

impl IndexManager {
    pub fn new(order: usize) -> Self {
        Self {
            order: order.max(3),
            property_indexes: RwLock::new(HashMap::new()),
            label_index: RwLock::new(HashMap::new()),
            rel_type_index: RwLock::new(RelTypeIndex { by_type: HashMap::new() }),
            fulltext_indexes: RwLock::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Index lifecycle
    // ========================================================================

    /// Create a property (or composite) B-tree index on `label` over
    /// `properties`. `unique` enforces a unique constraint at insert time.
    pub fn create_property_index(
        &self,
        label: &str,
        properties: &[String],
        index_type: IndexType,
        unique: bool,
    ) -> Result<String> {
        let name = index_name(label, properties);
        let mut indexes = self.property_indexes.write();
        indexes.entry(name.clone()).or_insert_with(|| PropertyIndex {
            label: label.to_string(),
            properties: properties.to_vec(),
            unique,
            index_type,
            tree: BTree::new(self.order),
            lookups: 0,
            hits: 0,
        });
        Ok(name)
    }

    pub fn create_fulltext_index(&self, label: &str, property: &str) -> Result<String> {
        let name = format!("fulltext:{label}:{property}");
        let mut indexes = self.fulltext_indexes.write();
        indexes.entry(name.clone()).or_insert_with(|| FullTextIndex {
            label: label.to_string(),
            property: property.to_string(),
            postings: HashMap::new(),
        });
        Ok(name)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.property_indexes.write().remove(name);
        self.fulltext_indexes.write().remove(name);
        Ok(())
    }

    pub fn list_indexes(&self) -> Vec<IndexDescriptor> {
        let mut out = Vec::new();
        for (name, idx) in self.property_indexes.read().iter() {
            out.push(IndexDescriptor {
                name: name.clone(),
                label: idx.label.clone(),
                properties: idx.properties.clone(),
                index_type: idx.index_type,
                unique: idx.unique,
            });
        }
        for (name, idx) in self.fulltext_indexes.read().iter() {
            out.push(IndexDescriptor {
                name: name.clone(),
                label: idx.label.clone(),
                properties: vec![idx.property.clone()],
                index_type: IndexType::FullText,
                unique: false,
            });
        }
        out
    }

    /// Rebuild an index from scratch given the current full node set.
    /// Used after bulk loads or `load_graph()`.
    pub fn rebuild(&self, name: &str, nodes: &[(NodeId, Vec<String>, &crate::model::PropertyMap)]) -> Result<()> {
        let (label, properties, index_type, unique) = {
            let indexes = self.property_indexes.read();
            let idx = indexes.get(name).ok_or_else(|| Error::NotFound(format!("Index {name}")))?;
            (idx.label.clone(), idx.properties.clone(), idx.index_type, idx.unique)
        };
        let mut tree = BTree::new(self.order);
        for (id, labels, props) in nodes {
            if !labels.contains(&label) { continue; }
            if let Some(key) = composite_key(&properties, props) {
                tree.insert(IndexKey(key), *id);
            }
        }
        let mut indexes = self.property_indexes.write();
        if let Some(idx) = indexes.get_mut(name) {
            idx.tree = tree;
            idx.index_type = index_type;
            idx.unique = unique;
        }
        Ok(())
    }

    pub fn get_index_stats(&self, name: &str) -> Result<IndexStats> {
        let indexes = self.property_indexes.read();
        let idx = indexes.get(name).ok_or_else(|| Error::NotFound(format!("Index {name}")))?;
        let hit_rate = if idx.lookups == 0 { 0.0 } else { idx.hits as f64 / idx.lookups as f64 };
        Ok(IndexStats {
            entries: idx.tree.len(),
            depth: idx.tree.depth(),
            bytes: idx.tree.len() * std::mem::size_of::<(IndexKey, NodeId)>(),
            hit_rate,
        })
    }

    fn index_for(&self, label: &str, property: &str) -> Option<String> {
        let indexes = self.property_indexes.read();
        indexes.iter()
            .find(|(_, idx)| idx.label == label && idx.properties.first().map(String::as_str) == Some(property))
            .map(|(name, _)| name.clone())
    }

    /// Does an index over `label`/`property` exist? Used by the planner's
    /// index-pushdown decision (best-effort: backend still falls back to
    /// scan when this returns false).
    pub fn has_property_index(&self, label: &str, property: &str) -> bool {
        self.index_for(label, property).is_some()
    }

    // ========================================================================
    // Hooks invoked by the graph engine
    // ========================================================================

    /// Called after a node is inserted into the main map.
    pub fn on_create_node(&self, id: NodeId, labels: &[String], props: &crate::model::PropertyMap) -> Result<()> {
        for label in labels {
            self.label_index.write().entry(label.clone()).or_default().push(id);
        }
        self.index_node_properties(id, labels, props)?;
        Ok(())
    }

    /// Validates unique constraints for a prospective insert *before* the
    /// node reaches the main map. Must be called prior to `on_create_node`.
    pub fn check_unique_constraints(&self, labels: &[String], props: &crate::model::PropertyMap) -> Result<()> {
        let indexes = self.property_indexes.read();
        for idx in indexes.values() {
            if !idx.unique || !labels.contains(&idx.label) { continue; }
            if let Some(key) = composite_key(&idx.properties, props) {
                if !idx.tree.search(&IndexKey(key.clone())).is_empty() {
                    return Err(Error::ConstraintViolation(format!(
                        "unique constraint on {}({}) violated for value {:?}",
                        idx.label, idx.properties.join(","), key
                    )));
                }
            }
        }
        Ok(())
    }

    fn index_node_properties(&self, id: NodeId, labels: &[String], props: &crate::model::PropertyMap) -> Result<()> {
        let mut indexes = self.property_indexes.write();
        for idx in indexes.values_mut() {
            if !labels.contains(&idx.label) { continue; }
            if let Some(key) = composite_key(&idx.properties, props) {
                idx.tree.insert(IndexKey(key), id);
            }
        }
        drop(indexes);
        let mut fulltext = self.fulltext_indexes.write();
        for idx in fulltext.values_mut() {
            if !labels.contains(&idx.label) { continue; }
            if let Some(Value::String(s)) = props.get(&idx.property) {
                for token in tokenize(s) {
                    idx.postings.entry(token).or_default().push(id);
                }
            }
        }
        Ok(())
    }

    pub fn on_update_node(
        &self,
        id: NodeId,
        labels: &[String],
        old_props: &crate::model::PropertyMap,
        new_props: &crate::model::PropertyMap,
    ) -> Result<()> {
        self.on_delete_node_props(id, labels, old_props)?;
        self.check_unique_constraints(labels, new_props)?;
        self.index_node_properties(id, labels, new_props)?;
        Ok(())
    }

    fn on_delete_node_props(&self, id: NodeId, labels: &[String], props: &crate::model::PropertyMap) -> Result<()> {
        let mut indexes = self.property_indexes.write();
        for idx in indexes.values_mut() {
            if !labels.contains(&idx.label) { continue; }
            if let Some(key) = composite_key(&idx.properties, props) {
                idx.tree.remove(&IndexKey(key), &id);
            }
        }
        drop(indexes);
        let mut fulltext = self.fulltext_indexes.write();
        for idx in fulltext.values_mut() {
            if !labels.contains(&idx.label) { continue; }
            if let Some(Value::String(s)) = props.get(&idx.property) {
                for token in tokenize(s) {
                    if let Some(ids) = idx.postings.get_mut(&token) {
                        ids.retain(|nid| *nid != id);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn on_delete_node(&self, id: NodeId, labels: &[String], props: &crate::model::PropertyMap) -> Result<()> {
        for label in labels {
            let mut li = self.label_index.write();
            if let Some(ids) = li.get_mut(label) {
                ids.retain(|nid| *nid != id);
            }
        }
        self.on_delete_node_props(id, labels, props)
    }

    pub fn on_create_relationship(&self, id: RelId, rel_type: &str) {
        self.rel_type_index.write().by_type.entry(rel_type.to_string()).or_default().push(id);
    }

    pub fn on_delete_relationship(&self, id: RelId, rel_type: &str) {
        if let Some(ids) = self.rel_type_index.write().by_type.get_mut(rel_type) {
            ids.retain(|rid| *rid != id);
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn lookup_equality(&self, label: &str, property: &str, value: &Value) -> Option<Vec<NodeId>> {
        let name = self.index_for(label, property)?;
        let mut indexes = self.property_indexes.write();
        let idx = indexes.get_mut(&name)?;
        idx.lookups += 1;
        let found = idx.tree.search(&IndexKey(vec![value.clone()]));
        if !found.is_empty() { idx.hits += 1; }
        Some(found)
    }

    /// Inclusive/exclusive range lookup over a single-property index.
    pub fn lookup_range(
        &self,
        label: &str,
        property: &str,
        low: Option<&Value>,
        high: Option<&Value>,
        low_inclusive: bool,
        high_inclusive: bool,
    ) -> Option<Vec<NodeId>> {
        let name = self.index_for(label, property)?;
        let indexes = self.property_indexes.read();
        let idx = indexes.get(&name)?;
        Some(idx.tree.range(
            low.map(|v| IndexKey(vec![v.clone()])),
            high.map(|v| IndexKey(vec![v.clone()])),
            low_inclusive,
            high_inclusive,
        ))
    }

    pub fn nodes_by_label(&self, label: &str) -> Vec<NodeId> {
        self.label_index.read().get(label).cloned().unwrap_or_default()
    }

    pub fn rels_by_type(&self, rel_type: &str) -> Vec<RelId> {
        self.rel_type_index.read().by_type.get(rel_type).cloned().unwrap_or_default()
    }

    pub fn fulltext_search(&self, label: &str, property: &str, query: &str) -> Vec<NodeId> {
        let name = format!("fulltext:{label}:{property}");
        let indexes = self.fulltext_indexes.read();
        let Some(idx) = indexes.get(&name) else { return Vec::new() };
        let mut scores: HashMap<NodeId, usize> = HashMap::new();
        for token in tokenize(query) {
            if let Some(ids) = idx.postings.get(&token) {
                for id in ids {
                    *scores.entry(*id).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(NodeId, usize)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().map(|(id, _)| id).collect()
    }
}

fn composite_key(properties: &[String], props: &crate::model::PropertyMap) -> Option<Vec<Value>> {
    let mut key = Vec::with_capacity(properties.len());
    for p in properties {
        key.push(props.get(p)?.clone());
    }
    Some(key)
}

const STOPWORDS: &[&str] = &["a", "an", "the", "and", "or", "of", "to", "in", "is"];

fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}
