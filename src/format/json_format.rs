//! JSON-family codecs: plain JSON, DAG-JSON, JSON-Lines, JSON-LD.
//!
//! `Node`/`Relationship` already derive `serde::{Serialize, Deserialize}`
//! (they cross the block-store boundary the same way), so `GraphSnapshot`
//! picks up the same derive and the plain "json" codec is a direct
//! `serde_json` round trip. The other three formats reshape the same
//! underlying data to match their distinct on-disk conventions.

use std::collections::HashMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::block_store::Cid;
use crate::model::*;
use crate::{Error, Result};

use super::{FormatCodec, GraphSnapshot};

// ============================================================================
// Plain JSON — `{"nodes": [...], "relationships": [...]}`
// ============================================================================

pub fn json_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| {
            serde_json::to_writer_pretty(writer, snapshot)
                .map_err(|e| Error::ExecutionError(format!("json export failed: {e}")))
        },
        |reader| {
            serde_json::from_reader(reader)
                .map_err(|e| Error::ExecutionError(format!("json import failed: {e}")))
        },
    )
}

// ============================================================================
// DAG-JSON — one JSON document per block, chained through a manifest of
// content-addressed CIDs.
// ============================================================================

#[derive(Serialize, Deserialize)]
struct DagManifest {
    version: u32,
    node_cids: Vec<Cid>,
    relationship_cids: Vec<Cid>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind")]
enum DagBlock {
    #[serde(rename = "node")]
    Node { cid: Cid, node: Node },
    #[serde(rename = "relationship")]
    Relationship { cid: Cid, relationship: Relationship },
}

pub fn dag_json_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_dag_json(snapshot, writer),
        |reader| read_dag_json(reader),
    )
}

fn write_dag_json(snapshot: &GraphSnapshot, writer: &mut dyn Write) -> Result<()> {
    let mut node_cids = Vec::with_capacity(snapshot.nodes.len());
    let mut node_lines = Vec::with_capacity(snapshot.nodes.len());
    for node in &snapshot.nodes {
        let bytes = serde_json::to_vec(node)
            .map_err(|e| Error::ExecutionError(format!("dag-json node encode failed: {e}")))?;
        let cid = Cid::of(&bytes);
        node_cids.push(cid.clone());
        node_lines.push(DagBlock::Node { cid, node: node.clone() });
    }
    let mut rel_cids = Vec::with_capacity(snapshot.relationships.len());
    let mut rel_lines = Vec::with_capacity(snapshot.relationships.len());
    for rel in &snapshot.relationships {
        let bytes = serde_json::to_vec(rel)
            .map_err(|e| Error::ExecutionError(format!("dag-json relationship encode failed: {e}")))?;
        let cid = Cid::of(&bytes);
        rel_cids.push(cid.clone());
        rel_lines.push(DagBlock::Relationship { cid, relationship: rel.clone() });
    }

    let manifest = DagManifest { version: 1, node_cids, relationship_cids: rel_cids };
    serde_json::to_writer(&mut *writer, &manifest)
        .map_err(|e| Error::ExecutionError(format!("dag-json manifest encode failed: {e}")))?;
    writeln!(writer)?;
    for block in node_lines.into_iter().chain(rel_lines) {
        serde_json::to_writer(&mut *writer, &block)
            .map_err(|e| Error::ExecutionError(format!("dag-json block encode failed: {e}")))?;
        writeln!(writer)?;
    }
    Ok(())
}

fn read_dag_json(reader: &mut dyn Read) -> Result<GraphSnapshot> {
    let mut text = String::new();
    reader.read_to_string(&mut text)
        .map_err(|e| Error::ExecutionError(format!("dag-json read failed: {e}")))?;
    let mut lines = text.lines();
    let manifest_line = lines.next()
        .ok_or_else(|| Error::ExecutionError("dag-json: missing manifest line".into()))?;
    let manifest: DagManifest = serde_json::from_str(manifest_line)
        .map_err(|e| Error::ExecutionError(format!("dag-json manifest decode failed: {e}")))?;

    let mut nodes_by_cid: HashMap<Cid, Node> = HashMap::new();
    let mut rels_by_cid: HashMap<Cid, Relationship> = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let block: DagBlock = serde_json::from_str(line)
            .map_err(|e| Error::ExecutionError(format!("dag-json block decode failed: {e}")))?;
        match block {
            DagBlock::Node { cid, node } => { nodes_by_cid.insert(cid, node); }
            DagBlock::Relationship { cid, relationship } => { rels_by_cid.insert(cid, relationship); }
        }
    }

    let nodes = manifest.node_cids.iter()
        .map(|cid| nodes_by_cid.remove(cid)
            .ok_or_else(|| Error::ExecutionError(format!("dag-json: manifest references missing node block {cid}"))))
        .collect::<Result<Vec<_>>>()?;
    let relationships = manifest.relationship_cids.iter()
        .map(|cid| rels_by_cid.remove(cid)
            .ok_or_else(|| Error::ExecutionError(format!("dag-json: manifest references missing relationship block {cid}"))))
        .collect::<Result<Vec<_>>>()?;

    Ok(GraphSnapshot { nodes, relationships })
}

// ============================================================================
// JSON-Lines — one record per line; the first line is the manifest.
// ============================================================================

#[derive(Serialize, Deserialize)]
struct JsonLinesPreamble {
    version: u32,
    node_count: usize,
    relationship_count: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum JsonLinesRecord {
    #[serde(rename = "node")]
    Node { node: Node },
    #[serde(rename = "relationship")]
    Relationship { relationship: Relationship },
}

pub fn json_lines_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| {
            let preamble = JsonLinesPreamble {
                version: 1,
                node_count: snapshot.nodes.len(),
                relationship_count: snapshot.relationships.len(),
            };
            serde_json::to_writer(&mut *writer, &preamble)
                .map_err(|e| Error::ExecutionError(format!("json-lines preamble encode failed: {e}")))?;
            writeln!(writer)?;
            for node in &snapshot.nodes {
                serde_json::to_writer(&mut *writer, &JsonLinesRecord::Node { node: node.clone() })
                    .map_err(|e| Error::ExecutionError(format!("json-lines node encode failed: {e}")))?;
                writeln!(writer)?;
            }
            for rel in &snapshot.relationships {
                serde_json::to_writer(&mut *writer, &JsonLinesRecord::Relationship { relationship: rel.clone() })
                    .map_err(|e| Error::ExecutionError(format!("json-lines relationship encode failed: {e}")))?;
                writeln!(writer)?;
            }
            Ok(())
        },
        |reader| {
            let mut text = String::new();
            reader.read_to_string(&mut text)
                .map_err(|e| Error::ExecutionError(format!("json-lines read failed: {e}")))?;
            let mut lines = text.lines();
            let preamble_line = lines.next()
                .ok_or_else(|| Error::ExecutionError("json-lines: missing preamble line".into()))?;
            let _preamble: JsonLinesPreamble = serde_json::from_str(preamble_line)
                .map_err(|e| Error::ExecutionError(format!("json-lines preamble decode failed: {e}")))?;

            let mut nodes = Vec::new();
            let mut relationships = Vec::new();
            for line in lines {
                if line.trim().is_empty() {
                    continue;
                }
                let record: JsonLinesRecord = serde_json::from_str(line)
                    .map_err(|e| Error::ExecutionError(format!("json-lines record decode failed: {e}")))?;
                match record {
                    JsonLinesRecord::Node { node } => nodes.push(node),
                    JsonLinesRecord::Relationship { relationship } => relationships.push(relationship),
                }
            }
            Ok(GraphSnapshot { nodes, relationships })
        },
    )
}

// ============================================================================
// JSON-LD — an `@context` plus a flat `@graph` array of node and edge
// objects, suitable for consumption by generic linked-data tooling.
// ============================================================================

pub fn json_ld_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_json_ld(snapshot, writer),
        |reader| read_json_ld(reader),
    )
}

fn json_ld_context() -> serde_json::Value {
    serde_json::json!({
        "@vocab": "https://contentgraph.example/vocab#",
        "id": "@id",
        "type": "@type",
    })
}

fn write_json_ld(snapshot: &GraphSnapshot, writer: &mut dyn Write) -> Result<()> {
    let mut graph = Vec::with_capacity(snapshot.nodes.len() + snapshot.relationships.len());
    for node in &snapshot.nodes {
        let mut obj = serde_json::Map::new();
        obj.insert("id".into(), serde_json::Value::String(node.stable_id()));
        obj.insert("type".into(), serde_json::Value::Array(
            node.labels.iter().map(|l| serde_json::Value::String(l.clone())).collect(),
        ));
        for (k, v) in &node.properties {
            obj.insert(k.clone(), value_to_json(v));
        }
        graph.push(serde_json::Value::Object(obj));
    }
    for rel in &snapshot.relationships {
        let mut obj = serde_json::Map::new();
        obj.insert("id".into(), serde_json::Value::String(rel.stable_id()));
        obj.insert("type".into(), serde_json::Value::String("Relationship".into()));
        obj.insert("relationshipType".into(), serde_json::Value::String(rel.rel_type.clone()));
        obj.insert("source".into(), serde_json::Value::String(rel.src.to_string()));
        obj.insert("target".into(), serde_json::Value::String(rel.dst.to_string()));
        for (k, v) in &rel.properties {
            obj.insert(k.clone(), value_to_json(v));
        }
        graph.push(serde_json::Value::Object(obj));
    }

    let doc = serde_json::json!({
        "@context": json_ld_context(),
        "@graph": graph,
    });
    serde_json::to_writer_pretty(writer, &doc)
        .map_err(|e| Error::ExecutionError(format!("json-ld export failed: {e}")))
}

fn read_json_ld(reader: &mut dyn Read) -> Result<GraphSnapshot> {
    let doc: serde_json::Value = serde_json::from_reader(reader)
        .map_err(|e| Error::ExecutionError(format!("json-ld import failed: {e}")))?;
    let graph = doc.get("@graph")
        .and_then(|g| g.as_array())
        .ok_or_else(|| Error::ExecutionError("json-ld: missing @graph array".into()))?;

    let mut nodes = Vec::new();
    let mut relationships = Vec::new();
    let mut next_node_id = 1u64;
    let mut next_rel_id = 1u64;
    let mut id_lookup: HashMap<String, NodeId> = HashMap::new();

    // First pass: nodes (anything whose @type is not "Relationship").
    for entry in graph {
        let is_relationship = entry.get("type")
            .map(|t| t == &serde_json::Value::String("Relationship".into()))
            .unwrap_or(false);
        if is_relationship {
            continue;
        }
        let stable_id = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let id = NodeId(next_node_id);
        next_node_id += 1;
        let labels = entry.get("type")
            .and_then(|t| t.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let mut properties = PropertyMap::new();
        if let Some(obj) = entry.as_object() {
            for (k, v) in obj {
                if matches!(k.as_str(), "id" | "type") {
                    continue;
                }
                properties.insert(k.clone(), json_to_value(v));
            }
        }
        id_lookup.insert(stable_id.clone(), id);
        nodes.push(Node { id, element_id: Some(stable_id), labels, properties });
    }

    // Second pass: relationships, now that every node id is resolvable.
    for entry in graph {
        let is_relationship = entry.get("type")
            .map(|t| t == &serde_json::Value::String("Relationship".into()))
            .unwrap_or(false);
        if !is_relationship {
            continue;
        }
        let stable_id = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let rel_type = entry.get("relationshipType").and_then(|v| v.as_str()).unwrap_or("RELATED_TO").to_string();
        let source = entry.get("source").and_then(|v| v.as_str()).unwrap_or_default();
        let target = entry.get("target").and_then(|v| v.as_str()).unwrap_or_default();
        let src = *id_lookup.get(source)
            .ok_or_else(|| Error::ExecutionError(format!("json-ld: relationship source '{source}' not found")))?;
        let dst = *id_lookup.get(target)
            .ok_or_else(|| Error::ExecutionError(format!("json-ld: relationship target '{target}' not found")))?;
        let id = RelId(next_rel_id);
        next_rel_id += 1;
        let mut properties = PropertyMap::new();
        if let Some(obj) = entry.as_object() {
            for (k, v) in obj {
                if matches!(k.as_str(), "id" | "type" | "relationshipType" | "source" | "target") {
                    continue;
                }
                properties.insert(k.clone(), json_to_value(v));
            }
        }
        relationships.push(Relationship { id, element_id: Some(stable_id), src, dst, rel_type, properties });
    }

    Ok(GraphSnapshot { nodes, relationships })
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::json!(i),
        Value::Float(f) => serde_json::json!(f),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(m) => serde_json::Value::Object(
            m.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect(),
        ),
        other => serde_json::Value::String(other.to_string()),
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(a) => Value::List(a.iter().map(json_to_value).collect()),
        serde_json::Value::Object(o) => Value::Map(
            o.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect(),
        ),
    }
}
