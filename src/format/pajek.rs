//! Pajek `.net` codec. Pajek has no general property system —
//! only a vertex label and an optional edge weight — so this codec is
//! necessarily lossy for anything beyond node labels, `labels` (folded
//! into the vertex label as `Label:Label2`), and a numeric `weight`
//! relationship property. That is the format's own limitation, not a
//! shortcut taken here; there is no widely-used Pajek crate, so this is
//! a small hand-rolled line-based reader/writer, the same way the rest
//! of this registry's plain-text formats are done.

use std::io::{BufRead, BufReader, Read, Write};

use crate::model::*;
use crate::{Error, Result};

use super::{FormatCodec, GraphSnapshot};

pub fn pajek_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_pajek(snapshot, writer),
        |reader| read_pajek(reader),
    )
}

fn write_pajek(snapshot: &GraphSnapshot, writer: &mut dyn Write) -> Result<()> {
    writeln!(writer, "*Vertices {}", snapshot.nodes.len())?;
    // Pajek vertex numbering is 1-based and positional; keep a lookup from
    // our NodeId to that position so edges can reference it.
    let mut position: std::collections::HashMap<NodeId, usize> = std::collections::HashMap::new();
    for (idx, node) in snapshot.nodes.iter().enumerate() {
        position.insert(node.id, idx + 1);
        let label = if node.labels.is_empty() {
            node.stable_id()
        } else {
            node.labels.join(":")
        };
        writeln!(writer, "{} \"{}\"", idx + 1, escape_label(&label))?;
    }

    writeln!(writer, "*Arcs {}", snapshot.relationships.len())?;
    for rel in &snapshot.relationships {
        let src = *position.get(&rel.src)
            .ok_or_else(|| Error::ExecutionError(format!("pajek: relationship source {} not among vertices", rel.src)))?;
        let dst = *position.get(&rel.dst)
            .ok_or_else(|| Error::ExecutionError(format!("pajek: relationship target {} not among vertices", rel.dst)))?;
        let weight = rel.properties.get("weight").and_then(|v| v.as_float()).unwrap_or(1.0);
        writeln!(writer, "{src} {dst} {weight} \"{}\"", escape_label(&rel.rel_type))?;
    }
    Ok(())
}

fn escape_label(s: &str) -> String {
    s.replace('"', "'")
}

fn read_pajek(reader: &mut dyn Read) -> Result<GraphSnapshot> {
    let buffered = BufReader::new(reader);
    let mut nodes = Vec::new();
    let mut relationships = Vec::new();
    let mut position_to_id: std::collections::HashMap<usize, NodeId> = std::collections::HashMap::new();
    let mut next_node_id = 1u64;
    let mut next_rel_id = 1u64;

    #[derive(PartialEq)]
    enum Section { None, Vertices, Arcs }
    let mut section = Section::None;

    for line in buffered.lines() {
        let line = line.map_err(|e| Error::ExecutionError(format!("pajek read failed: {e}")))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("*vertices") {
            section = Section::Vertices;
            continue;
        }
        if lower.starts_with("*arcs") || lower.starts_with("*edges") {
            section = Section::Arcs;
            continue;
        }
        if trimmed.starts_with('*') {
            // Unsupported section (e.g. *Partition, *Vector) — skip its body.
            section = Section::None;
            continue;
        }

        match section {
            Section::Vertices => {
                let mut parts = trimmed.splitn(2, char::is_whitespace);
                let idx: usize = parts.next().unwrap_or_default().parse()
                    .map_err(|_| Error::ExecutionError(format!("pajek: bad vertex index in '{trimmed}'")))?;
                let rest = parts.next().unwrap_or_default().trim();
                let label = unquote(rest);
                let labels: Vec<String> = if label.is_empty() {
                    Vec::new()
                } else {
                    label.split(':').map(String::from).collect()
                };
                let id = NodeId(next_node_id);
                next_node_id += 1;
                position_to_id.insert(idx, id);
                nodes.push(Node { id, element_id: None, labels, properties: PropertyMap::new() });
            }
            Section::Arcs => {
                let fields: Vec<&str> = trimmed.split_whitespace().collect();
                if fields.len() < 2 {
                    continue;
                }
                let src_idx: usize = fields[0].parse()
                    .map_err(|_| Error::ExecutionError(format!("pajek: bad arc source in '{trimmed}'")))?;
                let dst_idx: usize = fields[1].parse()
                    .map_err(|_| Error::ExecutionError(format!("pajek: bad arc target in '{trimmed}'")))?;
                let weight: Option<f64> = fields.get(2).and_then(|s| s.parse().ok());
                let label = fields.iter().skip(3).cloned().collect::<Vec<_>>().join(" ");
                let rel_type = if label.is_empty() { "RELATED_TO".to_string() } else { unquote(&label) };

                let src = *position_to_id.get(&src_idx)
                    .ok_or_else(|| Error::ExecutionError(format!("pajek: arc references unknown vertex {src_idx}")))?;
                let dst = *position_to_id.get(&dst_idx)
                    .ok_or_else(|| Error::ExecutionError(format!("pajek: arc references unknown vertex {dst_idx}")))?;

                let mut properties = PropertyMap::new();
                if let Some(w) = weight {
                    properties.insert("weight".into(), Value::Float(w));
                }
                relationships.push(Relationship {
                    id: RelId(next_rel_id), element_id: None, src, dst, rel_type, properties,
                });
                next_rel_id += 1;
            }
            Section::None => {}
        }
    }

    Ok(GraphSnapshot { nodes, relationships })
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
