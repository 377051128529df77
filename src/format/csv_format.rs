//! CSV codec: separate nodes/relationships sections, header line,
//! properties flattened.
//!
//! The registered [`FormatCodec`] reads and writes a single stream (the
//! trait's `Read`/`Write` contract has no notion of "two files"), so the
//! two sections share one CSV stream separated by a sentinel row —
//! `save_to_file`/`load_from_file` callers who want literal `nodes.csv` /
//! `rels.csv` files can always call [`write_node_rows`]/[`write_rel_rows`]
//! directly against two separate writers.

use std::io::{Read, Write};

use crate::model::*;
use crate::{Error, Result};

use super::{value_from_typed, typed_literal, FormatCodec, GraphSnapshot};

const SECTION_MARKER: &str = "##RELATIONSHIPS##";
const NODE_HEADER: &[&str] = &["id", "labels", "properties"];
const REL_HEADER: &[&str] = &["id", "type", "src", "dst", "properties"];

pub fn csv_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_csv(snapshot, writer),
        |reader| read_csv(reader),
    )
}

/// Flatten a property map into a single `key=type:value|key=type:value`
/// cell — keeps the CSV to a fixed column count regardless of how many
/// distinct property keys exist across rows, at the cost of needing a
/// second round of parsing on load (done below in `parse_properties`).
fn flatten_properties(props: &PropertyMap) -> String {
    let mut keys: Vec<&String> = props.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| {
            let (tag, text) = typed_literal(&props[k]);
            format!("{}={}:{}", escape_cell(k), tag, escape_cell(&text))
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn parse_properties(cell: &str) -> PropertyMap {
    let mut props = PropertyMap::new();
    if cell.is_empty() {
        return props;
    }
    for entry in cell.split('|') {
        let Some((key, rest)) = entry.split_once('=') else { continue };
        let Some((tag, text)) = rest.split_once(':') else { continue };
        props.insert(unescape_cell(key), value_from_typed(tag, &unescape_cell(text)));
    }
    props
}

fn escape_cell(s: &str) -> String {
    s.replace('\\', "\\\\").replace('|', "\\p").replace('=', "\\e").replace(':', "\\c")
}

fn unescape_cell(s: &str) -> String {
    s.replace("\\c", ":").replace("\\e", "=").replace("\\p", "|").replace("\\\\", "\\")
}

fn write_node_rows(nodes: &[Node], writer: &mut csv::Writer<&mut dyn Write>) -> Result<()> {
    writer.write_record(NODE_HEADER)
        .map_err(|e| Error::ExecutionError(format!("csv node header write failed: {e}")))?;
    for node in nodes {
        writer.write_record([
            node.stable_id(),
            node.labels.join(";"),
            flatten_properties(&node.properties),
        ]).map_err(|e| Error::ExecutionError(format!("csv node row write failed: {e}")))?;
    }
    writer.flush().map_err(|e| Error::ExecutionError(format!("csv flush failed: {e}")))
}

fn write_rel_rows(rels: &[Relationship], writer: &mut csv::Writer<&mut dyn Write>) -> Result<()> {
    writer.write_record(REL_HEADER)
        .map_err(|e| Error::ExecutionError(format!("csv rel header write failed: {e}")))?;
    for rel in rels {
        writer.write_record([
            rel.stable_id(),
            rel.rel_type.clone(),
            rel.src.to_string(),
            rel.dst.to_string(),
            flatten_properties(&rel.properties),
        ]).map_err(|e| Error::ExecutionError(format!("csv rel row write failed: {e}")))?;
    }
    writer.flush().map_err(|e| Error::ExecutionError(format!("csv flush failed: {e}")))
}

fn write_csv(snapshot: &GraphSnapshot, writer: &mut dyn Write) -> Result<()> {
    {
        let mut csv_writer = csv::WriterBuilder::new().flexible(true).from_writer(&mut *writer);
        write_node_rows(&snapshot.nodes, &mut csv_writer)?;
    }
    writeln!(writer, "{SECTION_MARKER}")?;
    {
        let mut csv_writer = csv::WriterBuilder::new().flexible(true).from_writer(&mut *writer);
        write_rel_rows(&snapshot.relationships, &mut csv_writer)?;
    }
    Ok(())
}

fn read_csv(reader: &mut dyn Read) -> Result<GraphSnapshot> {
    let mut text = String::new();
    reader.read_to_string(&mut text)
        .map_err(|e| Error::ExecutionError(format!("csv read failed: {e}")))?;

    let (node_section, rel_section) = text.split_once(SECTION_MARKER)
        .ok_or_else(|| Error::ExecutionError("csv: missing relationships section marker".into()))?;

    let mut nodes = Vec::new();
    let mut node_id_by_stable: std::collections::HashMap<String, NodeId> = std::collections::HashMap::new();
    let mut node_reader = csv::ReaderBuilder::new().flexible(true).has_headers(true).from_reader(node_section.as_bytes());
    for (idx, record) in node_reader.records().enumerate() {
        let record = record.map_err(|e| Error::ExecutionError(format!("csv node row parse failed: {e}")))?;
        let stable_id = record.get(0).unwrap_or_default().to_string();
        let labels = record.get(1).unwrap_or_default();
        let labels: Vec<String> = if labels.is_empty() { Vec::new() } else { labels.split(';').map(String::from).collect() };
        let properties = parse_properties(record.get(2).unwrap_or_default());
        let id = NodeId((idx + 1) as u64);
        node_id_by_stable.insert(stable_id.clone(), id);
        nodes.push(Node { id, element_id: Some(stable_id), labels, properties });
    }

    let mut relationships = Vec::new();
    let mut rel_reader = csv::ReaderBuilder::new().flexible(true).has_headers(true).from_reader(rel_section.trim_start().as_bytes());
    for (idx, record) in rel_reader.records().enumerate() {
        let record = record.map_err(|e| Error::ExecutionError(format!("csv rel row parse failed: {e}")))?;
        let stable_id = record.get(0).unwrap_or_default().to_string();
        let rel_type = record.get(1).unwrap_or_default().to_string();
        let src_key = record.get(2).unwrap_or_default();
        let dst_key = record.get(3).unwrap_or_default();
        let src = *node_id_by_stable.get(src_key)
            .ok_or_else(|| Error::ExecutionError(format!("csv: relationship source '{src_key}' not found among nodes")))?;
        let dst = *node_id_by_stable.get(dst_key)
            .ok_or_else(|| Error::ExecutionError(format!("csv: relationship target '{dst_key}' not found among nodes")))?;
        let properties = parse_properties(record.get(4).unwrap_or_default());
        relationships.push(Relationship {
            id: RelId((idx + 1) as u64),
            element_id: Some(stable_id),
            src, dst, rel_type, properties,
        });
    }

    Ok(GraphSnapshot { nodes, relationships })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_and_parse_properties_round_trip() {
        let mut props = PropertyMap::new();
        props.insert("name".into(), Value::from("Ada|Lovelace"));
        props.insert("active".into(), Value::Bool(true));
        props.insert("age".into(), Value::Int(42));

        let flat = flatten_properties(&props);
        let parsed = parse_properties(&flat);
        assert_eq!(parsed.get("name"), Some(&Value::from("Ada|Lovelace")));
        assert_eq!(parsed.get("active"), Some(&Value::Bool(true)));
        assert_eq!(parsed.get("age"), Some(&Value::Int(42)));
    }
}
