//! N-Triples codec, registered under both `"rdf"` and `"ntriples"`.
//! RDF has no native notion of a labeled property graph
//! node, so this codec maps the graph onto a small fixed vocabulary:
//!
//! - `_:n<id> rdf:type <label>` for each label on a node
//! - `_:n<id> <prop> "value"^^xsd:<type>` for each property
//! - `_:n<src> <relType> _:n<dst>` for each relationship, plus
//!   `_:r<id> rdf:type <relType>` and its own properties keyed off a
//!   reified blank node, since a plain triple has no room for edge
//!   properties.
//!
//! This is a deliberately simple triples shape, not a full RDF reification
//! vocabulary (no `rdf:subject`/`rdf:predicate`/`rdf:object`) — it only
//! needs to be self-consistent for round-tripping through this registry,
//! not to interoperate with an external triple store.

use std::io::{BufRead, BufReader, Read, Write};

use regex::Regex;
use std::sync::OnceLock;

use crate::model::*;
use crate::{Error, Result};

use super::{typed_literal, value_from_typed, FormatCodec, GraphSnapshot};

const NODE_PREFIX: &str = "_:n";
const REL_PREFIX: &str = "_:r";
const TYPE_PREDICATE: &str = "rdf:type";
const SRC_PREDICATE: &str = "cg:hasSource";
const DST_PREDICATE: &str = "cg:hasTarget";
const REL_REF_PREDICATE: &str = "cg:via";

pub fn ntriples_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_ntriples(snapshot, writer),
        |reader| read_ntriples(reader),
    )
}

fn write_ntriples(snapshot: &GraphSnapshot, writer: &mut dyn Write) -> Result<()> {
    for node in &snapshot.nodes {
        let subject = format!("{NODE_PREFIX}{}", node.id);
        for label in &node.labels {
            writeln!(writer, "{subject} {TYPE_PREDICATE} <{}> .", escape_iri(label))?;
        }
        write_property_triples(writer, &subject, &node.properties)?;
    }

    for rel in &snapshot.relationships {
        let src = format!("{NODE_PREFIX}{}", rel.src);
        let dst = format!("{NODE_PREFIX}{}", rel.dst);
        let rel_node = format!("{REL_PREFIX}{}", rel.id);
        writeln!(writer, "{src} {REL_REF_PREDICATE} {rel_node} .")?;
        writeln!(writer, "{rel_node} {TYPE_PREDICATE} <{}> .", escape_iri(&rel.rel_type))?;
        writeln!(writer, "{rel_node} {SRC_PREDICATE} {src} .")?;
        writeln!(writer, "{rel_node} {DST_PREDICATE} {dst} .")?;
        write_property_triples(writer, &rel_node, &rel.properties)?;
    }
    Ok(())
}

fn write_property_triples(writer: &mut dyn Write, subject: &str, props: &PropertyMap) -> Result<()> {
    let mut keys: Vec<&String> = props.keys().collect();
    keys.sort();
    for key in keys {
        let value = &props[key];
        // Bool-before-int: typed_literal already branches bool ahead of
        // int/float, so the xsd datatype below follows that same order.
        let (tag, text) = typed_literal(value);
        let xsd_type = match tag {
            "boolean" => "xsd:boolean",
            "integer" => "xsd:integer",
            "double" => "xsd:double",
            _ => "xsd:string",
        };
        writeln!(
            writer,
            "{subject} <cg:{}> \"{}\"^^{xsd_type} .",
            escape_iri(key),
            escape_literal(&text)
        )?;
    }
    Ok(())
}

fn escape_iri(s: &str) -> String {
    s.replace(' ', "_").replace('<', "%3C").replace('>', "%3E")
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn unescape_literal(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\\"", "\"").replace("\\\\", "\\")
}

fn triple_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?P<subject>_:\S+|<[^>]*>)\s+(?P<predicate><[^>]*>|rdf:type|cg:\S+)\s+(?P<object>_:\S+|<[^>]*>|"(?:[^"\\]|\\.)*"(?:\^\^\S+)?)\s*\.$"#,
        ).expect("static n-triples regex is valid")
    })
}

fn read_ntriples(reader: &mut dyn Read) -> Result<GraphSnapshot> {
    let buffered = BufReader::new(reader);
    let mut labels: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    let mut node_props: std::collections::HashMap<String, PropertyMap> = std::collections::HashMap::new();
    let mut rel_types: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut rel_props: std::collections::HashMap<String, PropertyMap> = std::collections::HashMap::new();
    let mut rel_src: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut rel_dst: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut rel_nodes: Vec<String> = Vec::new();
    let mut node_order: Vec<String> = Vec::new();

    for line in buffered.lines() {
        let line = line.map_err(|e| Error::ExecutionError(format!("ntriples read failed: {e}")))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let caps = triple_regex().captures(trimmed)
            .ok_or_else(|| Error::ExecutionError(format!("ntriples: unparsable triple '{trimmed}'")))?;
        let subject = caps["subject"].to_string();
        let predicate = caps["predicate"].to_string();
        let object = caps["object"].to_string();

        if subject.starts_with(NODE_PREFIX) && !node_order.contains(&subject) {
            node_order.push(subject.clone());
        }

        match predicate.as_str() {
            TYPE_PREDICATE => {
                let label = unwrap_iri(&object);
                if subject.starts_with(REL_PREFIX) {
                    rel_types.insert(subject.clone(), label);
                    if !rel_nodes.contains(&subject) {
                        rel_nodes.push(subject.clone());
                    }
                } else {
                    labels.entry(subject.clone()).or_default().push(label);
                }
            }
            SRC_PREDICATE => {
                rel_src.insert(subject.clone(), object.clone());
            }
            DST_PREDICATE => {
                rel_dst.insert(subject.clone(), object.clone());
            }
            REL_REF_PREDICATE => {
                // subject hasSource's own appearance already registers the node; nothing else to do.
            }
            _ if predicate.starts_with("<cg:") || predicate.starts_with("cg:") => {
                let key = predicate.trim_start_matches('<').trim_end_matches('>').trim_start_matches("cg:").to_string();
                let (text, xsd) = split_typed_literal(&object)?;
                let tag = match xsd.as_deref() {
                    Some("xsd:boolean") => "boolean",
                    Some("xsd:integer") => "integer",
                    Some("xsd:double") => "double",
                    _ => "string",
                };
                let value = value_from_typed(tag, &unescape_literal(&text));
                if subject.starts_with(REL_PREFIX) {
                    rel_props.entry(subject.clone()).or_default().insert(key, value);
                } else {
                    node_props.entry(subject.clone()).or_default().insert(key, value);
                }
            }
            _ => {}
        }
    }

    let mut node_id_by_subject: std::collections::HashMap<String, NodeId> = std::collections::HashMap::new();
    let mut nodes = Vec::new();
    for (idx, subject) in node_order.iter().enumerate() {
        let id = NodeId((idx + 1) as u64);
        node_id_by_subject.insert(subject.clone(), id);
        nodes.push(Node {
            id,
            element_id: Some(subject.clone()),
            labels: labels.get(subject).cloned().unwrap_or_default(),
            properties: node_props.get(subject).cloned().unwrap_or_default(),
        });
    }

    let mut relationships = Vec::new();
    for (idx, rel_subject) in rel_nodes.iter().enumerate() {
        let src_subject = rel_src.get(rel_subject)
            .ok_or_else(|| Error::ExecutionError(format!("ntriples: relationship {rel_subject} missing source")))?;
        let dst_subject = rel_dst.get(rel_subject)
            .ok_or_else(|| Error::ExecutionError(format!("ntriples: relationship {rel_subject} missing target")))?;
        let src = *node_id_by_subject.get(src_subject)
            .ok_or_else(|| Error::ExecutionError(format!("ntriples: relationship source '{src_subject}' not found")))?;
        let dst = *node_id_by_subject.get(dst_subject)
            .ok_or_else(|| Error::ExecutionError(format!("ntriples: relationship target '{dst_subject}' not found")))?;
        relationships.push(Relationship {
            id: RelId((idx + 1) as u64),
            element_id: Some(rel_subject.clone()),
            src,
            dst,
            rel_type: rel_types.get(rel_subject).cloned().unwrap_or_else(|| "RELATED_TO".into()),
            properties: rel_props.get(rel_subject).cloned().unwrap_or_default(),
        });
    }

    Ok(GraphSnapshot { nodes, relationships })
}

fn unwrap_iri(s: &str) -> String {
    s.trim_start_matches('<').trim_end_matches('>').to_string()
}

fn split_typed_literal(object: &str) -> Result<(String, Option<String>)> {
    let object = object.trim();
    if !object.starts_with('"') {
        return Err(Error::ExecutionError(format!("ntriples: expected literal object, got '{object}'")));
    }
    if let Some(close_quote) = object[1..].rfind('"') {
        let close_quote = close_quote + 1;
        let text = object[1..close_quote].to_string();
        let suffix = &object[close_quote + 1..];
        let xsd = suffix.strip_prefix("^^").map(|s| s.to_string());
        Ok((text, xsd))
    } else {
        Err(Error::ExecutionError(format!("ntriples: malformed literal '{object}'")))
    }
}
