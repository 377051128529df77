//! GraphML and GEXF codecs. Both formats use attribute names that collide
//! with Rust keywords (`for`, `type`) or common derive-field names
//! (`class`), so both are written with `quick_xml`'s event writer rather
//! than a serde derive — attribute names stay plain string literals
//! instead of leaking a hand-rolled struct field name like `for_` or
//! `r#for` into the serialized output.

use std::io::{Read, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer as XmlWriter;

use crate::model::*;
use crate::{Error, Result};

use super::{typed_literal, value_from_typed, FormatCodec, GraphSnapshot};

fn xml_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::ExecutionError(format!("{context}: {e}"))
}

// ============================================================================
// GraphML
// ============================================================================

pub fn graphml_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_graphml(snapshot, writer),
        |reader| read_graphml(reader),
    )
}

/// Distinct property keys across a set of nodes/relationships, in a
/// stable (sorted) order so `<key>` declarations are deterministic.
fn collect_keys<'a>(entries: impl Iterator<Item = &'a PropertyMap>) -> Vec<(String, &'static str)> {
    let mut keys: std::collections::BTreeMap<String, &'static str> = std::collections::BTreeMap::new();
    for props in entries {
        for (k, v) in props {
            let (tag, _) = typed_literal(v);
            keys.entry(k.clone()).or_insert(tag);
        }
    }
    keys.into_iter().collect()
}

fn write_graphml(snapshot: &GraphSnapshot, out: &mut dyn Write) -> Result<()> {
    let mut writer = XmlWriter::new(out);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| xml_err("graphml decl", e))?;

    let mut graphml = BytesStart::new("graphml");
    graphml.push_attribute(("xmlns", "http://graphml.graphdrawing.org/xmlns"));
    writer.write_event(Event::Start(graphml)).map_err(|e| xml_err("graphml start", e))?;

    let node_keys = collect_keys(snapshot.nodes.iter().map(|n| &n.properties));
    let edge_keys = collect_keys(snapshot.relationships.iter().map(|r| &r.properties));

    for (key, attr_type) in node_keys.iter().chain(std::iter::once(&("__labels__".to_string(), "string"))) {
        write_key_decl(&mut writer, &format!("n_{key}"), "node", key, attr_type)?;
    }
    for (key, attr_type) in edge_keys.iter().chain(std::iter::once(&("__type__".to_string(), "string"))) {
        write_key_decl(&mut writer, &format!("e_{key}"), "edge", key, attr_type)?;
    }

    let mut graph = BytesStart::new("graph");
    graph.push_attribute(("id", "G"));
    graph.push_attribute(("edgedefault", "directed"));
    writer.write_event(Event::Start(graph)).map_err(|e| xml_err("graphml graph start", e))?;

    for node in &snapshot.nodes {
        let mut n = BytesStart::new("node");
        n.push_attribute(("id", node.stable_id().as_str()));
        writer.write_event(Event::Start(n)).map_err(|e| xml_err("graphml node start", e))?;
        write_data(&mut writer, "n___labels__", &node.labels.join(";"))?;
        for (k, v) in &node.properties {
            let (_, text) = typed_literal(v);
            write_data(&mut writer, &format!("n_{k}"), &text)?;
        }
        writer.write_event(Event::End(BytesEnd::new("node"))).map_err(|e| xml_err("graphml node end", e))?;
    }

    for rel in &snapshot.relationships {
        let mut e = BytesStart::new("edge");
        e.push_attribute(("id", rel.stable_id().as_str()));
        e.push_attribute(("source", rel.src.to_string().as_str()));
        e.push_attribute(("target", rel.dst.to_string().as_str()));
        writer.write_event(Event::Start(e)).map_err(|e| xml_err("graphml edge start", e))?;
        write_data(&mut writer, "e___type__", &rel.rel_type)?;
        for (k, v) in &rel.properties {
            let (_, text) = typed_literal(v);
            write_data(&mut writer, &format!("e_{k}"), &text)?;
        }
        writer.write_event(Event::End(BytesEnd::new("edge"))).map_err(|e| xml_err("graphml edge end", e))?;
    }

    writer.write_event(Event::End(BytesEnd::new("graph"))).map_err(|e| xml_err("graphml graph end", e))?;
    writer.write_event(Event::End(BytesEnd::new("graphml"))).map_err(|e| xml_err("graphml end", e))?;
    Ok(())
}

fn write_key_decl(writer: &mut XmlWriter<&mut dyn Write>, id: &str, for_: &str, attr_name: &str, attr_type: &str) -> Result<()> {
    let mut key = BytesStart::new("key");
    key.push_attribute(("id", id));
    // Literal `for` attribute name, not a `for_`/`r#for` workaround.
    key.push_attribute(("for", for_));
    key.push_attribute(("attr.name", attr_name));
    key.push_attribute(("attr.type", attr_type));
    writer.write_event(Event::Empty(key)).map_err(|e| xml_err("graphml key decl", e))
}

fn write_data(writer: &mut XmlWriter<&mut dyn Write>, key: &str, text: &str) -> Result<()> {
    let mut data = BytesStart::new("data");
    data.push_attribute(("key", key));
    writer.write_event(Event::Start(data.clone())).map_err(|e| xml_err("graphml data start", e))?;
    writer.write_event(Event::Text(BytesText::new(text))).map_err(|e| xml_err("graphml data text", e))?;
    writer.write_event(Event::End(BytesEnd::new("data"))).map_err(|e| xml_err("graphml data end", e))?;
    Ok(())
}

fn read_graphml(input: &mut dyn Read) -> Result<GraphSnapshot> {
    let mut text = String::new();
    input.read_to_string(&mut text).map_err(|e| xml_err("graphml read", e))?;
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    // key id -> (for-target, attr.name, attr.type)
    let mut key_defs: std::collections::HashMap<String, (String, String, String)> = std::collections::HashMap::new();
    let mut nodes = Vec::new();
    let mut relationships = Vec::new();
    let mut node_ids: std::collections::HashMap<String, NodeId> = std::collections::HashMap::new();
    let mut next_node_id = 1u64;
    let mut next_rel_id = 1u64;

    let mut cur_labels: Vec<String> = Vec::new();
    let mut cur_props = PropertyMap::new();
    let mut cur_rel_type = String::new();
    let mut cur_data_key: Option<String> = None;
    let mut cur_element: Option<(String, String, Option<String>, Option<String>)> = None; // (tag, id, source, target)

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| xml_err("graphml parse", e))? {
            Event::Eof => break,
            Event::Empty(e) if e.name().as_ref() == b"key" => {
                record_key_def(&e, &mut key_defs)?;
            }
            Event::Start(e) if e.name().as_ref() == b"key" => {
                record_key_def(&e, &mut key_defs)?;
            }
            Event::Start(e) if e.name().as_ref() == b"node" => {
                let id = attr(&e, "id")?;
                cur_element = Some(("node".into(), id, None, None));
                cur_labels.clear();
                cur_props = PropertyMap::new();
            }
            Event::End(e) if e.name().as_ref() == b"node" => {
                if let Some((_, id, _, _)) = cur_element.take() {
                    let nid = NodeId(next_node_id);
                    next_node_id += 1;
                    node_ids.insert(id.clone(), nid);
                    nodes.push(Node { id: nid, element_id: Some(id), labels: cur_labels.clone(), properties: cur_props.clone() });
                }
            }
            Event::Start(e) if e.name().as_ref() == b"edge" => {
                let id = attr(&e, "id").unwrap_or_else(|_| String::new());
                let source = attr(&e, "source")?;
                let target = attr(&e, "target")?;
                cur_element = Some(("edge".into(), id, Some(source), Some(target)));
                cur_rel_type = "RELATED_TO".to_string();
                cur_props = PropertyMap::new();
            }
            Event::End(e) if e.name().as_ref() == b"edge" => {
                if let Some((_, id, source, target)) = cur_element.take() {
                    let source = source.unwrap_or_default();
                    let target = target.unwrap_or_default();
                    let src = *node_ids.get(&source)
                        .ok_or_else(|| Error::ExecutionError(format!("graphml: edge source '{source}' not found")))?;
                    let dst = *node_ids.get(&target)
                        .ok_or_else(|| Error::ExecutionError(format!("graphml: edge target '{target}' not found")))?;
                    let rid = RelId(next_rel_id);
                    next_rel_id += 1;
                    relationships.push(Relationship {
                        id: rid, element_id: Some(id), src, dst,
                        rel_type: cur_rel_type.clone(), properties: cur_props.clone(),
                    });
                }
            }
            Event::Start(e) if e.name().as_ref() == b"data" => {
                cur_data_key = Some(attr(&e, "key")?);
            }
            Event::Text(t) => {
                if let Some(key) = &cur_data_key {
                    let text = t.unescape().map_err(|e| xml_err("graphml text", e))?.into_owned();
                    apply_data_value(key, &text, &key_defs, &mut cur_labels, &mut cur_props, &mut cur_rel_type);
                }
            }
            Event::End(e) if e.name().as_ref() == b"data" => {
                cur_data_key = None;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(GraphSnapshot { nodes, relationships })
}

fn record_key_def(e: &BytesStart, key_defs: &mut std::collections::HashMap<String, (String, String, String)>) -> Result<()> {
    let id = attr(e, "id")?;
    let for_ = attr(e, "for").unwrap_or_else(|_| "node".into());
    let name = attr(e, "attr.name").unwrap_or_else(|_| id.clone());
    let attr_type = attr(e, "attr.type").unwrap_or_else(|_| "string".into());
    key_defs.insert(id, (for_, name, attr_type));
    Ok(())
}

fn apply_data_value(
    key: &str,
    text: &str,
    key_defs: &std::collections::HashMap<String, (String, String, String)>,
    labels: &mut Vec<String>,
    props: &mut PropertyMap,
    rel_type: &mut String,
) {
    let Some((_, name, attr_type)) = key_defs.get(key) else { return };
    if name == "__labels__" {
        *labels = if text.is_empty() { Vec::new() } else { text.split(';').map(String::from).collect() };
    } else if name == "__type__" {
        *rel_type = text.to_string();
    } else {
        props.insert(name.clone(), value_from_typed(attr_type, text));
    }
}

fn attr(e: &BytesStart, name: &str) -> Result<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
        .ok_or_else(|| Error::ExecutionError(format!("graphml: missing attribute '{name}'")))
}

// ============================================================================
// GEXF
// ============================================================================

pub fn gexf_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_gexf(snapshot, writer),
        |reader| read_gexf(reader),
    )
}

fn write_gexf(snapshot: &GraphSnapshot, out: &mut dyn Write) -> Result<()> {
    let mut writer = XmlWriter::new(out);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| xml_err("gexf decl", e))?;

    let mut gexf = BytesStart::new("gexf");
    gexf.push_attribute(("xmlns", "http://gexf.net/1.3"));
    gexf.push_attribute(("version", "1.3"));
    writer.write_event(Event::Start(gexf)).map_err(|e| xml_err("gexf start", e))?;

    let mut graph = BytesStart::new("graph");
    graph.push_attribute(("mode", "static"));
    graph.push_attribute(("defaultedgetype", "directed"));
    writer.write_event(Event::Start(graph)).map_err(|e| xml_err("gexf graph start", e))?;

    let node_keys = collect_keys(snapshot.nodes.iter().map(|n| &n.properties));
    let edge_keys = collect_keys(snapshot.relationships.iter().map(|r| &r.properties));
    write_attr_decls(&mut writer, "node", &node_keys)?;
    write_attr_decls(&mut writer, "edge", &edge_keys)?;

    writer.write_event(Event::Start(BytesStart::new("nodes"))).map_err(|e| xml_err("gexf nodes start", e))?;
    for node in &snapshot.nodes {
        let mut n = BytesStart::new("node");
        n.push_attribute(("id", node.stable_id().as_str()));
        n.push_attribute(("label", node.labels.join(";").as_str()));
        writer.write_event(Event::Start(n)).map_err(|e| xml_err("gexf node start", e))?;
        write_attvalues(&mut writer, &node_keys, &node.properties)?;
        writer.write_event(Event::End(BytesEnd::new("node"))).map_err(|e| xml_err("gexf node end", e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("nodes"))).map_err(|e| xml_err("gexf nodes end", e))?;

    writer.write_event(Event::Start(BytesStart::new("edges"))).map_err(|e| xml_err("gexf edges start", e))?;
    for rel in &snapshot.relationships {
        let mut e = BytesStart::new("edge");
        e.push_attribute(("id", rel.stable_id().as_str()));
        e.push_attribute(("source", rel.src.to_string().as_str()));
        e.push_attribute(("target", rel.dst.to_string().as_str()));
        e.push_attribute(("label", rel.rel_type.as_str()));
        writer.write_event(Event::Start(e)).map_err(|e| xml_err("gexf edge start", e))?;
        write_attvalues(&mut writer, &edge_keys, &rel.properties)?;
        writer.write_event(Event::End(BytesEnd::new("edge"))).map_err(|e| xml_err("gexf edge end", e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("edges"))).map_err(|e| xml_err("gexf edges end", e))?;

    writer.write_event(Event::End(BytesEnd::new("graph"))).map_err(|e| xml_err("gexf graph end", e))?;
    writer.write_event(Event::End(BytesEnd::new("gexf"))).map_err(|e| xml_err("gexf end", e))?;
    Ok(())
}

fn write_attr_decls(writer: &mut XmlWriter<&mut dyn Write>, class: &str, keys: &[(String, &'static str)]) -> Result<()> {
    let mut attributes = BytesStart::new("attributes");
    // Literal `class` attribute name, not a derive-field workaround.
    attributes.push_attribute(("class", class));
    writer.write_event(Event::Start(attributes)).map_err(|e| xml_err("gexf attributes start", e))?;
    for (idx, (key, attr_type)) in keys.iter().enumerate() {
        let mut a = BytesStart::new("attribute");
        a.push_attribute(("id", idx.to_string().as_str()));
        a.push_attribute(("title", key.as_str()));
        a.push_attribute(("type", gexf_type_name(attr_type)));
        writer.write_event(Event::Empty(a)).map_err(|e| xml_err("gexf attribute decl", e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("attributes"))).map_err(|e| xml_err("gexf attributes end", e))
}

fn gexf_type_name(tag: &str) -> &'static str {
    match tag {
        "boolean" => "boolean",
        "integer" => "integer",
        "double" => "double",
        _ => "string",
    }
}

fn write_attvalues(writer: &mut XmlWriter<&mut dyn Write>, keys: &[(String, &'static str)], props: &PropertyMap) -> Result<()> {
    let present: Vec<(usize, String)> = keys.iter().enumerate()
        .filter_map(|(idx, (k, _))| props.get(k).map(|v| (idx, typed_literal(v).1)))
        .collect();
    if present.is_empty() {
        return Ok(());
    }
    writer.write_event(Event::Start(BytesStart::new("attvalues"))).map_err(|e| xml_err("gexf attvalues start", e))?;
    for (idx, text) in present {
        let mut av = BytesStart::new("attvalue");
        av.push_attribute(("for", idx.to_string().as_str()));
        av.push_attribute(("value", text.as_str()));
        writer.write_event(Event::Empty(av)).map_err(|e| xml_err("gexf attvalue", e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("attvalues"))).map_err(|e| xml_err("gexf attvalues end", e))
}

fn read_gexf(input: &mut dyn Read) -> Result<GraphSnapshot> {
    let mut text = String::new();
    input.read_to_string(&mut text).map_err(|e| xml_err("gexf read", e))?;
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    // (class, id) -> (title, type), used to resolve attvalue "for" indices back to names.
    let mut node_attr_names: std::collections::HashMap<String, (String, String)> = std::collections::HashMap::new();
    let mut edge_attr_names: std::collections::HashMap<String, (String, String)> = std::collections::HashMap::new();
    let mut current_attr_class = String::new();

    let mut nodes = Vec::new();
    let mut relationships = Vec::new();
    let mut node_ids: std::collections::HashMap<String, NodeId> = std::collections::HashMap::new();
    let mut next_node_id = 1u64;
    let mut next_rel_id = 1u64;

    let mut cur_element: Option<(String, String, String, Option<String>, Option<String>)> = None; // (tag, id, label, source, target)
    let mut cur_props = PropertyMap::new();
    let mut in_nodes_section = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| xml_err("gexf parse", e))? {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == b"attributes" => {
                current_attr_class = attr(&e, "class").unwrap_or_else(|_| "node".into());
            }
            Event::Empty(e) if e.name().as_ref() == b"attribute" => {
                let id = attr(&e, "id")?;
                let title = attr(&e, "title")?;
                let attr_type = attr(&e, "type").unwrap_or_else(|_| "string".into());
                if current_attr_class == "edge" {
                    edge_attr_names.insert(id, (title, attr_type));
                } else {
                    node_attr_names.insert(id, (title, attr_type));
                }
            }
            Event::Start(e) if e.name().as_ref() == b"nodes" => { in_nodes_section = true; }
            Event::End(e) if e.name().as_ref() == b"nodes" => { in_nodes_section = false; }
            Event::Start(e) if e.name().as_ref() == b"node" => {
                let id = attr(&e, "id")?;
                let label = attr(&e, "label").unwrap_or_default();
                cur_element = Some(("node".into(), id, label, None, None));
                cur_props = PropertyMap::new();
            }
            Event::End(e) if e.name().as_ref() == b"node" => {
                if let Some((_, id, label, _, _)) = cur_element.take() {
                    let nid = NodeId(next_node_id);
                    next_node_id += 1;
                    node_ids.insert(id.clone(), nid);
                    let labels = if label.is_empty() { Vec::new() } else { label.split(';').map(String::from).collect() };
                    nodes.push(Node { id: nid, element_id: Some(id), labels, properties: cur_props.clone() });
                }
            }
            Event::Start(e) if e.name().as_ref() == b"edge" => {
                let id = attr(&e, "id").unwrap_or_default();
                let label = attr(&e, "label").unwrap_or_else(|_| "RELATED_TO".into());
                let source = attr(&e, "source")?;
                let target = attr(&e, "target")?;
                cur_element = Some(("edge".into(), id, label, Some(source), Some(target)));
                cur_props = PropertyMap::new();
            }
            Event::End(e) if e.name().as_ref() == b"edge" => {
                if let Some((_, id, label, source, target)) = cur_element.take() {
                    let source = source.unwrap_or_default();
                    let target = target.unwrap_or_default();
                    let src = *node_ids.get(&source)
                        .ok_or_else(|| Error::ExecutionError(format!("gexf: edge source '{source}' not found")))?;
                    let dst = *node_ids.get(&target)
                        .ok_or_else(|| Error::ExecutionError(format!("gexf: edge target '{target}' not found")))?;
                    let rid = RelId(next_rel_id);
                    next_rel_id += 1;
                    relationships.push(Relationship { id: rid, element_id: Some(id), src, dst, rel_type: label, properties: cur_props.clone() });
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"attvalue" => {
                let for_id = attr(&e, "for")?;
                let value = attr(&e, "value")?;
                let names = if in_nodes_section { &node_attr_names } else { &edge_attr_names };
                if let Some((name, attr_type)) = names.get(&for_id) {
                    cur_props.insert(name.clone(), value_from_typed(attr_type, &value));
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(GraphSnapshot { nodes, relationships })
}
