//! CAR v1 / DAG-CBOR codec, gated behind the `car` feature.
//!
//! Block framing follows the CAR v1 spec directly (a varint-prefixed
//! DAG-CBOR header naming the root CIDs, followed by varint-prefixed
//! `cid || block_bytes` frames) rather than going through `iroh-car`'s
//! async reader/writer — this registry's [`FormatCodec`] contract is a
//! synchronous `Read`/`Write` pair, and bridging that to `iroh-car`'s
//! `tokio::io::AsyncRead`/`AsyncWrite` surface would need a dependency
//! this crate doesn't otherwise carry. `cid`, `multihash`, and
//! `serde_ipld_dagcbor` do the actual content-addressing and encoding
//! work; the varint framing is the only part hand-rolled here.
//!
//! Each node and relationship is stored as its own DAG-CBOR block, CID'd
//! by a blake3-256 multihash (multicodec 0x1e), with a manifest block
//! (DAG-CBOR, raw codec) listing every node/relationship CID so `load`
//! can tell the two kinds of block apart without guessing.

use std::io::{Read, Write};

use cid::Cid as Dcid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::{Error, Result};

use super::{FormatCodec, GraphSnapshot};

/// Multicodec code for blake3-256 (per the multicodec table).
const BLAKE3_CODE: u64 = 0x1e;
/// Multicodec code for `dag-cbor`.
const DAG_CBOR_CODE: u64 = 0x71;

#[derive(Debug, Serialize, Deserialize)]
struct CarHeader {
    version: u64,
    roots: Vec<Dcid>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    node_cids: Vec<Dcid>,
    relationship_cids: Vec<Dcid>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Block {
    Node(Node),
    Relationship(Relationship),
    Manifest(Manifest),
}

pub fn car_codec() -> FormatCodec {
    FormatCodec::new(
        |snapshot, writer| write_car(snapshot, writer),
        |reader| read_car(reader),
    )
}

fn cid_for(bytes: &[u8]) -> Result<Dcid> {
    let hash = blake3::hash(bytes);
    let mh = Multihash::<64>::wrap(BLAKE3_CODE, hash.as_bytes())
        .map_err(|e| Error::ExecutionError(format!("car: multihash wrap failed: {e}")))?;
    Ok(Dcid::new_v1(DAG_CBOR_CODE, mh))
}

fn encode_block(block: &Block) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(block).map_err(|e| Error::ExecutionError(format!("car: dag-cbor encode failed: {e}")))
}

fn write_frame(writer: &mut dyn Write, cid: &Dcid, payload: &[u8]) -> Result<()> {
    let cid_bytes = cid.to_bytes();
    let frame_len = cid_bytes.len() + payload.len();
    write_varint(writer, frame_len as u64)?;
    writer.write_all(&cid_bytes)?;
    writer.write_all(payload)?;
    Ok(())
}

fn write_car(snapshot: &GraphSnapshot, writer: &mut dyn Write) -> Result<()> {
    let mut node_cids = Vec::with_capacity(snapshot.nodes.len());
    let mut rel_cids = Vec::with_capacity(snapshot.relationships.len());
    let mut frames: Vec<(Dcid, Vec<u8>)> = Vec::new();

    for node in &snapshot.nodes {
        let payload = encode_block(&Block::Node(node.clone()))?;
        let cid = cid_for(&payload)?;
        node_cids.push(cid);
        frames.push((cid, payload));
    }
    for rel in &snapshot.relationships {
        let payload = encode_block(&Block::Relationship(rel.clone()))?;
        let cid = cid_for(&payload)?;
        rel_cids.push(cid);
        frames.push((cid, payload));
    }

    let manifest_payload = encode_block(&Block::Manifest(Manifest {
        node_cids: node_cids.clone(),
        relationship_cids: rel_cids.clone(),
    }))?;
    let manifest_cid = cid_for(&manifest_payload)?;

    let header = CarHeader { version: 1, roots: vec![manifest_cid] };
    let header_bytes = serde_ipld_dagcbor::to_vec(&header)
        .map_err(|e| Error::ExecutionError(format!("car: header encode failed: {e}")))?;
    write_varint(writer, header_bytes.len() as u64)?;
    writer.write_all(&header_bytes)?;

    write_frame(writer, &manifest_cid, &manifest_payload)?;
    for (cid, payload) in &frames {
        write_frame(writer, cid, payload)?;
    }
    Ok(())
}

fn read_car(reader: &mut dyn Read) -> Result<GraphSnapshot> {
    let header_len = read_varint(reader)?
        .ok_or_else(|| Error::ExecutionError("car: empty stream, expected header".into()))?;
    let mut header_bytes = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_bytes)?;
    let header: CarHeader = serde_ipld_dagcbor::from_slice(&header_bytes)
        .map_err(|e| Error::ExecutionError(format!("car: header decode failed: {e}")))?;
    if header.version != 1 {
        return Err(Error::ExecutionError(format!("car: unsupported version {}", header.version)));
    }

    let mut blocks: std::collections::HashMap<Dcid, Block> = std::collections::HashMap::new();
    while let Some(frame_len) = read_varint(reader)? {
        let mut frame = vec![0u8; frame_len as usize];
        reader.read_exact(&mut frame)?;
        let mut cursor = std::io::Cursor::new(&frame[..]);
        let cid = Dcid::read_bytes(&mut cursor)
            .map_err(|e| Error::ExecutionError(format!("car: frame cid decode failed: {e}")))?;
        let cid_len = cursor.position() as usize;
        let payload = &frame[cid_len..];
        let block: Block = serde_ipld_dagcbor::from_slice(payload)
            .map_err(|e| Error::ExecutionError(format!("car: block decode failed: {e}")))?;
        blocks.insert(cid, block);
    }

    let manifest_cid = *header.roots.first()
        .ok_or_else(|| Error::ExecutionError("car: header has no root CID".into()))?;
    let manifest = match blocks.get(&manifest_cid) {
        Some(Block::Manifest(m)) => m,
        _ => return Err(Error::ExecutionError("car: root CID does not resolve to a manifest block".into())),
    };

    let mut nodes = Vec::with_capacity(manifest.node_cids.len());
    for cid in &manifest.node_cids {
        match blocks.get(cid) {
            Some(Block::Node(n)) => nodes.push(n.clone()),
            _ => return Err(Error::ExecutionError(format!("car: manifest references missing node block {cid}"))),
        }
    }
    let mut relationships = Vec::with_capacity(manifest.relationship_cids.len());
    for cid in &manifest.relationship_cids {
        match blocks.get(cid) {
            Some(Block::Relationship(r)) => relationships.push(r.clone()),
            _ => return Err(Error::ExecutionError(format!("car: manifest references missing relationship block {cid}"))),
        }
    }

    Ok(GraphSnapshot { nodes, relationships })
}

/// Unsigned LEB128 varint, per the multiformats `unsigned-varint` spec
/// CAR v1 uses for its frame-length prefixes.
fn write_varint(writer: &mut dyn Write, mut value: u64) -> Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_all(&[byte])?;
        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Reads one varint, or `None` at a clean end-of-stream (no bytes read
/// before EOF) — used to detect the end of the frame list.
fn read_varint(reader: &mut dyn Read) -> Result<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut first_byte = [0u8; 1];
    match reader.read(&mut first_byte)? {
        0 => return Ok(None),
        _ => {}
    }
    loop {
        let byte = first_byte[0];
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        reader.read_exact(&mut first_byte)?;
    }
    Ok(Some(result))
}
