//! Vector index persistence.
//!
//! An index saves to a directory as three files:
//!
//! - `meta.json` — parameters, node count, entry point, max layer
//! - `labels.bin` — per-node label and tombstone flag
//! - `index.bin` — per-node vector and neighbor lists
//!
//! Binary files carry a magic, a version, and a trailing CRC-32. Saves go
//! to temp files renamed into place, so a crash leaves either the old or
//! the new index, never a torn one. Loads fail closed into an error the
//! caller downgrades to an empty index (`IndexCorrupt` log).

use super::{HnswIndex, HnswParams, Node};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use themis_storage::crc32;

const INDEX_MAGIC: [u8; 4] = *b"THNW";
const LABELS_MAGIC: [u8; 4] = *b"THNL";
const FORMAT_VERSION: u16 = 1;

/// `meta.json` contents.
#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    params: HnswParams,
    node_count: usize,
    entry_point: Option<usize>,
    max_layer: usize,
}

/// Saves the index atomically into `dir`.
///
/// # Errors
///
/// Returns an I/O error if any file cannot be written or renamed.
pub fn save(index: &HnswIndex, dir: &Path) -> CoreResult<()> {
    fs::create_dir_all(dir)?;

    let meta = Meta {
        params: index.params().clone(),
        node_count: index.nodes.len(),
        entry_point: index.entry_point,
        max_layer: index.max_layer,
    };
    let meta_bytes = serde_json::to_vec_pretty(&meta)
        .map_err(|e| CoreError::invalid_operation(e.to_string()))?;

    let mut labels = Vec::new();
    labels.extend_from_slice(&LABELS_MAGIC);
    labels.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    for node in &index.nodes {
        let name = node.label.as_bytes();
        labels.extend_from_slice(&(name.len() as u32).to_le_bytes());
        labels.extend_from_slice(name);
        labels.push(u8::from(node.deleted));
    }
    labels.extend_from_slice(&crc32(&labels).to_le_bytes());

    let mut graph = Vec::new();
    graph.extend_from_slice(&INDEX_MAGIC);
    graph.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    for node in &index.nodes {
        for value in &node.vector {
            graph.extend_from_slice(&value.to_le_bytes());
        }
        graph.extend_from_slice(&(node.neighbors.len() as u32).to_le_bytes());
        for layer in &node.neighbors {
            graph.extend_from_slice(&(layer.len() as u32).to_le_bytes());
            for &neighbor in layer {
                graph.extend_from_slice(&(neighbor as u64).to_le_bytes());
            }
        }
    }
    graph.extend_from_slice(&crc32(&graph).to_le_bytes());

    write_atomic(&dir.join("meta.json"), &meta_bytes)?;
    write_atomic(&dir.join("labels.bin"), &labels)?;
    write_atomic(&dir.join("index.bin"), &graph)?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads an index from `dir`.
///
/// # Errors
///
/// Returns [`CoreError::IndexCorrupt`] on any structural problem; the
/// caller reverts to an empty index and logs.
pub fn load(dir: &Path) -> CoreResult<HnswIndex> {
    let meta_bytes = fs::read(dir.join("meta.json"))
        .map_err(|e| CoreError::index_corrupt(format!("meta.json: {e}")))?;
    let meta: Meta = serde_json::from_slice(&meta_bytes)
        .map_err(|e| CoreError::index_corrupt(format!("meta.json: {e}")))?;

    let labels = read_checked(&dir.join("labels.bin"), &LABELS_MAGIC)?;
    let graph = read_checked(&dir.join("index.bin"), &INDEX_MAGIC)?;

    let mut label_reader = Cursor::new(&labels);
    let mut parsed_labels = Vec::with_capacity(meta.node_count);
    for _ in 0..meta.node_count {
        let len = label_reader.read_u32()? as usize;
        let name = label_reader.read_slice(len)?;
        let label = std::str::from_utf8(name)
            .map_err(|_| CoreError::index_corrupt("label is not UTF-8"))?
            .to_string();
        let deleted = label_reader.read_u8()? != 0;
        parsed_labels.push((label, deleted));
    }
    if !label_reader.is_empty() {
        return Err(CoreError::index_corrupt("trailing bytes in labels.bin"));
    }

    let mut graph_reader = Cursor::new(&graph);
    let mut nodes = Vec::with_capacity(meta.node_count);
    let mut label_map = HashMap::new();
    for (id, (label, deleted)) in parsed_labels.into_iter().enumerate() {
        let mut vector = Vec::with_capacity(meta.params.dim);
        for _ in 0..meta.params.dim {
            vector.push(graph_reader.read_f32()?);
        }
        let layer_count = graph_reader.read_u32()? as usize;
        if layer_count > 64 {
            return Err(CoreError::index_corrupt("implausible layer count"));
        }
        let mut neighbors = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            let link_count = graph_reader.read_u32()? as usize;
            let mut layer = Vec::with_capacity(link_count);
            for _ in 0..link_count {
                let neighbor = graph_reader.read_u64()? as usize;
                if neighbor >= meta.node_count {
                    return Err(CoreError::index_corrupt("neighbor id out of range"));
                }
                layer.push(neighbor);
            }
            neighbors.push(layer);
        }
        if !deleted {
            label_map.insert(label.clone(), id);
        }
        nodes.push(Node {
            label,
            vector,
            neighbors,
            deleted,
        });
    }
    if !graph_reader.is_empty() {
        return Err(CoreError::index_corrupt("trailing bytes in index.bin"));
    }

    if let Some(entry) = meta.entry_point {
        if entry >= nodes.len() {
            return Err(CoreError::index_corrupt("entry point out of range"));
        }
    }

    let mut index = HnswIndex::new(meta.params);
    index.nodes = nodes;
    index.label_map = label_map;
    index.entry_point = meta.entry_point;
    index.max_layer = meta.max_layer;
    Ok(index)
}

/// Returns true if `dir` looks like a saved index.
#[must_use]
pub fn exists(dir: &Path) -> bool {
    dir.join("meta.json").is_file()
        && dir.join("labels.bin").is_file()
        && dir.join("index.bin").is_file()
}

fn read_checked(path: &Path, magic: &[u8; 4]) -> CoreResult<Vec<u8>> {
    let bytes =
        fs::read(path).map_err(|e| CoreError::index_corrupt(format!("{}: {e}", path.display())))?;
    if bytes.len() < 4 + 2 + 4 {
        return Err(CoreError::index_corrupt("file too short"));
    }
    if &bytes[0..4] != magic {
        return Err(CoreError::index_corrupt("bad magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(CoreError::index_corrupt(format!(
            "unsupported version {version}"
        )));
    }
    let body_end = bytes.len() - 4;
    let stored = u32::from_le_bytes(bytes[body_end..].try_into().expect("4 bytes"));
    let actual = crc32(&bytes[..body_end]);
    if stored != actual {
        return Err(CoreError::index_corrupt("checksum mismatch"));
    }
    Ok(bytes[6..body_end].to_vec())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn read_slice(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CoreError::index_corrupt("truncated index file"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(
            self.read_slice(4)?.try_into().expect("4 bytes"),
        ))
    }

    fn read_u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(
            self.read_slice(8)?.try_into().expect("8 bytes"),
        ))
    }

    fn read_f32(&mut self) -> CoreResult<f32> {
        Ok(f32::from_le_bytes(
            self.read_slice(4)?.try_into().expect("4 bytes"),
        ))
    }
}
