//! Batch log record framing.
//!
//! Each committed batch is one log record:
//!
//! ```text
//! magic (4) || version (2) || sequence (8 LE) || payload_len (4 LE)
//!   || payload || crc32(payload) (4 LE)
//! ```
//!
//! The payload is `op_count (4 LE)` followed by each operation as
//! `op_type (1) || cf (1) || key_len (4 LE) || key [|| value_len (4 LE)
//! || value]`. A record whose magic, length, or checksum does not match is
//! treated as a torn tail and truncated during recovery.

use crate::batch::{BatchOp, WriteBatch};
use crate::cf::ColumnFamily;
use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying a batch log record.
pub const LOG_MAGIC: [u8; 4] = *b"TLOG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Record header size: magic + version + sequence + payload length.
pub const HEADER_SIZE: usize = 4 + 2 + 8 + 4;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Computes the IEEE CRC-32 checksum of `data`.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Encodes a batch as a framed log record.
pub fn encode_record(sequence: u64, batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(64 + batch.len() * 32);
    let count = u32::try_from(batch.len())
        .map_err(|_| StorageError::corrupted("batch too large"))?;
    payload.extend_from_slice(&count.to_le_bytes());

    for op in batch.ops() {
        match op {
            BatchOp::Put { cf, key, value } => {
                payload.push(OP_PUT);
                payload.push(cf.as_byte());
                push_len_prefixed(&mut payload, key)?;
                push_len_prefixed(&mut payload, value)?;
            }
            BatchOp::Delete { cf, key } => {
                payload.push(OP_DELETE);
                payload.push(cf.as_byte());
                push_len_prefixed(&mut payload, key)?;
            }
        }
    }

    let payload_len = u32::try_from(payload.len())
        .map_err(|_| StorageError::corrupted("batch payload too large"))?;

    let mut record = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    record.extend_from_slice(&LOG_MAGIC);
    record.extend_from_slice(&LOG_VERSION.to_le_bytes());
    record.extend_from_slice(&sequence.to_le_bytes());
    record.extend_from_slice(&payload_len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32(&payload).to_le_bytes());
    Ok(record)
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> StorageResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| StorageError::corrupted("key or value too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// A decoded log record.
#[derive(Debug)]
pub struct LogRecord {
    /// Commit sequence assigned to the batch.
    pub sequence: u64,
    /// The batch operations.
    pub batch: WriteBatch,
    /// Total encoded size of the record including framing.
    pub encoded_len: usize,
}

/// Outcome of attempting to decode a record at a log offset.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete, valid record.
    Record(LogRecord),
    /// The remaining bytes do not form a complete record (torn tail).
    TornTail,
}

/// Decodes one record from `bytes`.
///
/// A short or checksum-failing suffix decodes to [`DecodeOutcome::TornTail`]
/// so that recovery can truncate it; structurally impossible content (bad
/// magic mid-log, unknown op or column family) is a hard corruption error.
pub fn decode_record(bytes: &[u8]) -> StorageResult<DecodeOutcome> {
    if bytes.len() < HEADER_SIZE {
        return Ok(DecodeOutcome::TornTail);
    }
    if bytes[0..4] != LOG_MAGIC {
        return Err(StorageError::corrupted("bad record magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != LOG_VERSION {
        return Err(StorageError::corrupted(format!(
            "unsupported log version {version}"
        )));
    }
    let sequence = u64::from_le_bytes(bytes[6..14].try_into().expect("8 bytes"));
    let payload_len =
        u32::from_le_bytes(bytes[14..18].try_into().expect("4 bytes")) as usize;

    let total = HEADER_SIZE + payload_len + 4;
    if bytes.len() < total {
        return Ok(DecodeOutcome::TornTail);
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];
    let stored_crc = u32::from_le_bytes(
        bytes[HEADER_SIZE + payload_len..total]
            .try_into()
            .expect("4 bytes"),
    );
    let actual_crc = crc32(payload);
    if stored_crc != actual_crc {
        // A mismatched checksum at the tail is a torn write, not corruption.
        return Ok(DecodeOutcome::TornTail);
    }

    let batch = decode_payload(payload)?;
    Ok(DecodeOutcome::Record(LogRecord {
        sequence,
        batch,
        encoded_len: total,
    }))
}

fn decode_payload(payload: &[u8]) -> StorageResult<WriteBatch> {
    let mut pos = 0usize;
    let count = read_u32(payload, &mut pos)? as usize;
    let mut batch = WriteBatch::new();

    for _ in 0..count {
        let op_type = read_u8(payload, &mut pos)?;
        let cf = ColumnFamily::from_byte(read_u8(payload, &mut pos)?)?;
        let key = read_bytes(payload, &mut pos)?;
        match op_type {
            OP_PUT => {
                let value = read_bytes(payload, &mut pos)?;
                batch.put(cf, key, value);
            }
            OP_DELETE => {
                batch.delete(cf, key);
            }
            other => {
                return Err(StorageError::corrupted(format!(
                    "unknown batch op type {other}"
                )));
            }
        }
    }

    if pos != payload.len() {
        return Err(StorageError::corrupted("trailing bytes in batch payload"));
    }
    Ok(batch)
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> StorageResult<u8> {
    let b = *bytes
        .get(*pos)
        .ok_or_else(|| StorageError::corrupted("truncated batch payload"))?;
    *pos += 1;
    Ok(b)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> StorageResult<u32> {
    let end = *pos + 4;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| StorageError::corrupted("truncated batch payload"))?;
    *pos = end;
    Ok(u32::from_le_bytes(slice.try_into().expect("4 bytes")))
}

fn read_bytes(bytes: &[u8], pos: &mut usize) -> StorageResult<Vec<u8>> {
    let len = read_u32(bytes, pos)? as usize;
    let end = *pos + len;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| StorageError::corrupted("truncated batch payload"))?;
    *pos = end;
    Ok(slice.to_vec())
}
