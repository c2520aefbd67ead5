//! Binary format for Keel WAL records
//!
//! One record carries one write batch:
//! ChunkHeader (32 bytes) + sequence(u64) + count(u32) + count * op
//! where each op is: operation(u8) + key_len(u32) + value_len(u32) + key + value

use std::path::PathBuf;

use crate::batch::{BatchOp, WriteBatch};
use crate::error::{KeelError, KeelResult};

/// Magic bytes identifying Keel records: "KEEL" in ASCII
pub const MAGIC_ARRAY: [u8; 4] = [0x4B, 0x45, 0x45, 0x4C];

/// Maximum key size in bytes (1MB)
pub const MAX_KEY_SIZE: usize = 1024 * 1024;

/// Maximum value size in bytes (32MB)
pub const MAX_VALUE_SIZE: usize = 32 * 1024 * 1024;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Bytes before the first op: sequence(8) + count(4)
const BATCH_PREFIX_SIZE: usize = 12;

/// Bytes of fixed fields per op: operation(1) + key_len(4) + value_len(4)
const OP_PREFIX_SIZE: usize = 9;

/// Operation tags inside a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
}

/// Record kinds stored in `ChunkHeader::entry_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Batch = 1,
}

/// Fixed-size header for each WAL record
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "KEEL"
///   [4..8]   length:     u32    - payload length in bytes
///   [8..12]  checksum:   u32    - CRC32C of payload bytes
///   [12]     entry_type: u8     - record kind
///   [13..32] reserved, zero
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, kind: RecordKind) -> Self {
        Self { magic: MAGIC_ARRAY, length, checksum, entry_type: kind as u8 }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            entry_type: bytes[12],
        }
    }
}

/// A decoded WAL record: the batch and the sequence number of its first op.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub sequence: u64,
    pub batch: WriteBatch,
}

impl WalRecord {
    /// Sequence number assigned to the last op of the batch.
    pub fn last_sequence(&self) -> u64 {
        self.sequence + self.batch.len().saturating_sub(1) as u64
    }
}

/// Reject keys and values the record format cannot carry.
pub fn check_sizes(key: &[u8], value: &[u8]) -> KeelResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(KeelError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key",
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(KeelError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value",
        });
    }
    Ok(())
}

/// Serialize a batch into one complete WAL record.
pub fn serialize_batch(sequence: u64, batch: &WriteBatch) -> KeelResult<Vec<u8>> {
    // Validate before allocating anything proportional to the input
    let mut payload_size = BATCH_PREFIX_SIZE;
    for op in batch.ops() {
        let value: &[u8] = match op {
            BatchOp::Put { value, .. } => value,
            BatchOp::Delete { .. } => &[],
        };
        check_sizes(op.key(), value)?;
        payload_size += OP_PREFIX_SIZE + op.key().len() + value.len();
    }
    if payload_size > u32::MAX as usize {
        return Err(KeelError::OversizedEntry {
            entry_size: payload_size as u64,
            max_size: u32::MAX as u64,
            component: "batch",
        });
    }

    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for op in batch.ops() {
        let (tag, key, value): (Operation, &[u8], &[u8]) = match op {
            BatchOp::Put { key, value } => (Operation::Put, key, value),
            BatchOp::Delete { key } => (Operation::Delete, key, &[]),
        };
        payload.push(tag as u8);
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);
    }

    let checksum = crc32c::crc32c(&payload);
    let header = ChunkHeader::new(payload.len() as u32, checksum, RecordKind::Batch);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

fn corrupt(offset: usize, reason: String) -> KeelError {
    KeelError::Corruption { path: PathBuf::from("<buffer>"), offset: offset as u64, reason }
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

/// Deserialize one WAL record from a byte slice starting at its header.
pub fn deserialize_record(data: &[u8]) -> KeelResult<WalRecord> {
    if data.len() < HEADER_SIZE {
        return Err(corrupt(0, format!("record too short: {} bytes, need at least {}", data.len(), HEADER_SIZE)));
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(KeelError::NoMagicFound {
            path: PathBuf::from("<buffer>"),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(KeelError::TornWrite {
            path: PathBuf::from("<buffer>"),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(KeelError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    if header.entry_type != RecordKind::Batch as u8 {
        return Err(corrupt(12, format!("unknown record kind: {}", header.entry_type)));
    }
    if payload.len() < BATCH_PREFIX_SIZE {
        return Err(corrupt(HEADER_SIZE, "payload too short for batch prefix".to_string()));
    }

    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&payload[0..8]);
    let sequence = u64::from_le_bytes(seq_bytes);
    let count = read_u32(payload, 8) as usize;

    let mut ops = Vec::with_capacity(count.min(payload.len() / OP_PREFIX_SIZE));
    let mut pos = BATCH_PREFIX_SIZE;
    for _ in 0..count {
        if pos + OP_PREFIX_SIZE > payload.len() {
            return Err(corrupt(HEADER_SIZE + pos, "op header runs past payload".to_string()));
        }
        let tag = payload[pos];
        let key_len = read_u32(payload, pos + 1) as usize;
        let value_len = read_u32(payload, pos + 5) as usize;
        let key_start = pos + OP_PREFIX_SIZE;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if end > payload.len() {
            return Err(corrupt(
                HEADER_SIZE + pos,
                format!("op needs {} bytes for key({}) + value({})", end - pos, key_len, value_len),
            ));
        }

        let key = payload[key_start..value_start].to_vec();
        match tag {
            t if t == Operation::Put as u8 => {
                ops.push(BatchOp::Put { key, value: payload[value_start..end].to_vec() });
            }
            t if t == Operation::Delete as u8 => ops.push(BatchOp::Delete { key }),
            other => return Err(corrupt(HEADER_SIZE + pos, format!("invalid operation type: {}", other))),
        }
        pos = end;
    }

    Ok(WalRecord { sequence, batch: WriteBatch::from_ops(ops) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(b"key1", b"value1").delete(b"key0").put(b"k\0y", b"");
        batch
    }

    #[test]
    fn test_header_layout() {
        let header = ChunkHeader::new(99, 0xDEADBEEF, RecordKind::Batch);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"KEEL");
        let parsed = ChunkHeader::from_bytes(&bytes);
        assert_eq!(parsed.length, 99);
        assert_eq!(parsed.checksum, 0xDEADBEEF);
        assert_eq!(parsed.entry_type, RecordKind::Batch as u8);
    }

    #[test]
    fn test_batch_record_decodes_in_order() {
        let data = serialize_batch(41, &sample_batch()).unwrap();
        let record = deserialize_record(&data).unwrap();

        assert_eq!(record.sequence, 41);
        assert_eq!(record.last_sequence(), 43);
        assert_eq!(record.batch.ops(), sample_batch().ops());
    }

    #[test]
    fn test_oversized_key_rejected() {
        let mut batch = WriteBatch::new();
        batch.put(&vec![0u8; MAX_KEY_SIZE + 1], b"v");
        let result = serialize_batch(1, &batch);
        assert!(matches!(result, Err(KeelError::OversizedEntry { component: "key", .. })));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = serialize_batch(1, &sample_batch()).unwrap();
        data[0] = 0xFF;
        assert!(matches!(deserialize_record(&data), Err(KeelError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = serialize_batch(1, &sample_batch()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(deserialize_record(&data), Err(KeelError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_is_torn() {
        let data = serialize_batch(1, &sample_batch()).unwrap();
        let result = deserialize_record(&data[..data.len() - 3]);
        assert!(matches!(result, Err(KeelError::TornWrite { .. })));
    }
}
