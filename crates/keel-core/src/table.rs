//! Checkpoint table files
//!
//! A table holds the full live key space at one sequence number, sorted by
//! key. Tables are written whole and only then renamed into place, so a
//! present table is either complete or damaged, never half written.
//!
//! File format:
//!   TableHeader (24 bytes) + entry_count * (EntryHeader (24 bytes) + key + stored_value)
//!
//! TableHeader:
//!   [0..4]   magic:         "KEEL"
//!   [4..6]   version:       u16 LE
//!   [6]      compression:   u8
//!   [7]      reserved
//!   [8..16]  last_sequence: u64 LE
//!   [16..20] entry_count:   u32 LE
//!   [20..24] checksum:      u32 LE - CRC32C of bytes [0..20]
//!
//! EntryHeader:
//!   [0..4]   magic:      "KEEL"
//!   [4..8]   key_len:    u32 LE
//!   [8..12]  stored_len: u32 LE
//!   [12..16] checksum:   u32 LE - CRC32C of (key + stored_value)
//!   [16]     flags:      u8     - bit 0 = value is Snappy-compressed
//!   [17..24] reserved

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::Compression;
use crate::durability::{durable_sync, sync_dir};
use crate::error::{KeelError, KeelResult};
use crate::format::{MAGIC_ARRAY, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::wal::RecoveryMode;

pub const DATA_DIR: &str = "data";

const TABLE_VERSION: u16 = 1;
const TABLE_HEADER_SIZE: usize = 24;
const ENTRY_HEADER_SIZE: usize = 24;
const FLAG_SNAPPY: u8 = 0x01;

fn table_name(number: u64) -> String {
    format!("table-{:016x}.keel", number)
}

fn parse_table_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("table-")?.strip_suffix(".keel")?;
    u64::from_str_radix(hex, 16).ok()
}

/// Every complete table file in `data_dir`, ordered by table number.
pub fn list_tables(data_dir: &Path) -> KeelResult<Vec<(u64, PathBuf)>> {
    let mut tables = Vec::new();
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tables),
        Err(e) => return Err(KeelError::io_at(data_dir, "read data directory", e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| KeelError::io_at(data_dir, "read data directory entry", e))?;
        if let Some(number) = entry.file_name().to_str().and_then(parse_table_name) {
            tables.push((number, entry.path()));
        }
    }
    tables.sort_by_key(|(number, _)| *number);
    Ok(tables)
}

/// Delete every table except `keep`, plus any abandoned temp files.
pub fn remove_tables_except(data_dir: &Path, keep: u64) -> KeelResult<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(KeelError::io_at(data_dir, "read data directory", e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let stale = match parse_table_name(name) {
            Some(number) => number != keep,
            None => name.starts_with("table-") && name.ends_with(".tmp"),
        };
        if stale {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| KeelError::io_at(&path, "remove table", e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Summary of a written table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub number: u64,
    pub path: PathBuf,
    pub entries: usize,
    pub bytes: u64,
}

/// Write `entries` (already sorted by key) as table `number`.
///
/// Crash safety: write `<name>.tmp`, durable_sync it, rename over the final
/// name, then sync the directory. A crash before the rename leaves only an
/// ignored temp file.
pub fn write_table<'a, I>(
    data_dir: &Path,
    number: u64,
    last_sequence: u64,
    compression: Compression,
    entries: I,
) -> KeelResult<TableInfo>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    fs::create_dir_all(data_dir).map_err(|e| KeelError::io_at(data_dir, "create data directory", e))?;
    let final_path = data_dir.join(table_name(number));
    let tmp_path = data_dir.join(format!("{}.tmp", table_name(number)));

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| KeelError::io_at(&tmp_path, "create table", e))?;
    let mut out = BufWriter::new(file);

    // Header goes last, once the entry count is known; reserve its space now
    let write_err = |e| KeelError::io_at(&tmp_path, "write table", e);
    out.write_all(&[0u8; TABLE_HEADER_SIZE]).map_err(write_err)?;

    let mut count: u32 = 0;
    let mut bytes = TABLE_HEADER_SIZE as u64;
    let mut encoder = snap::raw::Encoder::new();
    for (key, value) in entries {
        let (stored, flags) = match compression {
            Compression::Snappy => {
                let compressed = encoder.compress_vec(value).map_err(|e| KeelError::Io {
                    path: Some(tmp_path.clone()),
                    kind: std::io::ErrorKind::InvalidData,
                    message: format!("snappy compress: {}", e),
                })?;
                // Incompressible values are kept raw
                if compressed.len() < value.len() {
                    (compressed, FLAG_SNAPPY)
                } else {
                    (value.to_vec(), 0)
                }
            }
            Compression::None => (value.to_vec(), 0),
        };

        let mut crc = crc32c::crc32c(key);
        crc = crc32c::crc32c_append(crc, &stored);

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC_ARRAY);
        header[4..8].copy_from_slice(&(key.len() as u32).to_le_bytes());
        header[8..12].copy_from_slice(&(stored.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&crc.to_le_bytes());
        header[16] = flags;

        out.write_all(&header).map_err(write_err)?;
        out.write_all(key).map_err(write_err)?;
        out.write_all(&stored).map_err(write_err)?;
        count += 1;
        bytes += (ENTRY_HEADER_SIZE + key.len() + stored.len()) as u64;
    }

    let mut file = out.into_inner().map_err(|e| KeelError::io_at(&tmp_path, "flush table", e.into_error()))?;
    {
        use std::io::{Seek, SeekFrom};
        let header = encode_table_header(last_sequence, compression, count);
        file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        file.write_all(&header).map_err(write_err)?;
    }
    durable_sync(&file).map_err(|e| KeelError::io_at(&tmp_path, "table durable_sync", e))?;
    drop(file);

    fs::rename(&tmp_path, &final_path).map_err(|e| KeelError::io_at(&final_path, "install table", e))?;
    sync_dir(data_dir).map_err(|e| KeelError::io_at(data_dir, "sync data directory", e))?;

    Ok(TableInfo { number, path: final_path, entries: count as usize, bytes })
}

fn encode_table_header(last_sequence: u64, compression: Compression, count: u32) -> [u8; TABLE_HEADER_SIZE] {
    let mut header = [0u8; TABLE_HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC_ARRAY);
    header[4..6].copy_from_slice(&TABLE_VERSION.to_le_bytes());
    header[6] = compression as u8;
    header[8..16].copy_from_slice(&last_sequence.to_le_bytes());
    header[16..20].copy_from_slice(&count.to_le_bytes());
    let crc = crc32c::crc32c(&header[0..20]);
    header[20..24].copy_from_slice(&crc.to_le_bytes());
    header
}

/// Decoded contents of a table file.
#[derive(Debug, Default)]
pub struct Table {
    /// Every sequence number at or below this one is covered by the table
    pub last_sequence: u64,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub skipped: usize,
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Read a whole table, verifying every checksum.
pub fn read_table(path: &Path, mode: RecoveryMode) -> KeelResult<Table> {
    let mut buffer = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut buffer))
        .map_err(|e| KeelError::io_at(path, "read table", e))?;

    let mut table = Table::default();
    let corrupt = |offset: usize, reason: String| KeelError::Corruption {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason,
    };

    let mut expected_count = None;
    let header_ok = buffer.len() >= TABLE_HEADER_SIZE
        && buffer[0..4] == MAGIC_ARRAY
        && crc32c::crc32c(&buffer[0..20]) == u32_at(&buffer, 20);
    if header_ok {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buffer[8..16]);
        table.last_sequence = u64::from_le_bytes(seq);
        expected_count = Some(u32_at(&buffer, 16) as usize);
    } else if mode == RecoveryMode::Strict {
        return Err(corrupt(0, "bad table header".to_string()));
    } else {
        warn!(path = %path.display(), "table header damaged, salvaging entries");
        table.skipped += 1;
    }

    let mut decoder = snap::raw::Decoder::new();
    let mut offset = TABLE_HEADER_SIZE;
    while offset + ENTRY_HEADER_SIZE <= buffer.len() {
        let entry = decode_entry(&buffer, offset, &mut decoder);
        match entry {
            Ok((key, value, next)) => {
                table.entries.push((key, value));
                offset = next;
            }
            Err(reason) => {
                if mode == RecoveryMode::Strict {
                    return Err(corrupt(offset, reason));
                }
                warn!(path = %path.display(), offset, %reason, "skipping damaged table entry");
                table.skipped += 1;
                match (offset + 1..=buffer.len().saturating_sub(4)).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }

    if mode == RecoveryMode::Strict {
        if offset != buffer.len() {
            return Err(corrupt(offset, "trailing bytes after last entry".to_string()));
        }
        if let Some(expected) = expected_count {
            if expected != table.entries.len() {
                return Err(corrupt(
                    offset,
                    format!("expected {} entries, found {}", expected, table.entries.len()),
                ));
            }
        }
    }
    Ok(table)
}

fn decode_entry(
    buffer: &[u8],
    offset: usize,
    decoder: &mut snap::raw::Decoder,
) -> Result<(Vec<u8>, Vec<u8>, usize), String> {
    if buffer[offset..offset + 4] != MAGIC_ARRAY {
        return Err("bad entry magic".to_string());
    }
    let key_len = u32_at(buffer, offset + 4) as usize;
    let stored_len = u32_at(buffer, offset + 8) as usize;
    let checksum = u32_at(buffer, offset + 12);
    let flags = buffer[offset + 16];
    if key_len > MAX_KEY_SIZE || stored_len > MAX_VALUE_SIZE {
        return Err(format!("implausible sizes key={} value={}", key_len, stored_len));
    }

    let key_start = offset + ENTRY_HEADER_SIZE;
    let value_start = key_start + key_len;
    let end = value_start + stored_len;
    if end > buffer.len() {
        return Err(format!("entry needs {} bytes, {} available", end - offset, buffer.len() - offset));
    }

    let key = &buffer[key_start..value_start];
    let stored = &buffer[value_start..end];
    let actual = crc32c::crc32c_append(crc32c::crc32c(key), stored);
    if actual != checksum {
        return Err(format!("checksum mismatch: expected 0x{:08x}, got 0x{:08x}", checksum, actual));
    }

    let value = if flags & FLAG_SNAPPY != 0 {
        decoder.decompress_vec(stored).map_err(|e| format!("snappy decompress: {}", e))?
    } else {
        stored.to_vec()
    };
    Ok((key.to_vec(), value, end))
}
