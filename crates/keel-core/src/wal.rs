//! Write-ahead log for Keel
//!
//! Every write batch becomes one record appended to the current segment
//! before the memtable sees it:
//! 1. Serialize the batch (sequence number + ops, CRC32C over the payload)
//! 2. Append the bytes to the segment
//! 3. If the caller asked for `sync`, durable_sync() the segment
//! 4. Return; the caller applies the batch to memory only after this
//!
//! Each open starts a fresh segment, so a torn tail left by a crash is never
//! followed by new records. A checkpoint rotates to a new segment and removes
//! the ones it covered.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::durability::durable_sync;
use crate::error::{KeelError, KeelResult};
use crate::format::{deserialize_record, WalRecord, HEADER_SIZE, MAGIC_ARRAY};

pub const WAL_DIR: &str = "wal";

/// How recovery treats damaged records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Any damaged record other than a torn tail fails recovery
    Strict,
    /// Damaged records are skipped; scanning resumes at the next magic
    Salvage,
}

fn segment_name(sequence: u64) -> String {
    format!("wal-{:016x}.log", sequence)
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    u64::from_str_radix(hex, 16).ok()
}

/// All segments in `wal_dir`, ordered by sequence number.
pub fn list_segments(wal_dir: &Path) -> KeelResult<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    let entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(KeelError::io_at(wal_dir, "read WAL directory", e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| KeelError::io_at(wal_dir, "read WAL directory entry", e))?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_name) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Delete every segment numbered below `keep_from`.
pub fn remove_segments_before(wal_dir: &Path, keep_from: u64) -> KeelResult<usize> {
    let mut removed = 0;
    for (seq, path) in list_segments(wal_dir)? {
        if seq < keep_from {
            std::fs::remove_file(&path).map_err(|e| KeelError::io_at(&path, "remove WAL segment", e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Appends batch records to the current WAL segment.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
}

impl WalWriter {
    /// Start a new segment numbered after every segment already in `wal_dir`.
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> KeelResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| KeelError::io_at(&wal_dir, "create WAL directory", e))?;

        let sequence = list_segments(&wal_dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let path = wal_dir.join(segment_name(sequence));
        let file = Self::create_segment(&path)?;

        Ok(Self { file, path, size: 0, wal_dir, sequence })
    }

    fn create_segment(path: &Path) -> KeelResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KeelError::io_at(path, "create WAL segment", e))
    }

    /// Append one serialized record; with `sync` the bytes are on the
    /// medium before this returns.
    pub fn append(&mut self, record: &[u8], sync: bool) -> KeelResult<()> {
        self.file
            .write_all(record)
            .map_err(|e| KeelError::io_at(&self.path, "WAL write", e))?;
        if sync {
            durable_sync(&self.file).map_err(|e| KeelError::io_at(&self.path, "WAL durable_sync", e))?;
        }
        self.size += record.len() as u64;
        Ok(())
    }

    /// Switch to a new segment after syncing the current one.
    /// Returns the sequence number of the new segment.
    pub fn rotate(&mut self) -> KeelResult<u64> {
        durable_sync(&self.file)
            .map_err(|e| KeelError::io_at(&self.path, "WAL sync before rotation", e))?;

        let sequence = self.sequence + 1;
        let path = self.wal_dir.join(segment_name(sequence));
        self.file = Self::create_segment(&path)?;
        self.path = path;
        self.size = 0;
        self.sequence = sequence;
        Ok(sequence)
    }

    pub fn sync(&self) -> KeelResult<()> {
        durable_sync(&self.file).map_err(|e| KeelError::io_at(&self.path, "WAL sync", e))
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Records recovered from the WAL plus how many damaged regions were skipped.
#[derive(Debug, Default)]
pub struct Recovered {
    pub records: Vec<WalRecord>,
    pub skipped: usize,
}

/// Replays WAL segments.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Read every record of every segment in sequence order.
    ///
    /// Per record: check magic, check the declared length fits, verify the
    /// CRC32C and decode. A record whose length runs past end of file, with
    /// no record after it, is the crash point and ends that segment in both
    /// modes. Anything else that
    /// fails is fatal in `Strict` mode and skipped in `Salvage` mode.
    pub fn recover(&self, mode: RecoveryMode) -> KeelResult<Recovered> {
        let mut recovered = Recovered::default();
        for (_, path) in list_segments(&self.wal_dir)? {
            self.recover_segment(&path, mode, &mut recovered)?;
        }
        Ok(recovered)
    }

    fn recover_segment(&self, path: &Path, mode: RecoveryMode, out: &mut Recovered) -> KeelResult<()> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut buffer))
            .map_err(|e| KeelError::io_at(path, "read WAL segment", e))?;

        let mut offset = 0;
        while offset + HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != MAGIC_ARRAY {
                let err = KeelError::NoMagicFound {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    found_bytes: [buffer[offset], buffer[offset + 1], buffer[offset + 2], buffer[offset + 3]],
                };
                match self.skip(err, mode, &buffer, offset, out)? {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let length = u32::from_le_bytes([
                buffer[offset + 4], buffer[offset + 5],
                buffer[offset + 6], buffer[offset + 7],
            ]) as usize;
            let total = HEADER_SIZE + length;

            if offset + total > buffer.len() {
                // A later record means the length field itself is damaged
                if find_next_magic(&buffer, offset + 1).is_some() {
                    let err = KeelError::Corruption {
                        path: path.to_path_buf(),
                        offset: offset as u64,
                        reason: format!("record length {} runs past a later record", length),
                    };
                    match self.skip(err, mode, &buffer, offset, out)? {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }
                warn!(
                    path = %path.display(),
                    offset,
                    need = total,
                    have = buffer.len() - offset,
                    "torn write at end of WAL segment, ignoring tail"
                );
                break;
            }

            match deserialize_record(&buffer[offset..offset + total]) {
                Ok(record) => {
                    out.records.push(record);
                    offset += total;
                }
                Err(e) => {
                    let err = KeelError::Corruption {
                        path: path.to_path_buf(),
                        offset: offset as u64,
                        reason: e.to_string(),
                    };
                    match self.skip(err, mode, &buffer, offset, out)? {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Fail in strict mode; otherwise log and resync at the next magic.
    fn skip(
        &self,
        err: KeelError,
        mode: RecoveryMode,
        buffer: &[u8],
        offset: usize,
        out: &mut Recovered,
    ) -> KeelResult<Option<usize>> {
        if mode == RecoveryMode::Strict {
            return Err(err);
        }
        warn!(error = %err, "skipping damaged WAL region");
        out.skipped += 1;
        Ok(find_next_magic(buffer, offset + 1))
    }
}

/// Next offset at or after `start` holding the record magic.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }
    (start..=buffer.len() - 4).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::WriteBatch;
    use crate::format::serialize_batch;
    use tempfile::TempDir;

    fn record(seq: u64, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        serialize_batch(seq, &batch).unwrap()
    }

    #[test]
    fn test_wal_write_read() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer.append(&record(1, b"key1", b"value1"), true).unwrap();
        writer.append(&record(2, b"key2", b"value2"), false).unwrap();
        drop(writer);

        let recovered = WalReader::new(temp.path()).recover(RecoveryMode::Strict).unwrap();
        assert_eq!(recovered.records.len(), 2);
        assert_eq!(recovered.records[0].sequence, 1);
        assert_eq!(recovered.records[1].batch.ops()[0].key(), b"key2");
        assert_eq!(recovered.skipped, 0);
    }

    #[test]
    fn test_each_open_starts_new_segment() {
        let temp = TempDir::new().unwrap();
        let first = WalWriter::new(temp.path()).unwrap().sequence();
        let second = WalWriter::new(temp.path()).unwrap().sequence();
        assert_eq!(second, first + 1);
        assert_eq!(list_segments(temp.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_strict_rejects_and_salvage_skips_corruption() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path()).unwrap();
        let first = record(1, b"good1", b"val1");
        writer.append(&first, false).unwrap();
        writer.append(&record(2, b"bad", b"val2"), false).unwrap();
        writer.append(&record(3, b"good3", b"val3"), false).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        // Flip a payload byte of the second record
        let mut data = std::fs::read(&path).unwrap();
        data[first.len() + HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let reader = WalReader::new(temp.path());
        assert!(reader.recover(RecoveryMode::Strict).unwrap_err().is_corruption());

        let salvaged = reader.recover(RecoveryMode::Salvage).unwrap();
        let keys: Vec<&[u8]> = salvaged.records.iter().map(|r| r.batch.ops()[0].key()).collect();
        assert_eq!(keys, vec![&b"good1"[..], &b"good3"[..]]);
        assert_eq!(salvaged.skipped, 1);
    }

    #[test]
    fn test_damaged_length_mid_segment_is_corruption() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path()).unwrap();
        let first = record(1, b"good1", b"val1");
        writer.append(&first, false).unwrap();
        writer.append(&record(2, b"bad", b"val2"), false).unwrap();
        writer.append(&record(3, b"good3", b"val3"), false).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        // High byte of the second record's length field
        let mut data = std::fs::read(&path).unwrap();
        data[first.len() + 7] = 0x7F;
        std::fs::write(&path, data).unwrap();

        let reader = WalReader::new(temp.path());
        assert!(reader.recover(RecoveryMode::Strict).unwrap_err().is_corruption());

        let salvaged = reader.recover(RecoveryMode::Salvage).unwrap();
        let keys: Vec<&[u8]> = salvaged.records.iter().map(|r| r.batch.ops()[0].key()).collect();
        assert_eq!(keys, vec![&b"good1"[..], &b"good3"[..]]);
        assert_eq!(salvaged.skipped, 1);
    }

    #[test]
    fn test_torn_tail_tolerated_in_strict_mode() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer.append(&record(1, b"complete", b"entry"), true).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        let partial = record(2, b"partial", b"entry");
        data.extend_from_slice(&partial[..partial.len() - 4]);
        std::fs::write(&path, data).unwrap();

        let recovered = WalReader::new(temp.path()).recover(RecoveryMode::Strict).unwrap();
        assert_eq!(recovered.records.len(), 1);
    }

    #[test]
    fn test_rotate_and_remove_old_segments() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer.append(&record(1, b"k", b"v"), false).unwrap();
        let next = writer.rotate().unwrap();
        assert_eq!(writer.current_size(), 0);

        assert_eq!(remove_segments_before(temp.path(), next).unwrap(), 1);
        let left = list_segments(temp.path()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, next);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let reader = WalReader::new(temp.path().join("absent"));
        assert!(reader.recover(RecoveryMode::Strict).unwrap().records.is_empty());
    }
}
