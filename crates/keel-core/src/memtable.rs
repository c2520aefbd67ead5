//! Sequence-numbered multi-version memtable
//!
//! The whole key space lives in RAM, ordered bytewise. Every key maps to its
//! version chain in ascending sequence order; a version with no value is a
//! deletion. A read at sequence `s` sees, per key, the newest version whose
//! sequence is `<= s`.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::batch::{BatchOp, WriteBatch};

/// Bookkeeping bytes charged per version on top of key and value
const VERSION_OVERHEAD: usize = 32;

#[derive(Debug, Clone)]
struct Version {
    sequence: u64,
    value: Option<Vec<u8>>,
    crc: u32,
}

impl Version {
    fn charge(&self) -> usize {
        VERSION_OVERHEAD + self.value.as_ref().map_or(0, Vec::len)
    }
}

/// A value visible at some sequence, with the checksum taken when it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visible {
    pub value: Vec<u8>,
    pub crc: u32,
}

impl Visible {
    /// Recompute the value checksum and compare it with the stored one.
    pub fn verify(&self) -> bool {
        crc32c::crc32c(&self.value) == self.crc
    }
}

#[derive(Debug, Default)]
pub struct MemTable {
    map: BTreeMap<Vec<u8>, Vec<Version>>,
    last_sequence: u64,
    approximate_bytes: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the newest applied mutation.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Move the sequence counter forward; it never goes back.
    pub fn advance_sequence(&mut self, sequence: u64) {
        self.last_sequence = self.last_sequence.max(sequence);
    }

    fn push(&mut self, key: &[u8], version: Version) {
        self.approximate_bytes += version.charge();
        match self.map.get_mut(key) {
            Some(chain) => chain.push(version),
            None => {
                self.approximate_bytes += key.len();
                self.map.insert(key.to_vec(), vec![version]);
            }
        }
    }

    /// Apply every op of `batch`, numbering them from `first_sequence`.
    pub fn apply(&mut self, first_sequence: u64, batch: &WriteBatch) {
        for (i, op) in batch.ops().iter().enumerate() {
            let sequence = first_sequence + i as u64;
            let version = match op {
                BatchOp::Put { value, .. } => Version {
                    sequence,
                    crc: crc32c::crc32c(value),
                    value: Some(value.clone()),
                },
                BatchOp::Delete { .. } => Version { sequence, value: None, crc: 0 },
            };
            self.push(op.key(), version);
            self.last_sequence = self.last_sequence.max(sequence);
        }
    }

    /// Load one live entry recovered from a table at `sequence`.
    pub fn load(&mut self, sequence: u64, key: &[u8], value: Vec<u8>) {
        let crc = crc32c::crc32c(&value);
        self.push(key, Version { sequence, value: Some(value), crc });
        self.last_sequence = self.last_sequence.max(sequence);
    }

    fn visible_in(chain: &[Version], sequence: u64) -> Option<&Version> {
        chain.iter().rev().find(|v| v.sequence <= sequence)
    }

    pub fn get(&self, key: &[u8], sequence: u64) -> Option<Visible> {
        let chain = self.map.get(key)?;
        let version = Self::visible_in(chain, sequence)?;
        version.value.as_ref().map(|value| Visible { value: value.clone(), crc: version.crc })
    }

    /// First key after `from` with a live value at `sequence`.
    pub fn next_visible(&self, from: Bound<&[u8]>, sequence: u64) -> Option<(Vec<u8>, Visible)> {
        self.map
            .range::<[u8], _>((from, Bound::Unbounded))
            .find_map(|(key, chain)| {
                let version = Self::visible_in(chain, sequence)?;
                let value = version.value.as_ref()?;
                Some((key.clone(), Visible { value: value.clone(), crc: version.crc }))
            })
    }

    /// Every live (key, value) at `sequence`, in key order.
    pub fn live_entries(&self, sequence: u64) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.map.iter().filter_map(move |(key, chain)| {
            let value = Self::visible_in(chain, sequence)?.value.as_ref()?;
            Some((key.as_slice(), value.as_slice()))
        })
    }

    /// Count of keys with a live value at `sequence`.
    pub fn live_count(&self, sequence: u64) -> usize {
        self.live_entries(sequence).count()
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_bytes
    }

    /// Drop versions no reader can see any more, for keys in `[start, limit)`.
    ///
    /// A version is kept while some pinned sequence `s` (a live snapshot, or
    /// the current last sequence) lies in `[version.sequence, next.sequence)`.
    /// A key left with deletions only is removed altogether.
    pub fn prune(&mut self, start: Option<&[u8]>, limit: Option<&[u8]>, pinned: &[u64]) -> usize {
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = limit.map_or(Bound::Unbounded, Bound::Excluded);
        if let (Some(start), Some(limit)) = (start, limit) {
            if start >= limit {
                return 0;
            }
        }

        let mut pins: Vec<u64> = pinned.to_vec();
        pins.push(self.last_sequence);
        pins.sort_unstable();

        let mut removed_versions = 0;
        let mut freed = 0;
        let mut empty_keys = Vec::new();
        for (key, chain) in self.map.range_mut::<[u8], _>((lower, upper)) {
            let before = chain.len();
            let mut kept = Vec::with_capacity(before);
            for (i, version) in chain.iter().enumerate() {
                let next = chain.get(i + 1).map_or(u64::MAX, |v| v.sequence);
                let needed = pins.iter().any(|&s| version.sequence <= s && s < next);
                if needed {
                    kept.push(version.clone());
                } else {
                    freed += version.charge();
                }
            }
            if kept.iter().all(|v| v.value.is_none()) {
                freed += kept.iter().map(Version::charge).sum::<usize>() + key.len();
                removed_versions += before;
                empty_keys.push(key.clone());
            } else {
                removed_versions += before - kept.len();
                *chain = kept;
            }
        }
        for key in empty_keys {
            self.map.remove(&key);
        }
        self.approximate_bytes = self.approximate_bytes.saturating_sub(freed);
        removed_versions
    }
}
