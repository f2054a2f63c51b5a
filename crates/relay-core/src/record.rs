//! Fixed-size relay record and its in-place view.
//!
//! A record is a run of 64-bit words inside the log's mapped storage:
//!
//! ```text
//! word 0        remaining    (i64, set once by the producer)
//! word 1        timestamps[0] production time (ns)
//! word 1 + s    timestamps[s] completion time of stage s (ns)
//! ```
//!
//! [`RecordView`] reads and writes those words where they live. Every word is
//! an `AtomicU64` accessed with `Relaxed` ordering; cross-thread visibility is
//! established by the log's commit header and the stage gates, not here.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use anyhow::Result;

/// Largest stage count a record can carry timestamps for.
pub const MAX_STAGES: usize = 62;

const REMAINING: usize = 0;
const TIMESTAMPS: usize = 1;

/// Shape of the records in one run: how many stage timestamps each carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    stages: usize,
}

impl RecordLayout {
    pub fn new(stages: usize) -> Result<Self> {
        if stages == 0 {
            anyhow::bail!("a record needs at least one stage");
        }
        if stages > MAX_STAGES {
            anyhow::bail!("{} stages requested; records hold at most {}", stages, MAX_STAGES);
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    /// Words per record: `remaining` plus one timestamp per stage plus the producer's.
    pub fn words(&self) -> usize {
        TIMESTAMPS + self.stages + 1
    }

    pub fn size_bytes(&self) -> usize {
        self.words() * 8
    }
}

/// Flyweight over one record's words in the log.
#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    words: &'a [AtomicU64],
}

impl<'a> RecordView<'a> {
    pub(crate) fn new(words: &'a [AtomicU64]) -> Self {
        debug_assert!(words.len() > TIMESTAMPS + 1);
        Self { words }
    }

    /// Number of stage timestamps (excluding the production slot).
    pub fn stages(&self) -> usize {
        self.words.len() - TIMESTAMPS - 1
    }

    /// Records the producer still had to write after this one.
    #[inline]
    pub fn remaining(&self) -> i64 {
        self.words[REMAINING].load(Relaxed) as i64
    }

    #[inline]
    pub fn set_remaining(&self, remaining: i64) {
        self.words[REMAINING].store(remaining as u64, Relaxed);
    }

    /// True for the final record of a run.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.remaining() == 0
    }

    /// Timestamp in `slot` (0 = production, s = stage s); 0 if not yet written.
    #[inline]
    pub fn timestamp(&self, slot: usize) -> u64 {
        self.words[TIMESTAMPS + slot].load(Relaxed)
    }

    #[inline]
    pub fn stamp(&self, slot: usize, ns: u64) {
        self.words[TIMESTAMPS + slot].store(ns, Relaxed);
    }

    /// Final stage completion minus production time.
    #[inline]
    pub fn latency_ns(&self) -> i64 {
        self.timestamp(self.stages()) as i64 - self.timestamp(0) as i64
    }

    /// Time between stage `slot - 1` and stage `slot` finishing this record.
    #[inline]
    pub fn hop_ns(&self, slot: usize) -> i64 {
        self.timestamp(slot) as i64 - self.timestamp(slot - 1) as i64
    }

    /// True once every slot, production included, carries a timestamp.
    pub fn is_complete(&self) -> bool {
        (0..=self.stages()).all(|slot| self.timestamp(slot) != 0)
    }

    #[cfg(test)]
    pub(crate) fn words_ptr(&self) -> *const AtomicU64 {
        self.words.as_ptr()
    }
}

impl std::fmt::Debug for RecordView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stamps: Vec<u64> = (0..=self.stages()).map(|s| self.timestamp(s)).collect();
        f.debug_struct("RecordView")
            .field("remaining", &self.remaining())
            .field("timestamps", &stamps)
            .finish()
    }
}
