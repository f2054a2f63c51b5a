//! Memory-mapped, append-only record log.
//!
//! One pre-sized file per run, mapped with `memmap2`. A single [`Appender`]
//! writes fixed-size records; any number of [`Tailer`]s read them back in
//! append order without blocking.
//!
//! ## Framing
//! Every entry is an 8-byte header word followed by a body:
//!
//! ```text
//! header == 0                 not written yet (the file is zero-filled)
//! header & COMMITTED          record; low bits = body length in bytes
//! header & PADDING            filler; low bits = bytes to skip to the next header
//! ```
//!
//! Record bodies always start on an [`ALIGN`]-byte boundary. When the next free
//! position would put a body off that boundary the appender first writes a
//! padding entry. The header is stored with `Release` after the body is
//! written and loaded with `Acquire` by tailers, so a tailer that sees a
//! committed header sees the producer's fields.
//!
//! Every word is accessed through `AtomicU64`, which is what lets stages stamp
//! their timestamps into a record in place while other threads read it.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use memmap2::MmapMut;

use crate::record::{RecordLayout, RecordView};

/// Alignment of every record body (one cache line).
pub const ALIGN: usize = 64;

const HEADER: usize = 8;
const PAGE: usize = 4096;
const COMMITTED: u64 = 1 << 63;
const PADDING: u64 = 1 << 62;
const LEN_MASK: u64 = PADDING - 1;

/// How far beyond the write position [`RecordLog::pretouch`] faults pages in.
pub const PRETOUCH_AHEAD: usize = 256 * 1024;

fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// Header position for the next record when the previous entry ended at `pos`.
fn header_pos_after(pos: usize) -> usize {
    round_up(pos + HEADER, ALIGN) - HEADER
}

pub struct RecordLog {
    name: String,
    path: PathBuf,
    base: NonNull<u8>,
    capacity: usize,
    layout: RecordLayout,
    /// End of the last committed entry. Written by the appender, read by the pretoucher.
    write_pos: AtomicUsize,
    /// First page the pretoucher has not touched yet.
    pretouched: AtomicUsize,
    appended: AtomicU64,
    appender_taken: AtomicBool,
    _mmap: MmapMut,
}

// SAFETY: `base` points into `_mmap`, which lives as long as the log and never
// moves. All access through it goes through `AtomicU64`.
unsafe impl Send for RecordLog {}
unsafe impl Sync for RecordLog {}

impl RecordLog {
    /// Bytes of storage needed to hold `records` entries of `layout`.
    pub fn bytes_for(layout: RecordLayout, records: u64) -> usize {
        let stride = round_up(layout.size_bytes() + HEADER, ALIGN);
        round_up(ALIGN + stride * records as usize, PAGE)
    }

    /// Create `<dir>/<name>.log` with room for `capacity` bytes and map it.
    /// Fails if the file already exists.
    pub fn create(dir: &Path, name: &str, layout: RecordLayout, capacity: usize) -> Result<Self> {
        let capacity = round_up(capacity.max(PAGE), PAGE);
        let path = dir.join(format!("{}.log", name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create log file: {}", path.display()))?;
        file.set_len(capacity as u64)
            .with_context(|| format!("failed to size log file {} to {} bytes", path.display(), capacity))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("failed to map log file: {}", path.display()))?;
        let base = NonNull::new(mmap.as_mut_ptr()).context("log mapping returned a null pointer")?;

        tracing::debug!(log = name, path = %path.display(), capacity, "log created");

        Ok(Self {
            name: name.to_string(),
            path,
            base,
            capacity,
            layout,
            write_pos: AtomicUsize::new(0),
            pretouched: AtomicUsize::new(0),
            appended: AtomicU64::new(0),
            appender_taken: AtomicBool::new(false),
            _mmap: mmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Number of records committed so far.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Acquire)
    }

    /// The single appender for this log. Fails if one is already live.
    pub fn appender(&self) -> Result<Appender<'_>> {
        if self
            .appender_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            anyhow::bail!("log {} already has an appender", self.name);
        }
        Ok(Appender { log: self, pos: 0, next_index: 0 })
    }

    /// A new cursor positioned at the first record.
    pub fn tail(&self) -> Tailer<'_> {
        Tailer { log: self, pos: 0, next_index: 0 }
    }

    /// Write-fault every page from the last pretouched one up to
    /// [`PRETOUCH_AHEAD`] bytes past the write position. Returns the number of
    /// pages touched.
    ///
    /// A touch is an atomic `fetch_add(0)` on the page's first word, so it
    /// never changes what the appender or a tailer sees.
    pub fn pretouch(&self) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let target = (write_pos + PRETOUCH_AHEAD).min(self.capacity);
        let mut page = self
            .pretouched
            .load(Ordering::Relaxed)
            .max(write_pos / PAGE * PAGE);
        let mut touched = 0;
        while page < target {
            self.word(page).fetch_add(0, Ordering::Relaxed);
            page += PAGE;
            touched += 1;
        }
        self.pretouched.store(page, Ordering::Relaxed);
        touched
    }

    #[inline]
    fn word(&self, pos: usize) -> &AtomicU64 {
        debug_assert!(pos % 8 == 0 && pos + 8 <= self.capacity);
        // SAFETY: in bounds of the mapping, 8-byte aligned (the mapping is page
        // aligned and every position is a multiple of 8).
        unsafe { &*(self.base.as_ptr().add(pos) as *const AtomicU64) }
    }

    #[inline]
    fn words(&self, pos: usize, len: usize) -> &[AtomicU64] {
        debug_assert!(pos % 8 == 0 && pos + len * 8 <= self.capacity);
        // SAFETY: as for `word`, for `len` consecutive words.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(pos) as *const AtomicU64, len) }
    }
}

impl std::fmt::Debug for RecordLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLog")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("appended", &self.appended())
            .finish()
    }
}

/// Single writer for a [`RecordLog`].
pub struct Appender<'a> {
    log: &'a RecordLog,
    pos: usize,
    next_index: u64,
}

impl<'a> Appender<'a> {
    /// Reserve the next record, let `fill` write it in place, then commit it.
    /// Returns the record's index.
    pub fn append_with<F>(&mut self, fill: F) -> Result<u64>
    where
        F: FnOnce(&RecordView<'a>),
    {
        let log = self.log;
        let len = log.layout.size_bytes();
        let header = header_pos_after(self.pos);
        let body = header + HEADER;
        if body + len > log.capacity {
            anyhow::bail!(
                "log {} is full: record {} needs {} bytes at offset {}, capacity is {}",
                log.name,
                self.next_index,
                len,
                body,
                log.capacity
            );
        }

        let view = RecordView::new(log.words(body, log.layout.words()));
        fill(&view);

        if header != self.pos {
            log.word(self.pos)
                .store(PADDING | (header - self.pos) as u64, Ordering::Release);
        }
        log.word(header).store(COMMITTED | len as u64, Ordering::Release);

        self.pos = body + len;
        log.write_pos.store(self.pos, Ordering::Relaxed);
        log.appended.store(self.next_index + 1, Ordering::Release);

        let index = self.next_index;
        self.next_index += 1;
        Ok(index)
    }

    /// Append a record whose words are copied from `words`
    /// (`[remaining, ts0, ts1, ..]`). Missing trailing words stay zero.
    pub fn append(&mut self, words: &[u64]) -> Result<u64> {
        let expected = self.log.layout.words();
        if words.len() > expected {
            anyhow::bail!("record has {} words, layout holds {}", words.len(), expected);
        }
        self.append_with(|view| {
            if let Some((&remaining, stamps)) = words.split_first() {
                view.set_remaining(remaining as i64);
                for (slot, &ns) in stamps.iter().enumerate() {
                    view.stamp(slot, ns);
                }
            }
        })
    }
}

impl Drop for Appender<'_> {
    fn drop(&mut self) {
        self.log.appender_taken.store(false, Ordering::Release);
    }
}

/// A record read from the log together with its index.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    index: u64,
    record: RecordView<'a>,
}

impl<'a> Entry<'a> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn record(&self) -> RecordView<'a> {
        self.record
    }
}

/// Independent non-blocking read cursor.
pub struct Tailer<'a> {
    log: &'a RecordLog,
    pos: usize,
    next_index: u64,
}

impl<'a> Tailer<'a> {
    /// Index of the record the next successful [`next`](Self::next) returns.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// The next record, or `None` if the appender has not committed it yet.
    pub fn next(&mut self) -> Option<Entry<'a>> {
        let log = self.log;
        loop {
            if self.pos + HEADER > log.capacity {
                return None;
            }
            let header = log.word(self.pos).load(Ordering::Acquire);
            if header == 0 {
                return None;
            }
            if header & PADDING != 0 {
                self.pos += (header & LEN_MASK) as usize;
                continue;
            }
            debug_assert!(header & COMMITTED != 0);
            let len = (header & LEN_MASK) as usize;
            let body = self.pos + HEADER;
            let entry = Entry {
                index: self.next_index,
                record: RecordView::new(log.words(body, len / 8)),
            };
            self.pos = body + len;
            self.next_index += 1;
            return Some(entry);
        }
    }

    /// Reposition so the next read returns record `index`. Fails if the log
    /// has not committed that record yet.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        if index < self.next_index {
            self.pos = 0;
            self.next_index = 0;
        }
        while self.next_index < index {
            if self.next().is_none() {
                anyhow::bail!(
                    "cannot seek log {} to index {}: only {} records committed",
                    self.log.name,
                    index,
                    self.next_index
                );
            }
        }
        Ok(())
    }
}
