//! Stage gates: durable, named completion counters.
//!
//! Each gate is a single `AtomicI64` living in its own memory-mapped file
//! (`<id>.gate`) inside the run directory. The owning stage publishes the index
//! of the last record it finished with a `Release` store; the next stage reads
//! it with an `Acquire` load. A stage stamps its timestamp before publishing,
//! so anything that observes `gate >= i` also observes that stage's timestamp
//! on record `i`.
//!
//! Index convention: log indices start at 0 and a fresh gate holds
//! [`NOTHING_COMPLETED`] (-1). A gate value `v` means every record with index
//! `<= v` has been completed by that stage.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use memmap2::MmapMut;

/// Value of a gate whose stage has not completed any record yet.
pub const NOTHING_COMPLETED: i64 = -1;

/// Gate id used by stage `stage` (1-based).
pub fn stage_gate_id(stage: usize) -> String {
    format!("stage-{}", stage)
}

pub struct Gate {
    id: String,
    counter: NonNull<AtomicI64>,
    _mmap: MmapMut,
}

// SAFETY: `counter` points into `_mmap`, which the gate owns and never remaps.
// The only access is through `AtomicI64`.
unsafe impl Send for Gate {}
unsafe impl Sync for Gate {}

impl Gate {
    /// Create (or truncate) `<dir>/<id>.gate` and reset it to [`NOTHING_COMPLETED`].
    fn create(dir: &Path, id: &str) -> Result<Self> {
        let path = gate_path(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create gate file: {}", path.display()))?;
        file.set_len(8)
            .with_context(|| format!("failed to size gate file: {}", path.display()))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("failed to map gate file: {}", path.display()))?;
        let counter = NonNull::new(mmap.as_mut_ptr() as *mut AtomicI64)
            .context("gate mapping returned a null pointer")?;

        let gate = Self { id: id.to_string(), counter, _mmap: mmap };
        gate.counter().store(NOTHING_COMPLETED, Ordering::Release);
        Ok(gate)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    fn counter(&self) -> &AtomicI64 {
        // SAFETY: the mapping is page aligned and at least 8 bytes long.
        unsafe { self.counter.as_ref() }
    }

    /// Publish `index` as the last completed record. Only the owning stage calls this.
    #[inline]
    pub fn publish(&self, index: i64) {
        debug_assert!(
            index >= self.counter().load(Ordering::Relaxed),
            "gate {} moved backwards",
            self.id
        );
        self.counter().store(index, Ordering::Release);
    }

    #[inline]
    pub fn read_acquire(&self) -> i64 {
        self.counter().load(Ordering::Acquire)
    }

    /// True once the stage behind this gate has completed record `index`.
    #[inline]
    pub fn has_completed(&self, index: u64) -> bool {
        self.read_acquire() >= index as i64
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("id", &self.id)
            .field("value", &self.read_acquire())
            .finish()
    }
}

fn gate_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.gate", id))
}

/// Opens gates by string id. The same id always yields the same counter for
/// the lifetime of the registry; the first open creates it.
pub struct GateRegistry {
    dir: PathBuf,
    gates: DashMap<String, Arc<Gate>>,
}

impl GateRegistry {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), gates: DashMap::new() }
    }

    pub fn open(&self, id: &str) -> Result<Arc<Gate>> {
        match self.gates.entry(id.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let gate = Arc::new(Gate::create(&self.dir, id)?);
                tracing::debug!(gate = id, "gate created");
                e.insert(gate.clone());
                Ok(gate)
            }
        }
    }

    pub fn publish(&self, id: &str, index: i64) -> Result<()> {
        self.open(id)?.publish(index);
        Ok(())
    }

    pub fn read_acquire(&self, id: &str) -> Result<i64> {
        Ok(self.open(id)?.read_acquire())
    }

    /// Current value of every gate opened so far, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut values: Vec<(String, i64)> = self
            .gates
            .iter()
            .map(|g| (g.key().clone(), g.value().read_acquire()))
            .collect();
        values.sort();
        values
    }
}
