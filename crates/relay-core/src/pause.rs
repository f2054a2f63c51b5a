//! Pause primitives for the busy-wait polling loops.
//!
//! Every wait in the pipeline (producer pacing, tailer "none yet", upstream
//! gate not yet advanced) is a poll loop that calls [`PauseStrategy::pause`]
//! after each unsuccessful poll and [`PauseStrategy::reset`] after a
//! successful one. None of the strategies sleep.
//!
//! | Strategy   | Behaviour                                        | Gives up                     |
//! |------------|--------------------------------------------------|------------------------------|
//! | `BusySpin` | `spin_loop` hint only                            | never                        |
//! | `Yielding` | spin, then `yield_now` (crossbeam `Backoff`)     | never                        |
//! | `Bounded`  | `spin_loop` hint                                 | after N consecutive polls    |
//! | `Deadline` | `Backoff` snooze                                 | after a wall-clock stall     |

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use crossbeam_utils::Backoff;

use crate::clock::now_ns;

/// A per-thread pause policy. Each worker thread owns its own clone.
pub trait PauseStrategy: Clone + Send + 'static {
    /// Called after an unsuccessful poll. Returns an error when the caller
    /// should stop waiting.
    fn pause(&mut self) -> Result<()>;

    /// Called after a successful poll.
    fn reset(&mut self) {}
}

/// Call `attempt` until it yields a value, pausing between failures.
///
/// Gives up with an error when `abort` is raised or when `pause` refuses to
/// wait any longer.
#[inline]
pub fn poll<P, T, F>(pause: &mut P, abort: &AtomicBool, mut attempt: F) -> Result<T>
where
    P: PauseStrategy,
    F: FnMut() -> Option<T>,
{
    loop {
        if let Some(value) = attempt() {
            pause.reset();
            return Ok(value);
        }
        if abort.load(Ordering::Relaxed) {
            anyhow::bail!("run aborted");
        }
        pause.pause()?;
    }
}

/// Pure spin. Lowest wake-up latency, burns a full core.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusySpin;

impl PauseStrategy for BusySpin {
    #[inline]
    fn pause(&mut self) -> Result<()> {
        std::hint::spin_loop();
        Ok(())
    }
}

/// Exponential spin that degrades to `thread::yield_now` once the wait gets long.
#[derive(Debug, Default)]
pub struct Yielding {
    backoff: Backoff,
}

impl Clone for Yielding {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl PauseStrategy for Yielding {
    #[inline]
    fn pause(&mut self) -> Result<()> {
        self.backoff.snooze();
        Ok(())
    }

    #[inline]
    fn reset(&mut self) {
        self.backoff.reset();
    }
}

/// Fails after `max_polls` consecutive unsuccessful polls.
///
/// Used by tests so that a broken protocol shows up as an error instead of a
/// hung CI job.
#[derive(Debug, Clone)]
pub struct Bounded {
    max_polls: u64,
    polls: u64,
}

impl Bounded {
    pub fn new(max_polls: u64) -> Self {
        Self { max_polls, polls: 0 }
    }
}

impl PauseStrategy for Bounded {
    #[inline]
    fn pause(&mut self) -> Result<()> {
        self.polls += 1;
        if self.polls > self.max_polls {
            anyhow::bail!("no progress after {} consecutive polls", self.max_polls);
        }
        std::hint::spin_loop();
        Ok(())
    }

    #[inline]
    fn reset(&mut self) {
        self.polls = 0;
    }
}

/// Fails once a single wait has lasted longer than `timeout`.
#[derive(Debug)]
pub struct Deadline {
    timeout_ns: u64,
    waiting_since_ns: Option<u64>,
    backoff: Backoff,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_ns: timeout.as_nanos() as u64,
            waiting_since_ns: None,
            backoff: Backoff::new(),
        }
    }
}

impl Clone for Deadline {
    fn clone(&self) -> Self {
        Self {
            timeout_ns: self.timeout_ns,
            waiting_since_ns: None,
            backoff: Backoff::new(),
        }
    }
}

impl PauseStrategy for Deadline {
    fn pause(&mut self) -> Result<()> {
        let now = now_ns();
        let since = *self.waiting_since_ns.get_or_insert(now);
        if now.saturating_sub(since) > self.timeout_ns {
            anyhow::bail!(
                "stalled for more than {} ms",
                self.timeout_ns / 1_000_000
            );
        }
        self.backoff.snooze();
        Ok(())
    }

    fn reset(&mut self) {
        self.waiting_since_ns = None;
        self.backoff.reset();
    }
}
