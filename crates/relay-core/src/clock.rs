//! Nanosecond clock used for every timestamp in a record.
//!
//! On Linux, timestamps use `CLOCK_MONOTONIC_RAW` (immune to NTP slew), so all
//! threads in the process stamp against the same monotonic reference.
//! On other platforms, an `Instant`-based fallback is used.

use std::time::Duration;

/// Nanosecond timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant` (other platforms).
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Burn `delay` on the calling thread without yielding it to the scheduler.
pub fn spin_for(delay: Duration) {
    let deadline = now_ns().saturating_add(delay.as_nanos() as u64);
    while now_ns() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_monotonic() {
        let mut prev = now_ns();
        for _ in 0..10_000 {
            let t = now_ns();
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn test_spin_for() {
        let start = now_ns();
        spin_for(Duration::from_micros(100));
        assert!(now_ns() - start >= 100_000);
    }
}
