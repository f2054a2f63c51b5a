//! Optional CPU pinning for worker threads.

/// Core ids at or above this cannot be expressed in a `cpu_set_t`.
#[cfg(target_os = "linux")]
pub const MAX_CORE_ID: usize = libc::CPU_SETSIZE as usize;
#[cfg(not(target_os = "linux"))]
pub const MAX_CORE_ID: usize = usize::MAX;

/// Pin the calling thread to `core_id`. Best effort: failures are logged, not fatal.
pub fn pin_to_core(core_id: usize) {
    if core_id >= MAX_CORE_ID {
        tracing::warn!(core_id, max = MAX_CORE_ID, "core id out of range; not pinning");
        return;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(
                core_id,
                err = %std::io::Error::last_os_error(),
                "failed to pin thread"
            );
        }
    }
}
