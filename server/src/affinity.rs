//! CPU affinity utilities for pinning worker threads to cores.

/// Pin the current thread to `cpu_id`.
///
/// Uses `sched_setaffinity` on Linux; a no-op elsewhere.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpu_id: usize) -> Result<(), String> {
    use std::mem;

    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);

        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set);
        if result == 0 {
            Ok(())
        } else {
            Err(format!("sched_setaffinity({}) failed: {}", cpu_id, result))
        }
    }
}

/// Pin the current thread to `cpu_id` (no-op off Linux).
#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpu_id: usize) -> Result<(), String> {
    Ok(())
}
