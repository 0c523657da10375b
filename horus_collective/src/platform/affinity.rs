//! Core pinning and CPU topology lookups.

use std::io;

/// Pin the calling thread to `cpu`.
///
/// # Arguments
/// * `cpu` - The CPU core index to pin to (0-indexed)
///
/// # Returns
/// * `Ok(())` - Thread was successfully pinned to the specified core
/// * `Err(io::Error)` - Failed to pin (invalid CPU, permission denied, etc.)
#[cfg(target_os = "linux")]
pub fn pin_thread_to_core(cpu: usize) -> Result<(), io::Error> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("CPU {} exceeds the affinity mask size", cpu),
        ));
    }

    // SAFETY: CPU_SET manipulation and sched_setaffinity are safe libc calls
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu, &mut cpuset);

        let result = libc::sched_setaffinity(
            0, // 0 = current thread
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_thread_to_core(_cpu: usize) -> Result<(), io::Error> {
    // No affinity API; nodes run unpinned
    Ok(())
}

/// Cores this process may run on, in ascending order.
#[cfg(target_os = "linux")]
pub fn available_cpus() -> Vec<usize> {
    // SAFETY: sched_getaffinity fills a zeroed cpu_set_t we own
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut cpuset) != 0 {
            return fallback_cpus();
        }
        let cpus: Vec<usize> = (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &cpuset))
            .collect();
        if cpus.is_empty() {
            fallback_cpus()
        } else {
            cpus
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn available_cpus() -> Vec<usize> {
    fallback_cpus()
}

fn fallback_cpus() -> Vec<usize> {
    let count = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (0..count).collect()
}

/// NUMA node hosting `cpu`, or 0 when the machine exposes no NUMA layout.
#[cfg(target_os = "linux")]
pub fn numa_node_of_cpu(cpu: usize) -> usize {
    let dir = format!("/sys/devices/system/cpu/cpu{}", cpu);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|id| id.parse::<usize>().ok())
        })
        .next()
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn numa_node_of_cpu(_cpu: usize) -> usize {
    0
}
