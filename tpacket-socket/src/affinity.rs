use std::io;
use std::mem::size_of;

/// Number of CPUs the process may run on.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Restricts the calling thread to `cpu`.
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu {cpu} is beyond the affinity mask"),
        ));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// CPU worker `id` is pinned to.
pub(crate) fn cpu_for_worker(id: usize) -> usize {
    id % available_cpus()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_current_cpu() {
        // Runs on its own thread so the test harness thread keeps its mask.
        std::thread::spawn(|| {
            let cpu = unsafe { libc::sched_getcpu() };
            assert!(cpu >= 0);
            pin_current_thread(cpu as usize).unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cpu_out_of_mask() {
        assert!(pin_current_thread(libc::CPU_SETSIZE as usize).is_err());
    }

    #[test]
    fn test_worker_cpu_wraps() {
        let cpus = available_cpus();
        assert_eq!(cpu_for_worker(cpus), 0);
        assert_eq!(cpu_for_worker(cpus + 1), 1 % cpus);
    }
}
