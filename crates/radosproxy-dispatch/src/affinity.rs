//! Worker core selection and pinning

use radosproxy_common::{Error, Result};

/// Cores left for workers after the first `reserved` cores of `cores` go to
/// the messenger. When the reservation would take every core, workers share
/// the whole list.
#[must_use]
pub fn worker_cores(cores: &[usize], reserved: usize) -> Vec<usize> {
    if reserved >= cores.len() {
        cores.to_vec()
    } else {
        cores[reserved..].to_vec()
    }
}

/// Core for worker `index`, cycling through `cores`
#[must_use]
pub fn core_for(cores: &[usize], index: usize) -> Option<usize> {
    if cores.is_empty() {
        None
    } else {
        Some(cores[index % cores.len()])
    }
}

/// Pin the calling thread to `core`
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(core)
        .map_err(|e| Error::invalid_argument(format!("core {core}: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| Error::cluster(format!("sched_setaffinity core {core}"), -(e as i32)))
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(core: usize) -> Result<()> {
    Err(Error::NotSupported(format!("thread pinning to core {core}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_cores_skip_messenger_prefix() {
        let cores = [26, 27, 28, 29];
        assert_eq!(worker_cores(&cores, 3), vec![29]);
        assert_eq!(worker_cores(&cores, 0), vec![26, 27, 28, 29]);
        assert_eq!(worker_cores(&cores, 4), vec![26, 27, 28, 29]);
        assert_eq!(worker_cores(&cores, 9), vec![26, 27, 28, 29]);
    }

    #[test]
    fn test_core_for_cycles() {
        assert_eq!(core_for(&[29], 3), Some(29));
        assert_eq!(core_for(&[1, 2], 3), Some(2));
        assert_eq!(core_for(&[], 0), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_rejects_out_of_range_core() {
        assert!(pin_current_thread(usize::MAX).is_err());
    }
}
