use std::sync::Mutex;

use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resident memory of the measuring process.
pub struct ProcessMeter {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMeter {
    pub fn new() -> Self {
        let pid = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                debug!(error = %err, "current pid unavailable; process memory reads as zero");
                None
            }
        };
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing().with_memory()),
        );
        Self {
            pid,
            system: Mutex::new(system),
        }
    }

    /// Resident set size in whole megabytes, or zero when unavailable.
    pub fn resident_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0.0;
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system
            .process(pid)
            .map_or(0.0, |process| (process.memory() as f64 / BYTES_PER_MB).round())
    }
}

impl Default for ProcessMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMeter").field("pid", &self.pid).finish()
    }
}

pub fn logical_cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
