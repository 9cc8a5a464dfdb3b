use std::sync::{Mutex, MutexGuard, PoisonError};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use super::{ProcessInspector, TermSignal};
use crate::error::ControlError;
use crate::model::ProcessRecord;

/// Process table through `sysinfo`, signals through `kill(2)` on unix.
///
/// The `table` System is kept between enumerations so per-process CPU usage
/// is measured over the time since the previous one. Single-pid lookups go
/// through a separate `lookup` System, so a kill polling for exit never
/// queues behind a full-table refresh.
pub struct SysinfoProcesses {
    table: Mutex<System>,
    lookup: Mutex<System>,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        let mut table = System::new();
        table.refresh_memory();
        table.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());
        Self { table: Mutex::new(table), lookup: Mutex::new(System::new()) }
    }

    /// Refresh one pid in the lookup System and hand it back locked.
    fn looked_up(&self, target: Pid) -> MutexGuard<'_, System> {
        let mut sys = relock(&self.lookup);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        sys
    }
}

/// A panic mid-refresh leaves the System stale, not invalid.
fn relock(sys: &Mutex<System>) -> MutexGuard<'_, System> {
    sys.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for SysinfoProcesses {
    fn default() -> Self {
        Self::new()
    }
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing().with_cpu().with_memory()
}

fn is_gone(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

impl ProcessInspector for SysinfoProcesses {
    fn list_processes(&self) -> Vec<ProcessRecord> {
        let mut sys = relock(&self.table);
        sys.refresh_memory();
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());

        let total_memory = sys.total_memory();
        let mut records: Vec<ProcessRecord> = sys
            .processes()
            .values()
            .filter(|p| !is_gone(p.status()))
            .map(|p| {
                let memory_percent = if total_memory > 0 {
                    (p.memory() as f64 / total_memory as f64 * 100.0) as f32
                } else {
                    0.0
                };
                ProcessRecord {
                    pid: p.pid().as_u32(),
                    parent_pid: p.parent().map(|pp| pp.as_u32()),
                    name: p.name().to_string_lossy().into_owned(),
                    cpu_percent: p.cpu_usage(),
                    memory_percent,
                    memory_bytes: p.memory(),
                    status: p.status().to_string(),
                }
            })
            .collect();
        records.sort_by_key(|r| r.pid);
        records
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let target = Pid::from_u32(pid);
        self.looked_up(target)
            .process(target)
            .filter(|p| !is_gone(p.status()))
            .map(|p| p.name().to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), ControlError> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid as NixPid;

        let raw = i32::try_from(pid).map_err(|_| ControlError::NotFound(format!("pid {pid}")))?;
        let sig = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forceful => Signal::SIGKILL,
        };
        kill(NixPid::from_raw(raw), sig).map_err(|e| ControlError::from_errno(format!("pid {pid}"), e))
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), ControlError> {
        use sysinfo::Signal;

        let target = Pid::from_u32(pid);
        let sys = self.looked_up(target);
        let process = sys
            .process(target)
            .ok_or_else(|| ControlError::NotFound(format!("pid {pid}")))?;
        let delivered = match signal {
            TermSignal::Graceful => process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()),
            TermSignal::Forceful => process.kill(),
        };
        if delivered {
            Ok(())
        } else {
            Err(ControlError::PermissionDenied(format!("pid {pid}")))
        }
    }
}
