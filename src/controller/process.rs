//! Process termination and process-list ordering.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::blocking;
use crate::collectors::{ProcessInspector, TermSignal};
use crate::error::ControlError;
use crate::model::{KillOutcome, ProcessRecord, SortColumn};

/// Bounds for one kill: how long to wait after each signal, and how often to
/// check whether the process is gone.
#[derive(Clone, Copy, Debug)]
pub struct KillPolicy {
    pub grace: Duration,
    pub poll: Duration,
}

impl KillPolicy {
    /// Longest a single [`terminate`] call can take: one grace period after
    /// SIGTERM and one after SIGKILL.
    pub fn worst_case(&self) -> Duration {
        self.grace * 2 + self.poll
    }
}

/// pid 0 and 1 and the engine itself are never signalled.
fn is_protected(pid: u32) -> bool {
    pid <= 1 || pid == std::process::id()
}

/// Terminate `pid`: SIGTERM, wait up to the grace period, then SIGKILL and
/// wait again.
///
/// The pid is re-validated first; if `expected_name` is given the process
/// must still carry that name, which guards against pid reuse since the
/// caller last looked. A process that vanishes at any point yields
/// `Ok(KillOutcome::NotFound)` (or `Terminated` once SIGTERM was delivered).
///
/// The call is bounded by [`KillPolicy::worst_case`] and always runs to
/// completion: a process that outlives SIGTERM is sent SIGKILL before this
/// returns. Inspector calls run on the blocking pool.
pub async fn terminate(
    inspector: &Arc<dyn ProcessInspector>,
    pid: u32,
    expected_name: Option<&str>,
    policy: KillPolicy,
) -> Result<KillOutcome, ControlError> {
    if is_protected(pid) {
        return Err(ControlError::Refused(format!("pid {pid} is protected")));
    }
    let lookup = Arc::clone(inspector);
    let Some(name) = blocking(move || Ok(lookup.process_name(pid))).await? else {
        debug!(pid, "kill target already gone");
        return Ok(KillOutcome::NotFound);
    };
    if let Some(expected) = expected_name {
        if name != expected {
            return Err(ControlError::NameMismatch {
                pid,
                expected: expected.to_string(),
                actual: name,
            });
        }
    }

    match send(inspector, pid, TermSignal::Graceful).await {
        Ok(()) => {}
        Err(ControlError::NotFound(_)) => return Ok(KillOutcome::NotFound),
        Err(e) => return Err(e),
    }
    if wait_for_exit(inspector, pid, policy).await? {
        info!(pid, %name, "process terminated");
        return Ok(KillOutcome::Terminated);
    }

    warn!(pid, %name, grace_ms = policy.grace.as_millis() as u64, "still alive after SIGTERM, sending SIGKILL");
    match send(inspector, pid, TermSignal::Forceful).await {
        Ok(()) => {}
        // exited between the last poll and SIGKILL
        Err(ControlError::NotFound(_)) => return Ok(KillOutcome::Terminated),
        Err(e) => return Err(e),
    }
    if wait_for_exit(inspector, pid, policy).await? {
        info!(pid, %name, "process killed");
        Ok(KillOutcome::Killed)
    } else {
        Err(ControlError::Os {
            context: format!("pid {pid}"),
            source: io::Error::other("process survived SIGKILL"),
        })
    }
}

async fn send(
    inspector: &Arc<dyn ProcessInspector>,
    pid: u32,
    signal: TermSignal,
) -> Result<(), ControlError> {
    let inspector = Arc::clone(inspector);
    blocking(move || inspector.signal(pid, signal)).await
}

/// Poll until the process is gone or the grace period runs out.
async fn wait_for_exit(
    inspector: &Arc<dyn ProcessInspector>,
    pid: u32,
    policy: KillPolicy,
) -> Result<bool, ControlError> {
    let deadline = Instant::now() + policy.grace;
    loop {
        let check = Arc::clone(inspector);
        if !blocking(move || Ok(check.is_alive(pid))).await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        sleep(policy.poll.min(deadline - now)).await;
    }
}

/// Sort by the given column, heaviest first, and keep at most `limit` rows.
pub fn top_processes(
    mut records: Vec<ProcessRecord>,
    sort_column: SortColumn,
    limit: usize,
) -> Vec<ProcessRecord> {
    records.sort_by(|a, b| match sort_column {
        SortColumn::Cpu => b
            .cpu_percent
            .partial_cmp(&a.cpu_percent)
            .unwrap_or(std::cmp::Ordering::Equal),
        SortColumn::Memory => b.memory_bytes.cmp(&a.memory_bytes),
    });
    records.truncate(limit);
    records
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Scripted process table. `stubborn` pids ignore SIGTERM; `immortal`
    /// pids ignore everything; `denied` pids refuse all signals.
    #[derive(Default)]
    pub(crate) struct FakeProcesses {
        pub alive: Mutex<HashMap<u32, String>>,
        pub stubborn: Vec<u32>,
        pub immortal: Vec<u32>,
        pub denied: Vec<u32>,
        pub signals: Mutex<Vec<(u32, TermSignal)>>,
    }

    impl FakeProcesses {
        pub(crate) fn with(procs: &[(u32, &str)]) -> Self {
            let fake = Self::default();
            {
                let mut alive = fake.alive.lock().unwrap();
                for (pid, name) in procs {
                    alive.insert(*pid, name.to_string());
                }
            }
            fake
        }
    }

    impl ProcessInspector for FakeProcesses {
        fn list_processes(&self) -> Vec<ProcessRecord> {
            self.alive
                .lock()
                .unwrap()
                .iter()
                .map(|(pid, name)| ProcessRecord {
                    pid: *pid,
                    parent_pid: None,
                    name: name.clone(),
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    memory_bytes: 0,
                    status: "Run".into(),
                })
                .collect()
        }

        fn process_name(&self, pid: u32) -> Option<String> {
            self.alive.lock().unwrap().get(&pid).cloned()
        }

        fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), ControlError> {
            if self.denied.contains(&pid) {
                return Err(ControlError::PermissionDenied(format!("pid {pid}")));
            }
            let mut alive = self.alive.lock().unwrap();
            if !alive.contains_key(&pid) {
                return Err(ControlError::NotFound(format!("pid {pid}")));
            }
            self.signals.lock().unwrap().push((pid, signal));
            let dies = !self.immortal.contains(&pid)
                && (signal == TermSignal::Forceful || !self.stubborn.contains(&pid));
            if dies {
                alive.remove(&pid);
            }
            Ok(())
        }
    }

    fn fast() -> KillPolicy {
        KillPolicy { grace: Duration::from_millis(30), poll: Duration::from_millis(5) }
    }

    fn shared(fake: FakeProcesses) -> (Arc<FakeProcesses>, Arc<dyn ProcessInspector>) {
        let fake = Arc::new(fake);
        let inspector: Arc<dyn ProcessInspector> = fake.clone();
        (fake, inspector)
    }

    #[tokio::test]
    async fn missing_pid_is_not_found() {
        let (fake, inspector) = shared(FakeProcesses::default());
        assert_eq!(terminate(&inspector, 999_999_999, None, fast()).await.unwrap(), KillOutcome::NotFound);
        assert!(fake.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn polite_process_is_terminated() {
        let (fake, inspector) = shared(FakeProcesses::with(&[(500, "worker")]));
        assert_eq!(terminate(&inspector, 500, Some("worker"), fast()).await.unwrap(), KillOutcome::Terminated);
        assert_eq!(*fake.signals.lock().unwrap(), vec![(500, TermSignal::Graceful)]);
    }

    #[tokio::test]
    async fn stubborn_process_escalates() {
        let mut stubborn = FakeProcesses::with(&[(501, "stubborn")]);
        stubborn.stubborn.push(501);
        let (fake, inspector) = shared(stubborn);
        assert_eq!(terminate(&inspector, 501, None, fast()).await.unwrap(), KillOutcome::Killed);
        assert_eq!(
            *fake.signals.lock().unwrap(),
            vec![(501, TermSignal::Graceful), (501, TermSignal::Forceful)]
        );
    }

    #[tokio::test]
    async fn immortal_process_is_an_error_after_sigkill() {
        let mut immortal = FakeProcesses::with(&[(502, "d-state")]);
        immortal.immortal.push(502);
        let (fake, inspector) = shared(immortal);
        let started = Instant::now();
        let err = terminate(&inspector, 502, None, fast()).await.unwrap_err();
        assert!(matches!(err, ControlError::Os { .. }));
        assert_eq!(
            *fake.signals.lock().unwrap(),
            vec![(502, TermSignal::Graceful), (502, TermSignal::Forceful)]
        );
        assert!(started.elapsed() < fast().worst_case() + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn name_mismatch_is_refused_before_signalling() {
        let (fake, inspector) = shared(FakeProcesses::with(&[(503, "postgres")]));
        let err = terminate(&inspector, 503, Some("node"), fast()).await.unwrap_err();
        assert!(matches!(err, ControlError::NameMismatch { pid: 503, .. }));
        assert!(fake.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permission_denied_is_surfaced() {
        let mut denied = FakeProcesses::with(&[(504, "root-owned")]);
        denied.denied.push(504);
        let (_fake, inspector) = shared(denied);
        let err = terminate(&inspector, 504, None, fast()).await.unwrap_err();
        assert!(matches!(err, ControlError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn protected_pids_are_refused() {
        let (_fake, inspector) = shared(FakeProcesses::with(&[(1, "init")]));
        assert!(matches!(terminate(&inspector, 1, None, fast()).await, Err(ControlError::Refused(_))));
        let own = std::process::id();
        assert!(matches!(terminate(&inspector, own, None, fast()).await, Err(ControlError::Refused(_))));
    }

    #[tokio::test]
    async fn concurrent_kills_of_one_pid_both_succeed() {
        let (fake, inspector) = shared(FakeProcesses::with(&[(505, "worker")]));
        let (a, b) = tokio::join!(
            terminate(&inspector, 505, None, fast()),
            terminate(&inspector, 505, None, fast())
        );
        for outcome in [a.unwrap(), b.unwrap()] {
            assert!(matches!(outcome, KillOutcome::Terminated | KillOutcome::NotFound));
        }
        assert!(!fake.is_alive(505));
    }

    #[test]
    fn top_processes_sorts_and_truncates() {
        let rec = |pid: u32, cpu: f32, mem: u64| ProcessRecord {
            pid,
            parent_pid: None,
            name: format!("p{pid}"),
            cpu_percent: cpu,
            memory_percent: 0.0,
            memory_bytes: mem,
            status: "Run".into(),
        };
        let rows = vec![rec(1, 10.0, 300), rec(2, 50.0, 100), rec(3, 30.0, 200)];

        let by_cpu = top_processes(rows.clone(), SortColumn::Cpu, 2);
        assert_eq!(by_cpu.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![2, 3]);

        let by_mem = top_processes(rows, SortColumn::Memory, 10);
        assert_eq!(by_mem.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![1, 3, 2]);
    }
}
