//! Port availability checks and bind-conflict resolution.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::process::{KillPolicy, terminate};
use crate::collectors::{NetworkInspector, PortProbe, ProcessInspector};
use crate::error::{ControlError, ErrorClass};
use crate::model::{KillOutcome, PortProbeResult, Protocol};

/// How to resolve a request for a port that may already be bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum PortPolicy {
    /// The requested port or nothing.
    Strict,
    /// The first free port at or above the requested one.
    AutoPort,
    /// Kill whoever holds the requested port, then hand it out.
    KillPort,
    /// Report the state of every port in `low..=high`; changes nothing.
    ScanRange { low: u16, high: u16 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "resolution")]
pub enum PortResolution {
    Available { port: u16 },
    Freed { port: u16, report: FreePortReport },
    Scanned { ports: Vec<PortProbeResult> },
}

impl PortResolution {
    /// The port the caller may bind, if the policy produced one.
    pub fn port(&self) -> Option<u16> {
        match self {
            PortResolution::Available { port } | PortResolution::Freed { port, .. } => Some(*port),
            PortResolution::Scanned { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PidOutcome {
    pub pid: u32,
    pub outcome: KillOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PidFailure {
    pub pid: u32,
    pub class: ErrorClass,
    pub error: String,
}

/// Per-owner results of killing everything bound to a port.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FreePortReport {
    pub port: u16,
    pub killed: Vec<PidOutcome>,
    pub failed: Vec<PidFailure>,
}

#[derive(Clone, Copy, Debug)]
pub struct PortSettings {
    pub max_attempts: u16,
    pub settle_delay: Duration,
    pub kill_retries: u32,
    pub max_scan_range: u32,
    pub kill: KillPolicy,
    /// Total time a killing resolution may spend. Owners that no longer fit
    /// in what is left are reported as failed instead of signalled.
    pub time_budget: Duration,
}

/// Which TCP ports the socket table says are listened on, and by whom.
/// `readable` is false when the table could not be read at all.
///
/// Only TCP listeners count: the bind check is a TCP bind, so a UDP socket on
/// the same number neither blocks it nor is an owner to kill.
struct PortTable {
    held: HashMap<u16, BTreeSet<u32>>,
    readable: bool,
}

impl PortTable {
    fn load(network: &dyn NetworkInspector) -> Self {
        match network.list_connections() {
            Ok(conns) => {
                let mut held: HashMap<u16, BTreeSet<u32>> = HashMap::new();
                let listeners = conns
                    .iter()
                    .filter(|c| c.protocol == Protocol::Tcp && c.holds_port(c.local_port));
                for c in listeners {
                    let owners = held.entry(c.local_port).or_default();
                    if let Some(pid) = c.owning_pid {
                        owners.insert(pid);
                    }
                }
                Self { held, readable: true }
            }
            Err(e) => {
                debug!(error = %e, "socket table unavailable, owners unknown");
                Self { held: HashMap::new(), readable: false }
            }
        }
    }

    fn owners(&self, port: u16) -> Vec<u32> {
        self.held.get(&port).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }
}

pub struct PortResolver<'a> {
    probe: &'a dyn PortProbe,
    network: &'a dyn NetworkInspector,
    processes: Arc<dyn ProcessInspector>,
    settings: PortSettings,
}

impl<'a> PortResolver<'a> {
    pub fn new(
        probe: &'a dyn PortProbe,
        network: &'a dyn NetworkInspector,
        processes: Arc<dyn ProcessInspector>,
        settings: PortSettings,
    ) -> Self {
        Self { probe, network, processes, settings }
    }

    /// Resolve `port` under `policy`. `ScanRange` carries its own bounds and
    /// ignores `port`; [`PortResolver::scan_range`] is the direct form.
    pub async fn resolve(&self, port: u16, policy: PortPolicy) -> Result<PortResolution, ControlError> {
        let resolution = match policy {
            PortPolicy::Strict => self.strict(port),
            PortPolicy::AutoPort => self.auto_port(port),
            PortPolicy::KillPort => self.kill_port(port).await,
            PortPolicy::ScanRange { low, high } => {
                return self.scan_range(low, high).map(|ports| PortResolution::Scanned { ports });
            }
        };
        match &resolution {
            Ok(r) => info!(port, ?policy, resolved = ?r.port(), "port resolved"),
            Err(e) => info!(port, ?policy, error = %e, "port resolution failed"),
        }
        resolution
    }

    /// Check one port by binding it. A bind that fails for a reason other
    /// than "in use" (privileged port, address not local) defers to the socket
    /// table when one could be read.
    fn check(&self, port: u16, table: &PortTable) -> Result<PortProbeResult, ControlError> {
        let in_use = match self.probe.is_in_use(port) {
            Ok(in_use) => in_use,
            Err(e) if table.readable => {
                debug!(port, error = %e, "bind check failed, using socket table");
                table.held.contains_key(&port)
            }
            Err(e) => return Err(e),
        };
        let owning_pids = if in_use { table.owners(port) } else { Vec::new() };
        Ok(PortProbeResult { port, in_use, owning_pids })
    }

    fn strict(&self, port: u16) -> Result<PortResolution, ControlError> {
        let table = PortTable::load(self.network);
        let checked = self.check(port, &table)?;
        if checked.in_use {
            return Err(ControlError::PortInUse { port, owning_pids: checked.owning_pids });
        }
        Ok(PortResolution::Available { port })
    }

    fn auto_port(&self, port: u16) -> Result<PortResolution, ControlError> {
        let table = PortTable::load(self.network);
        let last = port.saturating_add(self.settings.max_attempts.saturating_sub(1));
        for candidate in port..=last {
            if !self.check(candidate, &table)?.in_use {
                if candidate != port {
                    debug!(requested = port, chosen = candidate, "requested port busy, moved up");
                }
                return Ok(PortResolution::Available { port: candidate });
            }
        }
        Err(ControlError::NoPortAvailable { start: port, end: last })
    }

    async fn kill_port(&self, port: u16) -> Result<PortResolution, ControlError> {
        let deadline = Instant::now() + self.settings.time_budget;
        let table = PortTable::load(self.network);
        let first = self.check(port, &table)?;
        if !first.in_use {
            return Ok(PortResolution::Available { port });
        }

        let report = self.kill_owners(port, &first.owning_pids, deadline).await;
        for attempt in 1..=self.settings.kill_retries {
            if Instant::now() + self.settings.settle_delay > deadline {
                debug!(port, attempt, "time budget spent, no further re-checks");
                break;
            }
            sleep(self.settings.settle_delay).await;
            let table = PortTable::load(self.network);
            if !self.check(port, &table)?.in_use {
                debug!(port, attempt, "port released");
                return Ok(PortResolution::Freed { port, report });
            }
        }
        Err(ControlError::PortStillInUse {
            port,
            retries: self.settings.kill_retries,
            failed_kills: report.failed.into_iter().map(|f| (f.pid, f.error)).collect(),
        })
    }

    /// Check every port in `low..=high`, in order. Changes nothing.
    pub fn scan_range(&self, low: u16, high: u16) -> Result<Vec<PortProbeResult>, ControlError> {
        if low > high {
            return Err(ControlError::InvalidRange { low, high });
        }
        let span = u32::from(high) - u32::from(low) + 1;
        if span > self.settings.max_scan_range {
            return Err(ControlError::RangeTooLarge {
                low,
                high,
                span,
                max: self.settings.max_scan_range,
            });
        }
        let table = PortTable::load(self.network);
        let results: Vec<PortProbeResult> =
            (low..=high).map(|port| self.check(port, &table)).collect::<Result<_, _>>()?;
        info!(low, high, busy = results.iter().filter(|r| r.in_use).count(), "port range scanned");
        Ok(results)
    }

    /// Kill every TCP listener on `port`, looking them up fresh.
    pub async fn free_port(&self, port: u16) -> Result<FreePortReport, ControlError> {
        let deadline = Instant::now() + self.settings.time_budget;
        let table = PortTable::load(self.network);
        if !table.readable {
            return Err(ControlError::Unavailable(format!("owners of port {port}")));
        }
        let owners = table.owners(port);
        if owners.is_empty() {
            debug!(port, "no attributable owner");
        }
        Ok(self.kill_owners(port, &owners, deadline).await)
    }

    /// Kill each pid in turn. Failures are collected, not returned early, so
    /// one protected owner does not stop the others from being killed. A pid
    /// is only signalled when a full kill still fits before `deadline`, so no
    /// owner is left between SIGTERM and SIGKILL.
    async fn kill_owners(&self, port: u16, pids: &[u32], deadline: Instant) -> FreePortReport {
        let mut report = FreePortReport { port, ..Default::default() };
        let worst_case = self.settings.kill.worst_case();
        for &pid in pids {
            if Instant::now() + worst_case > deadline {
                warn!(port, pid, "time budget spent, owner left alone");
                let e = ControlError::Timeout(self.settings.time_budget);
                report.failed.push(PidFailure { pid, class: e.class(), error: e.to_string() });
                continue;
            }
            match terminate(&self.processes, pid, None, self.settings.kill).await {
                Ok(outcome) => report.killed.push(PidOutcome { pid, outcome }),
                Err(e) => {
                    warn!(port, pid, error = %e, "failed to kill port owner");
                    report.failed.push(PidFailure { pid, class: e.class(), error: e.to_string() });
                }
            }
        }
        report
    }
}
