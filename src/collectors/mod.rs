use std::collections::BTreeSet;

use crate::error::ControlError;
use crate::model::{ConnectionRecord, MetricSample, ProcessRecord};

pub mod linux;
pub mod mac;
pub mod metrics;
pub mod probe;
pub mod process;

pub use linux::ProcNetCollector;
pub use mac::LsofCollector;
pub use metrics::SysinfoMetrics;
pub use probe::TcpBindProbe;
pub use process::SysinfoProcesses;

/// Host-wide CPU, memory and disk counters.
///
/// Implementations keep state between calls (CPU utilization is a delta of
/// two counter reads), hence `&mut self`.
pub trait MetricCollector: Send {
    /// Never fails as a whole: an unreadable metric comes back as
    /// `Reading::Unavailable` and the others are still filled in.
    fn sample(&mut self) -> MetricSample;
}

/// Signal strength for [`ProcessInspector::signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM, or the platform's polite equivalent.
    Graceful,
    /// SIGKILL.
    Forceful,
}

/// Process enumeration and signalling.
pub trait ProcessInspector: Send + Sync {
    /// One pass over the process table. Processes that exit or deny access
    /// while being read are left out.
    fn list_processes(&self) -> Vec<ProcessRecord>;

    /// Current name of `pid`, or `None` if it no longer exists. Zombies count
    /// as gone.
    fn process_name(&self, pid: u32) -> Option<String>;

    fn is_alive(&self, pid: u32) -> bool {
        self.process_name(pid).is_some()
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), ControlError>;
}

/// Socket enumeration with pid attribution.
pub trait NetworkInspector: Send + Sync {
    fn list_connections(&self) -> Result<Vec<ConnectionRecord>, ControlError>;

    /// Every distinct pid holding `port` open for binding purposes. Empty when
    /// the port is free or its owner cannot be attributed.
    fn find_port_owners(&self, port: u16) -> Result<Vec<u32>, ControlError> {
        let owners: BTreeSet<u32> = self
            .list_connections()?
            .iter()
            .filter(|c| c.holds_port(port))
            .filter_map(|c| c.owning_pid)
            .collect();
        Ok(owners.into_iter().collect())
    }
}

/// Non-mutating "is this port bound?" check.
pub trait PortProbe: Send + Sync {
    fn is_in_use(&self, port: u16) -> Result<bool, ControlError>;
}

/// Platform without a supported socket table source.
pub struct UnsupportedNetwork;

impl NetworkInspector for UnsupportedNetwork {
    fn list_connections(&self) -> Result<Vec<ConnectionRecord>, ControlError> {
        Err(ControlError::Unavailable(format!(
            "connection listing on {}",
            std::env::consts::OS
        )))
    }
}

/// Pick the socket table source for the running OS.
pub fn default_network_inspector() -> Box<dyn NetworkInspector> {
    if cfg!(target_os = "linux") || cfg!(target_os = "android") {
        Box::new(ProcNetCollector::new())
    } else if cfg!(target_os = "macos") || cfg!(target_os = "freebsd") {
        Box::new(LsofCollector::new())
    } else {
        Box::new(UnsupportedNetwork)
    }
}
