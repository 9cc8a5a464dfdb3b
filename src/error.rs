//! Error taxonomy shared by every control operation.
//!
//! OS-specific failures (`std::io::Error`, `nix::Errno`) are folded into
//! [`ControlError`] at the collector boundary, so nothing above the
//! collectors sees platform error types.

use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Coarse class of a failure, for callers that only need to decide whether
/// to retry, report or ignore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    PermissionDenied,
    Busy,
    Unavailable,
    Error,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("refused: {0}")]
    Refused(String),

    #[error("pid {pid} is now '{actual}', expected '{expected}'")]
    NameMismatch {
        pid: u32,
        expected: String,
        actual: String,
    },

    #[error("port {port} is in use")]
    PortInUse { port: u16, owning_pids: Vec<u32> },

    #[error("no free port in {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("port {port} still in use after {retries} re-checks")]
    PortStillInUse {
        port: u16,
        retries: u32,
        failed_kills: Vec<(u32, String)>,
    },

    #[error("invalid port range {low}..={high}")]
    InvalidRange { low: u16, high: u16 },

    #[error("port range {low}..={high} spans {span} ports, limit is {max}")]
    RangeTooLarge { low: u16, high: u16, span: u32, max: u32 },

    #[error("{0} unavailable")]
    Unavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ControlError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControlError::NotFound(_) => ErrorClass::NotFound,
            ControlError::PermissionDenied(_) => ErrorClass::PermissionDenied,
            ControlError::PortInUse { .. }
            | ControlError::NoPortAvailable { .. }
            | ControlError::PortStillInUse { .. } => ErrorClass::Busy,
            ControlError::Unavailable(_) => ErrorClass::Unavailable,
            ControlError::Refused(_)
            | ControlError::NameMismatch { .. }
            | ControlError::InvalidRange { .. }
            | ControlError::RangeTooLarge { .. }
            | ControlError::Timeout(_)
            | ControlError::Os { .. } => ErrorClass::Error,
        }
    }

    /// Map an I/O error onto the taxonomy. `context` names the target.
    pub fn from_io(context: impl Into<String>, err: io::Error) -> Self {
        let context = context.into();
        match err.kind() {
            io::ErrorKind::NotFound => ControlError::NotFound(context),
            io::ErrorKind::PermissionDenied => ControlError::PermissionDenied(context),
            io::ErrorKind::Unsupported => ControlError::Unavailable(context),
            _ => ControlError::Os { context, source: err },
        }
    }

    #[cfg(unix)]
    pub fn from_errno(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;

        let context = context.into();
        match errno {
            Errno::ESRCH | Errno::ENOENT => ControlError::NotFound(context),
            Errno::EPERM | Errno::EACCES => ControlError::PermissionDenied(context),
            Errno::ENOSYS => ControlError::Unavailable(context),
            other => ControlError::Os { context, source: io::Error::from(other) },
        }
    }
}
