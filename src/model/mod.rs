// Value types produced by the collectors and the engine. Nothing in here
// holds a live handle into the OS; every record is a point-in-time copy.

pub use files::{DeleteOutcome, LargeFileRecord, LargeFileScan, ScanLimit};
pub use network::{ConnectionRecord, PortProbeResult, Protocol, SocketState};
pub use process::{KillOutcome, ProcessRecord, SortColumn};
pub use system::{MetricSample, Reading, SystemSnapshot, UsageInfo};

mod files;
mod network;
mod process;
mod system;
