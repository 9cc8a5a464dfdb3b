//! SystemPulse: samples host CPU, memory, disk, processes and sockets into a
//! lock-free snapshot, and runs the control operations that act on them
//! (killing processes, freeing ports, deleting large files).

pub mod collectors;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod view;

pub use config::{ConfigError, EngineConfig};
pub use controller::Engine;
pub use error::{ControlError, ErrorClass};
