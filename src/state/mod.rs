//! Carrier state tracking.
//!
//! - [`snapshot`]: the state enum and the status line format
//! - [`monitor`]: the background task watching one host's state stream
//! - [`registry`]: per-host sharing of monitors

pub mod monitor;
pub mod registry;
pub mod snapshot;

pub use monitor::{MonitorStatus, MonitorTiming, StateMonitor};
pub use registry::{MonitorLease, MonitorRegistry};
pub use snapshot::{AcqState, StateSnapshot};
