//! # Carrier DAQ
//!
//! Control, status monitoring and data transfer for networked DAQ carriers: a
//! motherboard with up to six plug-in digitizer or waveform generator modules,
//! reached over plain TCP.
//!
//! ## Crate Structure
//!
//! - **`transport`**: TCP connections with deadlines and the read helpers every
//!   protocol in the crate is built on.
//! - **`knob`**: The text knob protocol. `CommandClient` talks to one site's command
//!   port, batches chains of settings and records what init applied.
//! - **`state`**: Capture engine states, the status stream monitor and its
//!   per-host registry.
//! - **`device`**: The carrier and its modules: clock, trigger and per-channel
//!   configuration, calibration and waveform upload. Carriers are shared per host.
//! - **`lifecycle`**: `Acquisition`, which drives one carrier through
//!   `init → arm → trigger → store → deinit`.
//! - **`streaming`**: Continuous capture. One worker per lane, event markers and
//!   time alignment.
//! - **`download`**: The channel downloader pool for captures held in on-board memory.
//! - **`storage`**: The `StorageSink` callback samples are handed to.
//! - **`manager`**: `DeviceManager`, the process-wide owner of carriers, monitors
//!   and stream sessions.
//! - **`config`**: Carrier configuration loaded from TOML with environment overrides.
//! - **`error`**: The `DaqError` enum.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`mock`**: A simulated carrier serving every port on loopback.
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = CarrierConfig::load()?;
//! let manager = DeviceManager::from_timing(&config.timing);
//! let acq = manager.open(&config, Arc::new(MemorySink::new()))?;
//! acq.init(InitRequest::from_config(&config.acquisition)).await?;
//! if acq.arm(None).await? {
//!     acq.soft_trigger().await?;
//!     acq.store(None).await?;
//! }
//! acq.deinit().await?;
//! ```

pub mod config;
pub mod device;
pub mod download;
pub mod error;
pub mod knob;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod mock;
pub mod state;
pub mod storage;
pub mod streaming;
pub mod transport;

pub use config::CarrierConfig;
pub use error::{AppResult, DaqError, ErrorKind};
pub use lifecycle::{Acquisition, InitRequest};
pub use manager::DeviceManager;
pub use storage::{MemorySink, Segment, StorageSink};
