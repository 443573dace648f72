//! Process-wide device registry.
//!
//! The [`DeviceManager`] owns what several carriers (or several opens of the same
//! carrier) share: the carriers themselves with their command clients, the state
//! monitors handed out per state endpoint, and the registry of live stream sessions.

use crate::config::{CarrierConfig, TimingConfig};
use crate::device::CarrierRegistry;
use crate::error::AppResult;
use crate::lifecycle::Acquisition;
use crate::state::{MonitorRegistry, MonitorTiming};
use crate::storage::StorageSink;
use crate::streaming::SessionRegistry;
use std::sync::Arc;

/// Opens carriers against shared monitors and stream sessions.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    carriers: Arc<CarrierRegistry>,
    monitors: Arc<MonitorRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl DeviceManager {
    /// Manager whose monitors use `timing`.
    pub fn new(timing: MonitorTiming) -> Self {
        Self {
            carriers: CarrierRegistry::new(),
            monitors: MonitorRegistry::new(timing),
            sessions: SessionRegistry::new(),
        }
    }

    /// Manager whose monitors follow the timing section of a configuration.
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self::new(MonitorTiming {
            connect_timeout: timing.connect_timeout,
            poll: timing.poll,
            backoff: timing.monitor_backoff,
        })
    }

    /// Open carriers.
    pub fn carriers(&self) -> &Arc<CarrierRegistry> {
        &self.carriers
    }

    /// State monitors.
    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Live stream sessions.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Open the carrier described by `config`, storing data into `sink`.
    ///
    /// Opens of a host already open share its carrier and command clients; the
    /// shot number is taken from `config` either way. No command connection is made
    /// yet; the state monitor of the host is started (or shared) right away.
    pub fn open(&self, config: &CarrierConfig, sink: Arc<dyn StorageSink>) -> AppResult<Acquisition> {
        let carrier = self.carriers.acquire(config)?;
        let monitor = self.monitors.acquire(&carrier.state_endpoint());
        tracing::info!(
            host = %carrier.host(),
            kind = ?carrier.kind(),
            modules = carrier.modules().len(),
            "carrier opened"
        );
        Ok(Acquisition::new(carrier, monitor, self.sessions.clone(), sink).with_shot(config.device.shot))
    }

    /// Stop every stream session and state monitor.
    pub async fn shutdown(&self) {
        tracing::info!(
            sessions = self.sessions.len(),
            monitors = self.monitors.len(),
            "shutting down device manager"
        );
        self.sessions.shutdown().await;
        self.monitors.shutdown().await;
    }
}
