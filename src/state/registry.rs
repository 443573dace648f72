//! Reference-counted monitor registry.
//!
//! All sites of a carrier share one state stream, so monitors are handed out per
//! state endpoint. The first [`acquire`](MonitorRegistry::acquire) starts the
//! monitor, and dropping the last [`MonitorLease`] stops it.

use super::monitor::{MonitorTiming, StateMonitor};
use crate::transport::Endpoint;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug)]
struct Entry {
    monitor: Arc<StateMonitor>,
    leases: usize,
}

/// Owner of every running [`StateMonitor`].
#[derive(Debug)]
pub struct MonitorRegistry {
    timing: MonitorTiming,
    entries: Mutex<HashMap<Endpoint, Entry>>,
}

impl MonitorRegistry {
    /// Create an empty registry; monitors it starts use `timing`.
    pub fn new(timing: MonitorTiming) -> Arc<Self> {
        Arc::new(Self {
            timing,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Get the monitor for `endpoint`, starting it if needed.
    pub fn acquire(self: &Arc<Self>, endpoint: &Endpoint) -> MonitorLease {
        let mut entries = self.entries.lock();
        let entry = entries.entry(endpoint.clone()).or_insert_with(|| {
            tracing::info!(%endpoint, "starting state monitor");
            Entry {
                monitor: Arc::new(StateMonitor::start(endpoint.clone(), self.timing)),
                leases: 0,
            }
        });
        entry.leases += 1;
        MonitorLease {
            registry: Arc::clone(self),
            endpoint: endpoint.clone(),
            monitor: Arc::clone(&entry.monitor),
        }
    }

    /// Number of running monitors.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no monitor is running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding leases on `endpoint`.
    pub fn leases(&self, endpoint: &Endpoint) -> usize {
        self.entries.lock().get(endpoint).map_or(0, |e| e.leases)
    }

    fn release(&self, endpoint: &Endpoint) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(endpoint) else {
            return;
        };
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0 {
            if let Some(entry) = entries.remove(endpoint) {
                tracing::info!(%endpoint, "last lease released, stopping state monitor");
                entry.monitor.request_stop();
            }
        }
    }

    /// Stop every monitor and wait for the tasks to exit.
    ///
    /// Leases that are still held keep their monitor value but it no longer updates.
    pub async fn shutdown(&self) {
        let monitors: Vec<Arc<StateMonitor>> = self
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry.monitor)
            .collect();
        join_all(monitors.iter().map(|monitor| monitor.stop())).await;
    }
}

/// Shared handle on a monitor. Releases its reference on drop.
#[derive(Debug)]
pub struct MonitorLease {
    registry: Arc<MonitorRegistry>,
    endpoint: Endpoint,
    monitor: Arc<StateMonitor>,
}

impl Deref for MonitorLease {
    type Target = StateMonitor;

    fn deref(&self) -> &StateMonitor {
        &self.monitor
    }
}

impl Drop for MonitorLease {
    fn drop(&mut self) {
        self.registry.release(&self.endpoint);
    }
}
