//! Reference-counted carrier registry.
//!
//! A host has one command connection per site, so every open of the same host must
//! go through the same [`Carrier`]. The first [`acquire`](CarrierRegistry::acquire)
//! builds it and dropping the last [`CarrierLease`] forgets it, closing its clients.

use super::Carrier;
use crate::config::CarrierConfig;
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

fn fingerprint(config: &CarrierConfig) -> AppResult<serde_json::Value> {
    let mut config = config.clone();
    config.device.shot = 0;
    serde_json::to_value(&config)
        .map_err(|err| DaqError::InvalidSetup(format!("configuration not serializable: {}", err)))
}

#[derive(Debug)]
struct Entry {
    carrier: Arc<Carrier>,
    fingerprint: serde_json::Value,
    leases: usize,
}

/// Owner of every open [`Carrier`], keyed by host.
#[derive(Debug, Default)]
pub struct CarrierRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CarrierRegistry {
    /// Empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the carrier of `config`'s host, building it on first use.
    ///
    /// Opens that differ only in the shot number share a carrier. Fails with
    /// `InvalidSetup` when the configuration is invalid or when the host is already
    /// open with a different configuration.
    pub fn acquire(self: &Arc<Self>, config: &CarrierConfig) -> AppResult<CarrierLease> {
        let fingerprint = fingerprint(config)?;
        let host = config.device.host.clone();
        let mut entries = self.entries.lock();
        let carrier = match entries.get_mut(&host) {
            Some(entry) if entry.fingerprint != fingerprint => {
                return Err(DaqError::InvalidSetup(format!(
                    "{} is already open with a different configuration",
                    host
                )));
            }
            Some(entry) => {
                entry.leases += 1;
                Arc::clone(&entry.carrier)
            }
            None => {
                let carrier = Arc::new(Carrier::from_config(config)?);
                tracing::debug!(%host, "carrier registered");
                entries.insert(
                    host.clone(),
                    Entry {
                        carrier: Arc::clone(&carrier),
                        fingerprint,
                        leases: 1,
                    },
                );
                carrier
            }
        };
        Ok(CarrierLease {
            registry: Arc::clone(self),
            host,
            carrier,
        })
    }

    /// Number of open hosts.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no host is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding leases on `host`.
    pub fn leases(&self, host: &str) -> usize {
        self.entries.lock().get(host).map_or(0, |e| e.leases)
    }

    fn release(&self, host: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(host) else {
            return;
        };
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0 {
            entries.remove(host);
            tracing::debug!(%host, "last lease released, carrier forgotten");
        }
    }
}

/// Shared handle on a carrier. Releases its reference on drop.
#[derive(Debug)]
pub struct CarrierLease {
    registry: Arc<CarrierRegistry>,
    host: String,
    carrier: Arc<Carrier>,
}

impl CarrierLease {
    /// The shared carrier.
    pub fn shared(&self) -> &Arc<Carrier> {
        &self.carrier
    }
}

impl Deref for CarrierLease {
    type Target = Carrier;

    fn deref(&self) -> &Carrier {
        &self.carrier
    }
}

impl Drop for CarrierLease {
    fn drop(&mut self) {
        self.registry.release(&self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::device::{CarrierKind, ModuleFamily};
    use crate::error::ErrorKind;

    fn config(host: &str) -> CarrierConfig {
        CarrierConfig::new(host, CarrierKind::Acq2106).with_module(ModuleConfig::new(1, ModuleFamily::Acq425))
    }

    #[test]
    fn same_host_shares_one_carrier() {
        let registry = CarrierRegistry::new();
        let first = registry.acquire(&config("acq2106_064")).unwrap();
        let second = registry.acquire(&config("acq2106_064")).unwrap();
        let mut next_shot = config("acq2106_064");
        next_shot.device.shot += 1;
        let third = registry.acquire(&next_shot).unwrap();
        let other = registry.acquire(&config("acq2106_065")).unwrap();

        assert!(Arc::ptr_eq(first.shared(), second.shared()));
        assert!(!Arc::ptr_eq(first.shared(), other.shared()));
        assert!(std::ptr::eq(first.client(), second.client()));
        assert!(Arc::ptr_eq(first.shared(), third.shared()));
        assert_eq!(registry.leases("acq2106_064"), 3);

        drop(first);
        drop(third);
        assert_eq!(registry.leases("acq2106_064"), 1);
        drop(second);
        assert_eq!(registry.len(), 1);
        drop(other);
        assert!(registry.is_empty());
    }

    #[test]
    fn conflicting_configuration_is_rejected() {
        let registry = CarrierRegistry::new();
        let _open = registry.acquire(&config("acq2106_064")).unwrap();
        let two_modules = config("acq2106_064").with_module(ModuleConfig::new(2, ModuleFamily::Acq425));
        let err = registry.acquire(&two_modules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
        assert_eq!(registry.leases("acq2106_064"), 1);
    }

    #[test]
    fn invalid_configuration_is_not_registered() {
        let registry = CarrierRegistry::new();
        assert!(registry.acquire(&CarrierConfig::new("", CarrierKind::Acq1001)).is_err());
        assert!(registry.is_empty());
    }
}
