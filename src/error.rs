//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`. Using the `thiserror`
//! crate, it gives every layer (transport, knob protocol, lifecycle, streaming,
//! download) one consistent taxonomy to report failures in.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceOffline`**: transport failure. A connect, read or write failed or ran
//!   past its deadline. The offending connection has already been dropped.
//! - **`RemoteRejected`**: the device answered a command with `ERROR ...` (or a
//!   non-zero `EOF <code>` trailer).
//! - **`Timeout`**: a logical wait (arm, post, store, download) exceeded its deadline.
//! - **`NotTriggered`**: a store found that no trigger was ever captured.
//! - **`InvalidSetup`**: an illegal call in the current state (nested chain start,
//!   store before arm, inconsistent configuration).
//! - **`ProtocolError`**: a response that does not follow the wire framing.
//! - **`Config`**: wraps errors from `figment` while loading configuration files.
//!
//! `DaqError::kind()` collapses a value into the copyable [`ErrorKind`] tag so callers
//! can log or retry without matching on payloads.

use crate::transport::Endpoint;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Copyable classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure.
    DeviceOffline,
    /// Device `ERROR` response.
    RemoteRejected,
    /// Deadline exceeded on a logical wait.
    Timeout,
    /// Store without a captured trigger.
    NotTriggered,
    /// Illegal call in the current state.
    InvalidSetup,
    /// Malformed response framing.
    ProtocolError,
    /// Configuration loading failure.
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::DeviceOffline => "device_offline",
            ErrorKind::RemoteRejected => "remote_rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotTriggered => "not_triggered",
            ErrorKind::InvalidSetup => "invalid_setup",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::Config => "config",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for carrier control and data transfer.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Transport failure talking to `endpoint`.
    ///
    /// **Recovery Strategy**: never retried silently. The connection has been closed
    /// and will be recreated lazily on the next command.
    #[error("Device offline at {endpoint}: {message}")]
    DeviceOffline {
        /// Endpoint that failed.
        endpoint: Endpoint,
        /// Human readable cause.
        message: String,
    },

    /// The device rejected a command.
    #[error("Device at {endpoint} rejected '{command}': {response}")]
    RemoteRejected {
        /// Endpoint that answered.
        endpoint: Endpoint,
        /// Command text as sent.
        command: String,
        /// Raw error response.
        response: String,
    },

    /// A wait exceeded its deadline.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Deadline that expired.
        after: Duration,
    },

    /// No trigger was captured for the shot.
    #[error("No trigger captured on {host} (shot {shot})")]
    NotTriggered {
        /// Carrier host.
        host: String,
        /// Shot number.
        shot: u64,
    },

    /// Illegal call in the current state, or inconsistent configuration.
    #[error("Invalid setup: {0}")]
    InvalidSetup(String),

    /// Malformed response framing.
    #[error("Protocol error from {endpoint}: {message}")]
    ProtocolError {
        /// Endpoint that sent the malformed data.
        endpoint: Endpoint,
        /// Description of the framing violation.
        message: String,
    },

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl DaqError {
    /// Build a `DeviceOffline` from an I/O error.
    pub fn offline(endpoint: &Endpoint, err: impl std::fmt::Display) -> Self {
        DaqError::DeviceOffline {
            endpoint: endpoint.clone(),
            message: err.to_string(),
        }
    }

    /// Build a `ProtocolError`.
    pub fn protocol(endpoint: &Endpoint, message: impl Into<String>) -> Self {
        DaqError::ProtocolError {
            endpoint: endpoint.clone(),
            message: message.into(),
        }
    }

    /// Build a `Timeout`.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        DaqError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classification tag for logging and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::DeviceOffline { .. } => ErrorKind::DeviceOffline,
            DaqError::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::NotTriggered { .. } => ErrorKind::NotTriggered,
            DaqError::InvalidSetup(_) => ErrorKind::InvalidSetup,
            DaqError::ProtocolError { .. } => ErrorKind::ProtocolError,
            DaqError::Config(_) => ErrorKind::Config,
        }
    }

    /// Endpoint involved in the failure, when there is one.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            DaqError::DeviceOffline { endpoint, .. }
            | DaqError::RemoteRejected { endpoint, .. }
            | DaqError::ProtocolError { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// Whether a retry at a higher level could reasonably succeed.
    ///
    /// Transport failures are excluded: they must be surfaced, not retried.
    pub fn can_recover(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::NotTriggered | ErrorKind::RemoteRejected
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_carries_endpoint_and_kind() {
        let endpoint = Endpoint::new("acq2106_064", 4220);
        let err = DaqError::offline(&endpoint, "connection reset");
        assert_eq!(err.kind(), ErrorKind::DeviceOffline);
        assert_eq!(err.endpoint(), Some(&endpoint));
        assert!(!err.can_recover());
        assert!(err.to_string().contains("acq2106_064:4220"));
    }

    #[test]
    fn logical_failures_are_recoverable() {
        let err = DaqError::timeout("ARM", Duration::from_secs(5));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.can_recover());
        assert!(err.endpoint().is_none());

        let err = DaqError::NotTriggered {
            host: "acq1001_300".into(),
            shot: 7,
        };
        assert_eq!(err.kind().to_string(), "not_triggered");
    }
}
