//! Subscriber setup.
//!
//! Components log through `tracing` with the fields `host`, `site`, `shot`, `lane`
//! and `channel`, inside `init`, `arm` and `store` spans. [`init`] installs a single
//! fmt layer in the configured format. `RUST_LOG` replaces the configured level;
//! otherwise the level applies to this crate and dependencies only log warnings.
//!
//! ```no_run
//! use carrier_daq::{config::CarrierConfig, logging};
//!
//! # fn main() -> carrier_daq::error::AppResult<()> {
//! let config = CarrierConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(host = %config.device.host, "carrier configured");
//! # Ok(())
//! # }
//! ```

use crate::config::{CarrierConfig, LogFormat, LoggingConfig};
use crate::error::{AppResult, DaqError};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Levels accepted in the logging section.
pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn level_name(level: &str) -> AppResult<String> {
    let level = level.trim().to_lowercase();
    if LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        Err(DaqError::InvalidSetup(format!(
            "invalid log level '{}', expected one of: {}",
            level,
            LEVELS.join(", ")
        )))
    }
}

/// Filter logging this crate at `level` and everything else at `warn`.
pub fn filter_for(level: &str) -> AppResult<EnvFilter> {
    let level = level_name(level)?;
    EnvFilter::try_new(format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level))
        .map_err(|err| DaqError::InvalidSetup(format!("log filter: {}", err)))
}

fn fmt_layer(format: LogFormat, spans: FmtSpan) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => fmt::layer().pretty().with_span_events(spans).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_span_events(spans)
            .boxed(),
    }
}

/// Install the global subscriber for `config`.
///
/// Span closes (with their busy time) are logged at `debug` and `trace`. Returns
/// `Ok(false)` and keeps the existing subscriber when one is already installed.
pub fn init(config: &LoggingConfig) -> AppResult<bool> {
    let level = level_name(&config.level)?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => filter_for(&level)?,
    };
    let spans = match level.as_str() {
        "trace" | "debug" => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    };
    let installed = tracing_subscriber::registry()
        .with(fmt_layer(config.format, spans).with_filter(filter))
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("subscriber already installed, keeping it");
    }
    Ok(installed)
}

/// Install the global subscriber for the logging section of `config`.
pub fn init_from_config(config: &CarrierConfig) -> AppResult<bool> {
    init(&config.logging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_levels_are_case_insensitive() {
        for level in ["trace", "DEBUG", " Info ", "warn", "error"] {
            assert!(filter_for(level).is_ok(), "{}", level);
        }
        let err = filter_for("loud").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
    }

    #[test]
    fn test_filter_scopes_level_to_this_crate() {
        let filter = filter_for("debug").unwrap().to_string();
        assert!(filter.contains("carrier_daq=debug"), "{}", filter);
        assert!(filter.contains("warn"), "{}", filter);
    }

    #[test]
    fn test_repeated_init_keeps_first_subscriber() {
        let config = LoggingConfig {
            format: LogFormat::Compact,
            ..LoggingConfig::default()
        };
        init(&config).unwrap();
        assert!(!init(&config).unwrap());
    }

    #[test]
    fn test_invalid_level_fails_before_install() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init(&config).is_err());
    }
}
