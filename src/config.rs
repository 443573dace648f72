//! Carrier configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `CARRIER_DAQ_`, nested keys separated by
//!    `__` (for example `CARRIER_DAQ_ACQUISITION__CLOCK_HZ=2000000`)
//!
//! # Example
//! ```no_run
//! use carrier_daq::config::CarrierConfig;
//!
//! # fn main() -> carrier_daq::error::AppResult<()> {
//! let config = CarrierConfig::load_from("config/acq2106_064.toml")?;
//! config.validate()?;
//! println!("carrier: {}", config.device.host);
//! # Ok(())
//! # }
//! ```

use crate::device::{CarrierKind, ModuleFamily, TriggerMode};
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CARRIER_DAQ_";

/// Top-level configuration of one carrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierConfig {
    /// Carrier identity
    pub device: DeviceConfig,
    /// TCP port layout
    #[serde(default)]
    pub ports: PortMap,
    /// Plug-in modules by site
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Capture window and clocking
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Deadlines and poll intervals
    #[serde(default)]
    pub timing: TimingConfig,
    /// Channel downloader pool
    #[serde(default)]
    pub download: DownloadConfig,
    /// Streaming engine
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Recovery policies
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Carrier identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hostname or IP address
    pub host: String,
    /// Carrier generation
    #[serde(default)]
    pub kind: CarrierKind,
    /// Shot number written to the device at init
    #[serde(default = "default_shot")]
    pub shot: u64,
}

/// TCP port layout of a carrier.
///
/// Defaults are the factory ports; a simulated carrier moves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    /// State stream
    #[serde(default = "default_state_port")]
    pub state: u16,
    /// Command port of site 0; site `n` listens on `command_base + n`
    #[serde(default = "default_command_base")]
    pub command_base: u16,
    /// Streaming lane 0; lane `n` listens on `stream_base + n`
    #[serde(default = "default_stream_base")]
    pub stream_base: u16,
    /// Data base; channel `n` (1-based) listens on `data_base + n`
    #[serde(default = "default_data_base")]
    pub data_base: u16,
    /// Waveform checksum port; one-shot upload is `+1`, rearm upload `+2`
    #[serde(default = "default_awg_base")]
    pub awg_base: u16,
}

impl PortMap {
    /// Command port of `site`.
    pub fn command(&self, site: u8) -> u16 {
        self.command_base + u16::from(site)
    }

    /// Streaming port of `lane`.
    pub fn stream(&self, lane: usize) -> u16 {
        self.stream_base + lane as u16
    }

    /// Raw data port of 1-based `channel`.
    pub fn data(&self, channel: usize) -> u16 {
        self.data_base + channel as u16
    }

    /// Waveform checksum port.
    pub fn awg_checksum(&self) -> u16 {
        self.awg_base
    }

    /// Waveform upload port.
    pub fn awg_upload(&self, rearm: bool) -> u16 {
        self.awg_base + 1 + u16::from(rearm)
    }
}

impl Default for PortMap {
    fn default() -> Self {
        Self {
            state: default_state_port(),
            command_base: default_command_base(),
            stream_base: default_stream_base(),
            data_base: default_data_base(),
            awg_base: default_awg_base(),
        }
    }
}

/// One plug-in module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Site number, 1-based; site 1 is the master
    pub site: u8,
    /// Module family
    pub family: ModuleFamily,
    /// Whether the module takes part in captures
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Trigger mode, only used on the master
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    /// Samples per trigger in RTM mode
    #[serde(default = "default_rtm_translen")]
    pub rtm_translen: u64,
    /// FIR mode index (ACQ480)
    #[serde(default)]
    pub fir: usize,
    /// Per-channel settings; missing entries use family defaults
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl ModuleConfig {
    /// Enabled module with default settings.
    pub fn new(site: u8, family: ModuleFamily) -> Self {
        Self {
            site,
            family,
            enabled: true,
            trigger_mode: TriggerMode::default(),
            rtm_translen: default_rtm_translen(),
            fir: 0,
            channels: Vec::new(),
        }
    }

    /// Settings of 1-based `channel`, defaults when not configured.
    pub fn channel(&self, channel: usize) -> ChannelConfig {
        channel
            .checked_sub(1)
            .and_then(|idx| self.channels.get(idx))
            .cloned()
            .unwrap_or_default()
    }
}

/// Per-channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether the channel is stored
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Gain; meaning depends on the family, `None` uses the family default
    #[serde(default)]
    pub gain: Option<f64>,
    /// Output offset in percent (AO420)
    #[serde(default)]
    pub offset: f64,
    /// Invert input (ACQ480)
    #[serde(default)]
    pub invert: bool,
    /// High-pass filter setting (ACQ480)
    #[serde(default)]
    pub hpf: i64,
    /// Low-frequency noise suppression (ACQ480)
    #[serde(default)]
    pub lfns: i64,
    /// 50 ohm termination (ACQ480)
    #[serde(default)]
    pub t50r: bool,
    /// Calibration slope override
    #[serde(default)]
    pub slope: Option<f64>,
    /// Calibration offset override
    #[serde(default)]
    pub intercept: Option<f64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gain: None,
            offset: 0.0,
            invert: false,
            hpf: 0,
            lfns: 0,
            t50r: false,
            slope: None,
            intercept: None,
        }
    }
}

/// Capture window and clocking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sample clock in Hz
    #[serde(default = "default_clock_hz")]
    pub clock_hz: u64,
    /// Frequency of an external clock on the front panel; `None` uses the internal one
    #[serde(default)]
    pub external_clock_hz: Option<u64>,
    /// Pre-trigger samples
    #[serde(default)]
    pub pre: u64,
    /// Post-trigger samples
    #[serde(default = "default_post")]
    pub post: u64,
    /// Drive the trigger from software
    #[serde(default)]
    pub soft_trigger: bool,
    /// Trigger time in ns, added to every time base
    #[serde(default)]
    pub trigger_ns: f64,
    /// Force the streaming engine
    #[serde(default)]
    pub continuous: bool,
    /// Samples per channel that fit in on-board memory
    #[serde(default = "default_memory_samples")]
    pub memory_samples: u64,
    /// Sites per streaming lane; empty streams every active site on lane 0
    #[serde(default)]
    pub lanes: Vec<Vec<u8>>,
}

impl AcquisitionConfig {
    /// Whether a capture has to go through the streaming engine.
    pub fn needs_streaming(&self) -> bool {
        self.continuous || self.pre + self.post > self.memory_samples
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            clock_hz: default_clock_hz(),
            external_clock_hz: None,
            pre: 0,
            post: default_post(),
            soft_trigger: false,
            trigger_ns: 0.0,
            continuous: false,
            memory_samples: default_memory_samples(),
            lanes: Vec::new(),
        }
    }
}

/// Deadlines and poll intervals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    /// TCP connect deadline
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Per-operation deadline on command ports
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Per-operation deadline on data ports
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Granularity of every wait
    #[serde(with = "humantime_serde", default = "default_poll")]
    pub poll: Duration,
    /// Pause before the state monitor reconnects
    #[serde(with = "humantime_serde", default = "default_poll")]
    pub monitor_backoff: Duration,
    /// Abort bound at the start of init
    #[serde(with = "humantime_serde", default = "default_init_timeout")]
    pub init_timeout: Duration,
    /// Default arm deadline
    #[serde(with = "humantime_serde", default = "default_arm_timeout")]
    pub arm_timeout: Duration,
    /// Default store deadline
    #[serde(with = "humantime_serde", default = "default_store_timeout")]
    pub store_timeout: Duration,
    /// Wait for the stream to leave STOP after `CONTINUOUS start`
    #[serde(with = "humantime_serde", default = "default_stream_start_timeout")]
    pub stream_start_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            read_timeout: default_read_timeout(),
            poll: default_poll(),
            monitor_backoff: default_poll(),
            init_timeout: default_init_timeout(),
            arm_timeout: default_arm_timeout(),
            store_timeout: default_store_timeout(),
            stream_start_timeout: default_stream_start_timeout(),
        }
    }
}

/// Channel downloader pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Worker count
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Samples per storage segment
    #[serde(default = "default_segment_samples")]
    pub segment_samples: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            segment_samples: default_segment_samples(),
        }
    }
}

/// Streaming engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Sample rows per chunk
    #[serde(default = "default_chunk_samples")]
    pub chunk_samples: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_samples: default_chunk_samples(),
        }
    }
}

/// Recovery policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Force a re-arm/abort when an abort finds the device parked in FIN2
    #[serde(default = "default_enabled")]
    pub fin2_rearm: bool,
    /// How long FIN2 must persist before forcing
    #[serde(with = "humantime_serde", default = "default_fin2_hold")]
    pub fin2_hold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            fin2_rearm: true,
            fin2_hold: default_fin2_hold(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line
    Compact,
    /// JSON lines
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_shot() -> u64 {
    1
}

fn default_state_port() -> u16 {
    2235
}

fn default_command_base() -> u16 {
    4220
}

fn default_stream_base() -> u16 {
    4210
}

fn default_data_base() -> u16 {
    53000
}

fn default_awg_base() -> u16 {
    54200
}

fn default_enabled() -> bool {
    true
}

fn default_rtm_translen() -> u64 {
    1 << 20
}

fn default_clock_hz() -> u64 {
    1_000_000
}

fn default_post() -> u64 {
    1 << 20
}

fn default_memory_samples() -> u64 {
    1 << 26
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_init_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_arm_timeout() -> Duration {
    Duration::from_secs(50)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_stream_start_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_workers() -> usize {
    2
}

fn default_segment_samples() -> usize {
    1 << 18
}

fn default_chunk_samples() -> usize {
    0x10000
}

fn default_fin2_hold() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CarrierConfig {
    /// Configuration for `host` with no modules and default settings.
    pub fn new(host: impl Into<String>, kind: CarrierKind) -> Self {
        Self {
            device: DeviceConfig {
                host: host.into(),
                kind,
                shot: default_shot(),
            },
            ports: PortMap::default(),
            modules: Vec::new(),
            acquisition: AcquisitionConfig::default(),
            timing: TimingConfig::default(),
            download: DownloadConfig::default(),
            streaming: StreamingConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Add a module.
    pub fn with_module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }

    /// Load configuration from the default location, `config/carrier.toml`.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/carrier.toml")
    }

    /// Load configuration from a specific file path, with environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let config = Figment::new().merge(Toml::string(text)).extract()?;
        Ok(config)
    }

    /// Render the configuration as TOML, in the form [`load_from`](Self::load_from) reads.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::InvalidSetup(format!("configuration is not representable as TOML: {}", e)))
    }

    /// Write the configuration to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let text = self.to_toml_string()?;
        std::fs::write(path.as_ref(), text).map_err(|e| {
            DaqError::InvalidSetup(format!("cannot write {}: {}", path.as_ref().display(), e))
        })
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::InvalidSetup(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.device.host.trim().is_empty() {
            return invalid("device host is empty".to_string());
        }

        let mut sites = HashSet::new();
        for module in &self.modules {
            if module.site == 0 {
                return invalid("site 0 is the carrier, modules start at site 1".to_string());
            }
            if !sites.insert(module.site) {
                return invalid(format!("Duplicate module site: {}", module.site));
            }
            if module.channels.len() > module.family.channel_count() {
                return invalid(format!(
                    "site {} configures {} channels, {} has {}",
                    module.site,
                    module.channels.len(),
                    module.family,
                    module.family.channel_count()
                ));
            }
            if module.family == ModuleFamily::Acq480 && module.fir >= ModuleFamily::FIR_DECIM.len() {
                return invalid(format!("site {}: FIR mode {} out of range", module.site, module.fir));
            }
        }
        if !self.modules.is_empty() && !self.modules.iter().any(|m| m.site == 1 && m.enabled) {
            return invalid("site 1 (master) must be present and enabled".to_string());
        }

        let acq = &self.acquisition;
        if acq.clock_hz == 0 {
            return invalid("clock_hz must be positive".to_string());
        }
        if acq.lanes.len() > 2 {
            return invalid(format!("at most 2 streaming lanes, got {}", acq.lanes.len()));
        }
        let mut streamed = HashSet::new();
        for (lane, lane_sites) in acq.lanes.iter().enumerate() {
            for site in lane_sites {
                if !sites.contains(site) {
                    return invalid(format!("lane {} streams unknown site {}", lane, site));
                }
                if !streamed.insert(*site) {
                    return invalid(format!("site {} is assigned to more than one lane", site));
                }
            }
        }

        if self.download.workers == 0 {
            return invalid("download.workers must be at least 1".to_string());
        }
        if self.download.segment_samples == 0 {
            return invalid("download.segment_samples must be positive".to_string());
        }
        if self.streaming.chunk_samples == 0 {
            return invalid("streaming.chunk_samples must be positive".to_string());
        }
        if self.timing.poll.is_zero() {
            return invalid("timing.poll must be positive".to_string());
        }

        Ok(())
    }

    /// Enabled modules, ordered by site.
    pub fn enabled_modules(&self) -> Vec<&ModuleConfig> {
        let mut modules: Vec<&ModuleConfig> = self.modules.iter().filter(|m| m.enabled).collect();
        modules.sort_by_key(|m| m.site);
        modules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    fn two_modules() -> CarrierConfig {
        CarrierConfig::new("acq2106_064", CarrierKind::Acq2106)
            .with_module(ModuleConfig::new(1, ModuleFamily::Acq480))
            .with_module(ModuleConfig::new(2, ModuleFamily::Acq480))
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[device]
host = "acq2106_064"
kind = "acq2106"
shot = 42

[acquisition]
clock_hz = 2000000
pre = 1000
post = 100000
soft_trigger = true

[timing]
poll = "250ms"
arm_timeout = "10s"

[[modules]]
site = 1
family = "acq480"
trigger_mode = "rgm"
fir = 2

[[modules.channels]]
gain = 6
invert = true

[[modules]]
site = 2
family = "acq480"
enabled = false
"#
        )
        .unwrap();

        let config = CarrierConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.shot, 42);
        assert_eq!(config.acquisition.clock_hz, 2_000_000);
        assert_eq!(config.timing.poll, Duration::from_millis(250));
        assert_eq!(config.timing.arm_timeout, Duration::from_secs(10));
        assert_eq!(config.timing.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.modules[0].trigger_mode, TriggerMode::Rgm);
        assert_eq!(config.modules[0].channel(1).gain, Some(6.0));
        assert!(config.modules[0].channel(1).invert);
        assert!(config.modules[0].channel(8).enabled);
        assert_eq!(config.enabled_modules().len(), 1);
        assert_eq!(config.ports, PortMap::default());
    }

    #[test]
    fn test_port_layout() {
        let ports = PortMap::default();
        assert_eq!(ports.command(0), 4220);
        assert_eq!(ports.command(3), 4223);
        assert_eq!(ports.data(1), 53001);
        assert_eq!(ports.stream(1), 4211);
        assert_eq!(ports.awg_upload(false), 54201);
        assert_eq!(ports.awg_upload(true), 54202);
        assert_eq!(ports.awg_checksum(), 54200);
    }

    #[test]
    fn test_config_validation() {
        assert!(two_modules().validate().is_ok());

        let mut config = two_modules();
        config.logging.level = "invalid".to_string();
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidSetup);
    }

    #[test]
    fn test_duplicate_sites() {
        let config = two_modules().with_module(ModuleConfig::new(2, ModuleFamily::Acq425));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_master() {
        let config = CarrierConfig::new("acq1001_300", CarrierKind::Acq1001)
            .with_module(ModuleConfig::new(2, ModuleFamily::Acq425));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlapping_lanes() {
        let mut config = two_modules();
        config.acquisition.lanes = vec![vec![1], vec![1, 2]];
        assert!(config.validate().is_err());
        config.acquisition.lanes = vec![vec![1], vec![2]];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers() {
        let mut config = two_modules();
        config.download.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_streaming_threshold() {
        let mut acq = AcquisitionConfig::default();
        assert!(!acq.needs_streaming());
        acq.memory_samples = 1000;
        acq.post = 1001;
        assert!(acq.needs_streaming());
        acq.post = 10;
        acq.continuous = true;
        assert!(acq.needs_streaming());
    }

    #[test]
    fn test_shipped_sample_is_valid() {
        let config = CarrierConfig::from_toml_str(include_str!("../config/carrier.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.modules[0].channel(1).gain, Some(10.0));
        assert_eq!(config.recovery.fin2_hold, Duration::from_secs(1));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carrier.toml");
        let mut config = two_modules();
        config.acquisition.post = 12_345;
        config.recovery.fin2_hold = Duration::from_millis(250);
        config.save(&path).unwrap();

        let loaded = CarrierConfig::load_from(&path).unwrap();
        assert_eq!(loaded.device.host, config.device.host);
        assert_eq!(loaded.modules.len(), 2);
        assert_eq!(loaded.acquisition.post, 12_345);
        assert_eq!(loaded.recovery.fin2_hold, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = CarrierConfig::from_toml_str("[device]\nhost = 3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
