//! The carrier: site 0 plus its ordered modules.

use super::awg::{self, UploadReceipt};
use super::module::{Channel, Module, ModuleFamily};
use crate::config::CarrierConfig;
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::knob::schema::carrier as knobs;
use crate::knob::{CommandClient, KnobSchema, KnobType, SettingsCache};
use crate::state::StateSnapshot;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Carrier generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierKind {
    /// Single-site carrier without jitter cleaner.
    Acq1001,
    /// Six-site carrier with an Si5326 jitter cleaner.
    #[default]
    Acq2106,
}

impl CarrierKind {
    /// Internal clock.
    pub const ZCLK_HZ: u64 = 33_333_300;

    /// Motherboard clocks with a stored jitter cleaner plan.
    pub const PLANNED_CLOCKS_HZ: [u64; 6] = [
        10_000_000, 20_000_000, 24_000_000, 40_000_000, 50_000_000, 80_000_000,
    ];

    /// `SYS:CLK:CONFIG` while the jitter cleaner is bypassed.
    pub const BYPASS_CONFIG: &'static str = "1-1_bypass";

    /// Jitter cleaner plan for `set_hz`, if one is stored.
    pub fn clock_plan(self, set_hz: u64) -> Option<String> {
        match self {
            CarrierKind::Acq2106 if Self::PLANNED_CLOCKS_HZ.contains(&set_hz) => {
                Some(format!("{:02}M", set_hz / 1_000_000))
            }
            _ => None,
        }
    }
}

/// Clock routing requested at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSetup {
    /// Front-panel clock instead of the internal one.
    pub external: bool,
    /// Input frequency.
    pub fin_hz: u64,
    /// Motherboard frequency to derive.
    pub set_hz: u64,
}

/// Trigger and capture window requested at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSetup {
    /// Pre-trigger samples.
    pub pre: u64,
    /// Post-trigger samples.
    pub post: u64,
    /// Soft trigger requested.
    pub soft: bool,
}

impl TriggerSetup {
    /// A pre-trigger window needs the soft trigger to start the capture.
    pub fn effective_soft(&self) -> bool {
        self.pre > 0 || self.soft
    }

    /// Lines of the transient commit request.
    pub fn transient_commands(&self) -> Vec<String> {
        vec![
            format!("{} DEMUX=1", knobs::TRANSIENT_SHORTHAND.path()),
            format!("{} {}", knobs::TRANSIENT_PRE.path(), self.pre),
            format!("{} {}", knobs::TRANSIENT_POST.path(), self.post),
            format!("{} 1", knobs::TRANSIENT_OSAM.path()),
            format!("{} {}", knobs::TRANSIENT_SOFT_TRIGGER.path(), self.effective_soft().encode()),
            format!("{} 0", knobs::TRANSIENT_REPEAT.path()),
            format!("{} {}", knobs::TRANSIENT.path(), true.encode()),
        ]
    }
}

/// One carrier: the site-0 command client and every configured module.
#[derive(Debug)]
pub struct Carrier {
    config: CarrierConfig,
    client: CommandClient,
    modules: Vec<Arc<Module>>,
    cache: Arc<SettingsCache>,
}

impl Carrier {
    /// Build clients for site 0 and every configured module.
    ///
    /// Modules are ordered by site; channel numbers run over all of them, disabled
    /// modules included, so a channel keeps its number when its module is switched off.
    pub fn from_config(config: &CarrierConfig) -> AppResult<Self> {
        config.validate()?;
        let host = &config.device.host;
        let timing = &config.timing;
        let cache = Arc::new(SettingsCache::new(host.clone()));
        let make_client = |site: u8, schema: &'static KnobSchema| {
            CommandClient::new(Endpoint::new(host.clone(), config.ports.command(site)), site, schema)
                .with_timeouts(timing.connect_timeout, timing.command_timeout)
                .with_cache(cache.clone())
        };

        let client = make_client(0, &knobs::SCHEMA);
        let mut module_configs = config.modules.clone();
        module_configs.sort_by_key(|m| m.site);
        let mut first_channel = 1;
        let mut modules = Vec::with_capacity(module_configs.len());
        for module in module_configs {
            let count = module.family.channel_count();
            let client = make_client(module.site, module.family.schema());
            modules.push(Arc::new(Module::new(module, client, first_channel)));
            first_channel += count;
        }

        Ok(Self {
            config: config.clone(),
            client,
            modules,
            cache,
        })
    }

    /// Configuration the carrier was built from.
    pub fn config(&self) -> &CarrierConfig {
        &self.config
    }

    /// Hostname.
    pub fn host(&self) -> &str {
        &self.config.device.host
    }

    /// Carrier generation.
    pub fn kind(&self) -> CarrierKind {
        self.config.device.kind
    }

    /// Site 0 command client.
    pub fn client(&self) -> &CommandClient {
        &self.client
    }

    /// Settings audit shared by every client of the carrier.
    pub fn cache(&self) -> &Arc<SettingsCache> {
        &self.cache
    }

    /// All configured modules, ordered by site.
    pub fn modules(&self) -> &[Arc<Module>] {
        &self.modules
    }

    /// Enabled modules, ordered by site.
    pub fn enabled_modules(&self) -> Vec<Arc<Module>> {
        self.modules.iter().filter(|m| m.is_enabled()).cloned().collect()
    }

    /// Module at `site`.
    pub fn module(&self, site: u8) -> Option<&Arc<Module>> {
        self.modules.iter().find(|m| m.site() == site)
    }

    /// The master module (site 1).
    pub fn master(&self) -> AppResult<&Arc<Module>> {
        self.module(1)
            .filter(|m| m.is_enabled())
            .ok_or_else(|| DaqError::InvalidSetup(format!("{} has no enabled master module", self.host())))
    }

    /// Whether the carrier plays waveforms instead of recording.
    pub fn is_generator(&self) -> bool {
        self.module(1).map_or(false, |m| m.family().is_generator())
    }

    /// Every channel of every module.
    pub fn channels(&self) -> Vec<Channel> {
        self.modules.iter().flat_map(|m| m.channels()).collect()
    }

    /// State stream endpoint.
    pub fn state_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host(), self.config.ports.state)
    }

    /// Data port of carrier channel `channel`.
    pub fn data_endpoint(&self, channel: usize) -> Endpoint {
        Endpoint::new(self.host(), self.config.ports.data(channel))
    }

    /// Streaming port of `lane`.
    pub fn stream_endpoint(&self, lane: usize) -> Endpoint {
        Endpoint::new(self.host(), self.config.ports.stream(lane))
    }

    /// Snapshot from the `state` knob.
    pub async fn state(&self) -> AppResult<StateSnapshot> {
        let text = self.client.get(&knobs::STATE).await?;
        Ok(StateSnapshot::from_status(&text))
    }

    /// Fire the internal trigger.
    pub async fn soft_trigger(&self) -> AppResult<()> {
        tracing::info!(host = %self.host(), "soft trigger");
        self.client.exec(&knobs::SOFT_TRIGGER).await
    }

    /// Ask the engine to arm.
    pub async fn request_arm(&self) -> AppResult<()> {
        self.client.set(&knobs::TRANSIENT_SET_ARM, &true).await
    }

    /// Ask the engine to abort.
    pub async fn request_abort(&self) -> AppResult<()> {
        self.client.set(&knobs::TRANSIENT_SET_ABORT, &true).await
    }

    /// Stop streaming daemons. A device that rejects the request was not streaming.
    pub async fn stop_streams(&self) -> AppResult<()> {
        for knob in [&knobs::CONTINUOUS, &knobs::STREAMTONOWHERED] {
            match self.client.set(knob, &"stop".to_string()).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::RemoteRejected => {
                    tracing::debug!(host = %self.host(), knob = knob.path(), "stop rejected");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Re-arm and abort directly, to kick an engine parked in FIN2.
    pub async fn force_rearm(&self) -> AppResult<()> {
        tracing::warn!(host = %self.host(), "forcing re-arm out of FIN2");
        self.client.exec(&knobs::SET_ARM).await?;
        self.client.exec(&knobs::SET_ABORT).await
    }

    /// Route the enabled sites into the aggregator (recorders) or distributor.
    pub async fn select_sites(&self) -> AppResult<()> {
        let sites: Vec<i64> = self
            .enabled_modules()
            .iter()
            .map(|m| i64::from(m.site()))
            .collect();
        if self.is_generator() {
            self.client.set(&knobs::PLAY0, &sites).await
        } else {
            self.client.set(&knobs::RUN0, &sites).await
        }
    }

    /// Program clock routing.
    pub async fn configure_clock(&self, clock: ClockSetup) -> AppResult<()> {
        let c = &self.client;
        if clock.external {
            c.set(&knobs::SYS_CLK_FPMUX, &"FPCLK".to_string()).await?;
        } else {
            c.set(&knobs::SIG_ZCLK_SRC, &0).await?;
            c.set(&knobs::SYS_CLK_FPMUX, &"ZCLK".to_string()).await?;
        }
        c.set_at(&knobs::SIG_SRC_CLK, 0, &0).await?;
        c.set_at(&knobs::SIG_SRC_CLK, 1, &0).await?;
        c.set(&knobs::SIG_CLK_MB_FIN, &(clock.fin_hz as i64)).await?;
        c.set(&knobs::SIG_CLK_MB_SET, &(clock.set_hz as i64)).await?;

        if self.kind() == CarrierKind::Acq2106 {
            match self.kind().clock_plan(clock.set_hz) {
                Some(plan) => {
                    c.set(&knobs::SYS_CLK_BYPASS, &0).await?;
                    c.set(&knobs::SYS_CLK_PLAN, &plan).await?;
                }
                None => self.configure_bypass(clock.fin_hz == clock.set_hz).await?,
            }
            c.set(&knobs::SYS_CLK_OE_CLK1_ZYNQ, &1).await?;
        }
        tracing::info!(host = %self.host(), ?clock, "clock configured");
        Ok(())
    }

    async fn configure_bypass(&self, bypass: bool) -> AppResult<()> {
        let is_bypass = |config: &str| config == CarrierKind::BYPASS_CONFIG;
        let current = self.client.get(&knobs::SYS_CLK_CONFIG).await?;
        if is_bypass(&current) == bypass {
            return Ok(());
        }
        self.client.set(&knobs::SYS_CLK_BYPASS, &i64::from(bypass)).await?;
        let poll = self.config.timing.poll;
        for _ in 0..5 {
            tokio::time::sleep(poll).await;
            if is_bypass(&self.client.get(&knobs::SYS_CLK_CONFIG).await?) == bypass {
                return Ok(());
            }
        }
        tracing::warn!(host = %self.host(), bypass, "jitter cleaner did not follow bypass request");
        Ok(())
    }

    /// Program trigger routing and commit the capture window.
    pub async fn configure_trigger(&self, trigger: TriggerSetup) -> AppResult<()> {
        let c = &self.client;
        c.set(&knobs::SIG_FP_TRG, &"INPUT".to_string()).await?;
        c.set_at(&knobs::SIG_SRC_TRG, 0, &0).await?;
        c.set_at(&knobs::SIG_SRC_TRG, 1, &0).await?;
        c.set(&knobs::LIVE_MODE, &if trigger.pre > 0 { 2 } else { 1 }).await?;
        c.set(&knobs::LIVE_PRE, &(trigger.pre as i64)).await?;
        c.set(&knobs::LIVE_POST, &(trigger.post as i64)).await?;
        c.chain(trigger.transient_commands()).await?;
        tracing::info!(host = %self.host(), ?trigger, "capture window committed");
        Ok(())
    }

    /// Carrier part of init: aggregator, shot, clock and trigger.
    pub async fn configure(&self, clock: ClockSetup, trigger: TriggerSetup, shot: u64) -> AppResult<()> {
        self.select_sites().await?;
        self.client.set(&knobs::SHOT, &(shot as i64)).await?;
        self.configure_clock(clock).await?;
        self.configure_trigger(trigger).await
    }

    /// Upload waveforms to the generator.
    pub async fn upload_waveforms(&self, channels: &[Vec<f64>], rearm: bool) -> AppResult<UploadReceipt> {
        let image = awg::encode_waveforms(channels);
        let ports = &self.config.ports;
        let upload = Endpoint::new(self.host(), ports.awg_upload(rearm));
        let checksum = Endpoint::new(self.host(), ports.awg_checksum());
        awg::upload(&upload, &checksum, &image, self.config.timing.connect_timeout).await
    }

    /// Drop every command connection.
    pub async fn close(&self) {
        self.client.close().await;
        for module in &self.modules {
            module.client().close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;

    fn config() -> CarrierConfig {
        let mut off = ModuleConfig::new(2, ModuleFamily::Acq425);
        off.enabled = false;
        CarrierConfig::new("acq2106_064", CarrierKind::Acq2106)
            .with_module(ModuleConfig::new(3, ModuleFamily::Acq480))
            .with_module(off)
            .with_module(ModuleConfig::new(1, ModuleFamily::Acq480))
    }

    #[test]
    fn clock_plans_exist_only_on_acq2106() {
        assert_eq!(CarrierKind::Acq2106.clock_plan(50_000_000).as_deref(), Some("50M"));
        assert_eq!(CarrierKind::Acq2106.clock_plan(10_000_000).as_deref(), Some("10M"));
        assert_eq!(CarrierKind::Acq2106.clock_plan(16_000_000), None);
        assert_eq!(CarrierKind::Acq1001.clock_plan(50_000_000), None);
    }

    #[test]
    fn modules_are_ordered_and_channels_numbered() {
        let carrier = Carrier::from_config(&config()).unwrap();
        let sites: Vec<u8> = carrier.modules().iter().map(|m| m.site()).collect();
        assert_eq!(sites, vec![1, 2, 3]);
        assert_eq!(carrier.enabled_modules().len(), 2);

        let channels = carrier.channels();
        assert_eq!(channels.len(), 8 + 16 + 8);
        assert_eq!(channels[8].site, 2);
        assert!(!channels[8].enabled);
        assert_eq!(channels[24].number, 25);
        assert_eq!(channels[24].site, 3);
        assert!(carrier.master().is_ok());
        assert!(!carrier.is_generator());
    }

    #[test]
    fn endpoints_follow_port_map() {
        let carrier = Carrier::from_config(&config()).unwrap();
        assert_eq!(carrier.state_endpoint().port, 2235);
        assert_eq!(carrier.data_endpoint(3).port, 53003);
        assert_eq!(carrier.stream_endpoint(1).port, 4211);
        assert_eq!(carrier.module(3).unwrap().client().endpoint().port, 4223);
    }

    #[test]
    fn transient_commit_is_one_chain() {
        let lines = TriggerSetup { pre: 1000, post: 5000, soft: false }.transient_commands();
        assert_eq!(
            lines,
            vec![
                "transient DEMUX=1",
                "TRANSIENT:PRE 1000",
                "TRANSIENT:POST 5000",
                "TRANSIENT:OSAM 1",
                "TRANSIENT:SOFT_TRIGGER 1",
                "TRANSIENT:REPEAT 0",
                "TRANSIENT 1",
            ]
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CarrierConfig::new("", CarrierKind::Acq1001);
        let err = Carrier::from_config(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
    }
}
