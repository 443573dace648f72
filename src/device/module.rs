//! Plug-in modules.
//!
//! A [`Module`] is one site of a carrier: a family tag, its configuration and the
//! command client of its site port. Family specifics (channel count, per-channel
//! settings, master duties, clock divisors) are expressed by matching on
//! [`ModuleFamily`].

use crate::config::{ChannelConfig, ModuleConfig};
use crate::error::{AppResult, DaqError};
use crate::knob::schema::{acq425, acq480, ao420, module as common};
use crate::knob::{CommandClient, KnobSchema, KnobType};
use crate::storage::Calibration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Upper bound for the ACQ480 FIR reload.
const FIR_RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Module family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFamily {
    /// 16-channel transient recorder.
    Acq425,
    /// 8-channel transient recorder with FIR decimation.
    Acq480,
    /// 4-channel waveform generator.
    Ao420,
}

impl ModuleFamily {
    /// ACQ480 FIR decimation per FIR mode.
    pub const FIR_DECIM: [u64; 11] = [1, 2, 2, 4, 4, 4, 4, 2, 4, 8, 1];

    /// Motherboard clock used by fixed-clock families.
    pub const MB_CLOCK_HZ: u64 = 50_000_000;

    /// Channels per module.
    pub fn channel_count(self) -> usize {
        match self {
            ModuleFamily::Acq425 => 16,
            ModuleFamily::Acq480 => 8,
            ModuleFamily::Ao420 => 4,
        }
    }

    /// Whether the module outputs rather than records.
    pub fn is_generator(self) -> bool {
        matches!(self, ModuleFamily::Ao420)
    }

    /// Knob table of the family.
    pub fn schema(self) -> &'static KnobSchema {
        match self {
            ModuleFamily::Acq425 => &acq425::SCHEMA,
            ModuleFamily::Acq480 => &acq480::SCHEMA,
            ModuleFamily::Ao420 => &ao420::SCHEMA,
        }
    }

    /// Gain used for channels that do not configure one.
    pub fn default_gain(self) -> f64 {
        match self {
            ModuleFamily::Acq425 => 1.0,
            ModuleFamily::Acq480 => 0.0,
            ModuleFamily::Ao420 => 100.0,
        }
    }

    /// Motherboard clock needed for `clock_hz`.
    pub fn mb_clock_hz(self, clock_hz: u64, fir: usize, fpga_decim: u64) -> u64 {
        match self {
            ModuleFamily::Acq425 | ModuleFamily::Ao420 => Self::MB_CLOCK_HZ,
            ModuleFamily::Acq480 => {
                let fir_decim = Self::FIR_DECIM.get(fir).copied().unwrap_or(1);
                fir_decim * fpga_decim * clock_hz
            }
        }
    }

    /// Divisor from the motherboard clock down to the sample clock.
    pub fn clock_divisor(self, mb_set_hz: u64, clock_hz: u64) -> u64 {
        (mb_set_hz / clock_hz.max(1)).max(1)
    }

    /// Samples to drop after each event marker.
    pub fn skip(self, fpga_decim: u64) -> usize {
        match (self, fpga_decim) {
            (ModuleFamily::Acq480, 10) => 9,
            _ => 0,
        }
    }

    /// Per-channel setup lines for `channels` (index 0 is channel 1).
    pub fn channel_commands(self, channels: &[ChannelConfig]) -> Vec<String> {
        let gain = |c: &ChannelConfig| c.gain.unwrap_or_else(|| self.default_gain());
        let mut lines = Vec::new();
        for (idx, channel) in channels.iter().enumerate() {
            let ch = idx + 1;
            match self {
                ModuleFamily::Acq425 => {
                    lines.push(format!("{} {}V", acq425::GAIN.path(ch), gain(channel).round() as i64));
                }
                ModuleFamily::Acq480 => {
                    lines.push(format!("{} {}", acq480::GAIN.path(ch), (gain(channel).round() as i64).encode()));
                    lines.push(format!("{} {}", acq480::INVERT.path(ch), channel.invert.encode()));
                    lines.push(format!("{} {}", acq480::HPF.path(ch), channel.hpf.encode()));
                    lines.push(format!("{} {}", acq480::LFNS.path(ch), channel.lfns.encode()));
                    lines.push(format!("{} {}", acq480::T50R.path(ch), channel.t50r.encode()));
                }
                ModuleFamily::Ao420 => {
                    let (range, g, d) = ao420_levels(gain(channel), channel.offset);
                    lines.push(format!("{} {}", ao420::GAIN_CH.path(ch), range.encode()));
                    lines.push(format!("{} {}", ao420::G.path(ch), g.encode()));
                    lines.push(format!("{} {}", ao420::D.path(ch), d.encode()));
                }
            }
        }
        lines
    }
}

impl fmt::Display for ModuleFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleFamily::Acq425 => "acq425",
            ModuleFamily::Acq480 => "acq480",
            ModuleFamily::Ao420 => "ao420",
        };
        write!(f, "{}", name)
    }
}

/// Encode AO420 gain and offset (percent) into range flag, G and D codes.
///
/// When `gain + |offset|` exceeds 100 % the doubled output range is selected and both
/// values are halved.
pub fn ao420_levels(gain: f64, offset: f64) -> (bool, i64, i64) {
    let (double, gain, offset) = if gain + offset.abs() > 100.0 {
        (true, gain / 2.0, offset / 2.0)
    } else {
        (false, gain, offset)
    };
    let g = (gain.clamp(0.0, 100.0) * 32767.0 / 100.0).round() as i64;
    let d = (offset.clamp(-100.0, 100.0) * 32767.0 / 100.0).round() as i64;
    (double, g, d)
}

/// Trigger mode of the master module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// One trigger starts the capture.
    #[default]
    Normal,
    /// Gate-controlled capture.
    Rgm,
    /// Fixed-length burst per trigger.
    Rtm,
}

impl TriggerMode {
    /// Device code of the mode.
    pub fn code(self) -> i64 {
        match self {
            TriggerMode::Normal => 0,
            TriggerMode::Rgm => 2,
            TriggerMode::Rtm => 3,
        }
    }

    /// Whether event samples are embedded in the data.
    pub fn embeds_events(self) -> bool {
        self != TriggerMode::Normal
    }
}

/// Timing established by the master during init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timebase {
    /// Motherboard clock.
    pub mb_set_hz: u64,
    /// Sample clock.
    pub clock_hz: u64,
    /// Divisor programmed into the master.
    pub clkdiv: u64,
    /// FPGA decimation; clock counts per sample in event markers.
    pub fpga_decim: u64,
    /// FIR decimation.
    pub fir_decim: u64,
    /// Samples dropped after each event marker.
    pub skip: usize,
    /// Whether event samples are embedded.
    pub events_embedded: bool,
}

impl Timebase {
    /// Sample period in ns.
    pub fn dt_ns(&self) -> f64 {
        1e9 / self.clock_hz.max(1) as f64
    }
}

/// One channel of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// 1-based number on the carrier.
    pub number: usize,
    /// 1-based number within the module.
    pub index: usize,
    /// Site of the owning module.
    pub site: u8,
    /// Whether the channel is stored.
    pub enabled: bool,
}

/// One plug-in module.
#[derive(Debug)]
pub struct Module {
    config: ModuleConfig,
    client: CommandClient,
    first_channel: usize,
    fpga_decim: Mutex<Option<u64>>,
}

impl Module {
    /// Wrap `client` (the site's command client); channel 1 of the module is carrier
    /// channel `first_channel`.
    pub fn new(config: ModuleConfig, client: CommandClient, first_channel: usize) -> Self {
        Self {
            config,
            client,
            first_channel,
            fpga_decim: Mutex::new(None),
        }
    }

    /// Site number.
    pub fn site(&self) -> u8 {
        self.config.site
    }

    /// Module family.
    pub fn family(&self) -> ModuleFamily {
        self.config.family
    }

    /// Module configuration.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Command client of the site.
    pub fn client(&self) -> &CommandClient {
        &self.client
    }

    /// Whether the module takes part in captures.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Site 1 owns the global clock and trigger.
    pub fn is_master(&self) -> bool {
        self.config.site == 1
    }

    /// Channels of the module.
    pub fn channels(&self) -> Vec<Channel> {
        (1..=self.family().channel_count())
            .map(|index| Channel {
                number: self.first_channel + index - 1,
                index,
                site: self.site(),
                enabled: self.config.enabled && self.config.channel(index).enabled,
            })
            .collect()
    }

    fn channel_settings(&self) -> Vec<ChannelConfig> {
        (1..=self.family().channel_count())
            .map(|ch| self.config.channel(ch))
            .collect()
    }

    /// Configure the module: shot, sample width and per-channel settings in one chain.
    pub async fn init(&self, shot: u64) -> AppResult<()> {
        let mut lines = vec![
            format!("{} {}", common::SHOT.path(), shot),
            format!("{} {}", common::DATA32.path(), false.encode()),
        ];
        lines.extend(self.family().channel_commands(&self.channel_settings()));
        let span = tracing::info_span!("module_init", site = self.site(), family = %self.family());
        self.client.chain(lines).instrument(span).await?;
        tracing::debug!(site = self.site(), family = %self.family(), "module configured");
        Ok(())
    }

    /// FPGA decimation, read from the device once (ACQ480) or 1.
    pub async fn fpga_decim(&self) -> AppResult<u64> {
        if self.family() != ModuleFamily::Acq480 {
            return Ok(1);
        }
        if let Some(decim) = *self.fpga_decim.lock() {
            return Ok(decim);
        }
        let decim = self.client.get(&acq480::FPGA_DECIM).await?.max(1) as u64;
        *self.fpga_decim.lock() = Some(decim);
        Ok(decim)
    }

    /// Motherboard clock this module needs for `clock_hz`.
    pub async fn mb_clock_hz(&self, clock_hz: u64) -> AppResult<u64> {
        let fpga = self.fpga_decim().await?;
        Ok(self.family().mb_clock_hz(clock_hz, self.config.fir, fpga))
    }

    fn routing_commands(&self, pre: u64, soft: bool) -> Vec<String> {
        let flag = |b: bool| i64::from(b);
        vec![
            format!("{} {}", common::SAMPLE_COUNT_RESET.path(), true.encode()),
            format!("{} {}", common::TRG.path(), vec![1, flag(pre > 0 || soft), 1].encode()),
            format!("{} {}", common::EVENT0.path(), vec![flag(pre > 0), flag(soft), 1].encode()),
            format!("{} {}", common::CLK.path(), vec![1i64, 1, 1].encode()),
        ]
    }

    /// Lines the master sends in its routing chain.
    pub fn master_commands(&self, pre: u64, soft: bool, clkdiv: u64, fpga_decim: u64) -> Vec<String> {
        let mode = self.config.trigger_mode;
        let events = mode.embeds_events();
        match self.family() {
            ModuleFamily::Ao420 => {
                let mut lines = self.routing_commands(0, soft);
                lines.push(format!("{} {}", common::CLKDIV.path(), clkdiv));
                lines.push(format!("{} {}", common::EVENT1.path(), vec![0i64, 0, 0].encode()));
                lines
            }
            family @ (ModuleFamily::Acq425 | ModuleFamily::Acq480) => {
                // the stream of gated modes is started by the soft trigger line
                let mut lines = self.routing_commands(pre, soft || events);
                if mode == TriggerMode::Rtm {
                    lines.push(format!(
                        "{} {}",
                        common::RTM_TRANSLEN.path(),
                        self.config.rtm_translen * fpga_decim
                    ));
                }
                lines.push(format!(
                    "{} {}",
                    common::RGM.path(),
                    vec![mode.code(), i64::from(soft), 1].encode()
                ));
                lines.push(format!("{} {}", common::ES_ENABLE.path(), events.encode()));
                if family == ModuleFamily::Acq480 {
                    let fir = self.config.fir as i64;
                    lines.push(format!("{} {}", acq480::FIR.path(1), i64::from(fir == 0)));
                    lines.push(format!("{} {}", acq480::FIR.path(1), fir));
                }
                lines
            }
        }
    }

    /// Program clock, trigger and event routing on the master module.
    ///
    /// `settle` is the pause the ACQ425 needs between routing and the clock divisor,
    /// and the poll interval while the ACQ480 FIR reloads.
    pub async fn init_master(
        &self,
        pre: u64,
        soft: bool,
        clock_hz: u64,
        mb_set_hz: u64,
        settle: Duration,
    ) -> AppResult<Timebase> {
        if !self.is_master() {
            return Err(DaqError::InvalidSetup(format!(
                "site {} is not the master",
                self.site()
            )));
        }
        let family = self.family();
        let clkdiv = family.clock_divisor(mb_set_hz, clock_hz);
        let fpga = self.fpga_decim().await?;
        let events = family != ModuleFamily::Ao420 && self.config.trigger_mode.embeds_events();
        let mut fir_decim = 1;

        self.client
            .chain(self.master_commands(pre, soft, clkdiv, fpga))
            .await?;

        match family {
            ModuleFamily::Acq425 => {
                tokio::time::sleep(settle).await;
                self.client.set(&common::CLKDIV, &(clkdiv as i64)).await?;
            }
            ModuleFamily::Acq480 => {
                self.wait_fir_reload(settle).await?;
                fir_decim = self.client.get(&acq480::FIR_DECIM).await?.max(1) as u64;
                let bus = clock_hz * fpga;
                if bus < 10_000_000 {
                    return Err(DaqError::InvalidSetup(format!(
                        "bus clock must be at least 10MHz, is {} Hz ({} Hz * {})",
                        bus, clock_hz, fpga
                    )));
                }
                let adc = bus * fir_decim;
                if adc > 80_000_000 {
                    return Err(DaqError::InvalidSetup(format!(
                        "ADC clock cannot exceed 80MHz, is {} Hz ({} Hz * {} * {})",
                        adc, clock_hz, fpga, fir_decim
                    )));
                }
            }
            ModuleFamily::Ao420 => {}
        }

        let timebase = Timebase {
            mb_set_hz,
            clock_hz,
            clkdiv,
            fpga_decim: fpga,
            fir_decim,
            skip: family.skip(fpga),
            events_embedded: events,
        };
        tracing::info!(site = self.site(), ?timebase, "master configured");
        Ok(timebase)
    }

    /// Poll until the FIR decimation leaves the value the intermediate FIR write left.
    async fn wait_fir_reload(&self, poll: Duration) -> AppResult<()> {
        let transient = 1i64 << i64::from(self.config.fir == 0);
        let deadline = Instant::now() + FIR_RELOAD_TIMEOUT;
        loop {
            if self.client.get(&acq480::FIR_DECIM).await? != transient {
                return Ok(());
            }
            if Instant::now() >= deadline {
                // FIR modes whose decimation equals the transient value never change it
                tracing::warn!(site = self.site(), fir = self.config.fir, "FIR decimation did not change");
                return Ok(());
            }
            tokio::time::sleep(poll.min(Duration::from_millis(200))).await;
        }
    }

    /// Per-channel calibration, config overrides applied.
    ///
    /// Recorders report `AI:CAL:ESLO`/`AI:CAL:EOFF` lists whose first element is a
    /// header; generators and missing entries fall back to identity.
    pub async fn calibration(&self) -> AppResult<Vec<Calibration>> {
        let count = self.family().channel_count();
        let (slopes, offsets) = if self.family().is_generator() {
            (Vec::new(), Vec::new())
        } else {
            let slopes = self.client.get(&common::CAL_ESLO).await?;
            let offsets = self.client.get(&common::CAL_EOFF).await?;
            (
                slopes.into_iter().skip(1).collect::<Vec<_>>(),
                offsets.into_iter().skip(1).collect::<Vec<_>>(),
            )
        };
        Ok((0..count)
            .map(|idx| {
                let channel = self.config.channel(idx + 1);
                Calibration::new(
                    channel.slope.or_else(|| slopes.get(idx).copied()).unwrap_or(1.0),
                    channel.intercept.or_else(|| offsets.get(idx).copied()).unwrap_or(0.0),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;

    fn module(family: ModuleFamily, site: u8) -> Module {
        let mut config = ModuleConfig::new(site, family);
        config.trigger_mode = TriggerMode::Rtm;
        config.rtm_translen = 1000;
        let client = CommandClient::new(Endpoint::new("127.0.0.1", 9), site, family.schema());
        Module::new(config, client, 1)
    }

    #[test]
    fn ao420_levels_halve_when_over_range() {
        assert_eq!(ao420_levels(100.0, 0.0), (false, 32767, 0));
        assert_eq!(ao420_levels(50.0, -10.0), (false, 16384, -3277));
        let (double, g, d) = ao420_levels(100.0, 20.0);
        assert!(double);
        assert_eq!((g, d), (16384, 3277));
    }

    #[test]
    fn channel_commands_per_family() {
        let acq425 = ModuleFamily::Acq425.channel_commands(&[ChannelConfig::default()]);
        assert_eq!(acq425, vec!["GAIN:01 1V"]);

        let mut ch = ChannelConfig::default();
        ch.gain = Some(6.0);
        ch.invert = true;
        let acq480 = ModuleFamily::Acq480.channel_commands(&[ch]);
        assert_eq!(
            acq480,
            vec![
                "ACQ480:GAIN:01 6",
                "ACQ480:INVERT:01 1",
                "ACQ480:HPF:01 0",
                "ACQ480:LFNS:01 0",
                "ACQ480:T50R:01 0"
            ]
        );

        let ao = ModuleFamily::Ao420.channel_commands(&[ChannelConfig::default()]);
        assert_eq!(ao, vec!["AO:GAIN:CH:1 0", "G1 32767", "D1 0"]);
    }

    #[test]
    fn clock_tables() {
        assert_eq!(ModuleFamily::Acq425.mb_clock_hz(1_000_000, 0, 1), 50_000_000);
        assert_eq!(ModuleFamily::Acq480.mb_clock_hz(2_000_000, 9, 1), 16_000_000);
        assert_eq!(ModuleFamily::Acq425.clock_divisor(50_000_000, 1_000_000), 50);
        assert_eq!(ModuleFamily::Acq480.skip(10), 9);
        assert_eq!(ModuleFamily::Acq480.skip(4), 0);
        assert_eq!(ModuleFamily::Acq425.skip(10), 0);
    }

    #[test]
    fn master_chain_for_gated_recorder() {
        let m = module(ModuleFamily::Acq425, 1);
        let lines = m.master_commands(0, false, 50, 1);
        assert_eq!(
            lines,
            vec![
                "SIG:sample_count:RESET 1",
                "trg 1,1,1",
                "event0 0,1,1",
                "clk 1,1,1",
                "rtm_translen 1000",
                "rgm 3,0,1",
                "es_enable 1",
            ]
        );
    }

    #[test]
    fn generator_master_is_soft_only() {
        let m = module(ModuleFamily::Ao420, 1);
        let lines = m.master_commands(500, true, 50, 1);
        assert_eq!(lines[1], "trg 1,1,1");
        assert_eq!(lines[2], "event0 0,1,1");
        assert_eq!(&lines[4..], &["clkdiv 50".to_string(), "event1 0,0,0".to_string()]);
    }

    #[test]
    fn channels_are_numbered_on_the_carrier() {
        let mut config = ModuleConfig::new(2, ModuleFamily::Acq480);
        let mut off = ChannelConfig::default();
        off.enabled = false;
        config.channels = vec![ChannelConfig::default(), off];
        let client = CommandClient::new(Endpoint::new("127.0.0.1", 9), 2, &acq480::SCHEMA);
        let m = Module::new(config, client, 17);
        let channels = m.channels();
        assert_eq!(channels.len(), 8);
        assert_eq!(channels[0].number, 17);
        assert!(!channels[1].enabled);
        assert_eq!(channels[7].number, 24);
    }
}
