//! Per-family knob tables.
//!
//! Every knob the crate touches is declared once here as a typed constant. The
//! constants carry the wire path, the value type and an access class; the
//! [`KnobSchema`] tables group them per device family so the client can answer
//! questions such as "is this command an executable?" without string matching
//! scattered through the lifecycle code.
//!
//! Knobs that exist once per channel (`ACQ480:GAIN:03`, `G2`, ...) are declared as
//! [`IndexedKnob`]s and expanded with [`IndexedKnob::path`].

use super::value::{KnobKind, KnobType};
use std::marker::PhantomData;

/// How a knob may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Query only.
    ReadOnly,
    /// Query and set.
    ReadWrite,
    /// One-shot command. Never recorded in the settings cache.
    Exec,
}

/// Untyped description of a knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnobSpec {
    /// Wire path, `:`-joined.
    pub path: &'static str,
    /// Declared value type.
    pub kind: KnobKind,
    /// Access class.
    pub access: Access,
}

/// A typed knob.
pub struct Knob<T> {
    spec: KnobSpec,
    _value: PhantomData<fn() -> T>,
}

impl<T: KnobType> Knob<T> {
    const fn declare(path: &'static str, access: Access) -> Self {
        Self {
            spec: KnobSpec {
                path,
                kind: T::KIND,
                access,
            },
            _value: PhantomData,
        }
    }

    /// Read-only knob.
    pub const fn ro(path: &'static str) -> Self {
        Self::declare(path, Access::ReadOnly)
    }

    /// Read-write knob.
    pub const fn rw(path: &'static str) -> Self {
        Self::declare(path, Access::ReadWrite)
    }

    /// Executable command.
    pub const fn exec(path: &'static str) -> Self {
        Self::declare(path, Access::Exec)
    }
}

impl<T> Knob<T> {
    /// Wire path.
    pub fn path(&self) -> &'static str {
        self.spec.path
    }

    /// Untyped description.
    pub fn spec(&self) -> KnobSpec {
        self.spec
    }
}

impl<T> Clone for Knob<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Knob<T> {}

impl<T> std::fmt::Debug for Knob<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Knob({})", self.spec.path)
    }
}

/// Untyped description of a per-channel knob family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedSpec {
    /// Path up to the index.
    pub prefix: &'static str,
    /// Text between prefix and index (`":"` or empty).
    pub separator: &'static str,
    /// Zero-padded width of the index, 0 for none.
    pub width: usize,
    /// Declared value type.
    pub kind: KnobKind,
    /// Access class.
    pub access: Access,
}

impl IndexedSpec {
    fn matches(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix)
            .and_then(|rest| rest.strip_prefix(self.separator))
            .map(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    }
}

/// A typed knob that exists once per channel.
pub struct IndexedKnob<T> {
    spec: IndexedSpec,
    _value: PhantomData<fn() -> T>,
}

impl<T: KnobType> IndexedKnob<T> {
    /// Declare a read-write per-channel knob.
    pub const fn rw(prefix: &'static str, separator: &'static str, width: usize) -> Self {
        Self {
            spec: IndexedSpec {
                prefix,
                separator,
                width,
                kind: T::KIND,
                access: Access::ReadWrite,
            },
            _value: PhantomData,
        }
    }
}

impl<T> IndexedKnob<T> {
    /// Path for channel `index`.
    pub fn path(&self, index: usize) -> String {
        format!(
            "{}{}{:0width$}",
            self.spec.prefix,
            self.spec.separator,
            index,
            width = self.spec.width
        )
    }

    /// Untyped description.
    pub fn spec(&self) -> IndexedSpec {
        self.spec
    }
}

impl<T> Clone for IndexedKnob<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for IndexedKnob<T> {}

impl<T> std::fmt::Debug for IndexedKnob<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IndexedKnob({}{}N)", self.spec.prefix, self.spec.separator)
    }
}

/// What the schema knows about one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// A plain knob.
    Plain(KnobSpec),
    /// A member of a per-channel family.
    Indexed(IndexedSpec),
}

impl Resolved {
    /// Access class of the resolved knob.
    pub fn access(&self) -> Access {
        match self {
            Resolved::Plain(spec) => spec.access,
            Resolved::Indexed(spec) => spec.access,
        }
    }
}

/// The knob table of one device family.
#[derive(Debug)]
pub struct KnobSchema {
    /// Family label used in logs.
    pub family: &'static str,
    groups: &'static [&'static [KnobSpec]],
    indexed: &'static [IndexedSpec],
}

impl KnobSchema {
    /// Resolve a path (or the first token of a request line).
    pub fn lookup(&self, path: &str) -> Option<Resolved> {
        let name = path.split_whitespace().next().unwrap_or("");
        self.groups
            .iter()
            .flat_map(|group| group.iter())
            .find(|spec| spec.path == name)
            .map(|spec| Resolved::Plain(*spec))
            .or_else(|| {
                self.indexed
                    .iter()
                    .find(|spec| spec.matches(name))
                    .map(|spec| Resolved::Indexed(*spec))
            })
    }

    /// Whether a command line should be kept out of the settings audit.
    ///
    /// Executables, transient reads (`state`, `shot`) and counter resets are
    /// excluded.
    pub fn is_volatile(&self, line: &str) -> bool {
        let name = line.split_whitespace().next().unwrap_or("");
        if name.is_empty() || TRANSIENT_READS.contains(&name) || name.ends_with(":RESET") {
            return true;
        }
        matches!(self.lookup(name).map(|r| r.access()), Some(Access::Exec))
    }

    /// Number of declared plain knobs.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    /// Whether the schema declares no plain knobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const TRANSIENT_READS: &[&str] = &["state", "shot"];

/// Carrier knobs (site 0).
pub mod carrier {
    use super::*;

    /// Status line, same layout as the state stream.
    pub const STATE: Knob<String> = Knob::ro("state");
    /// Shot counter.
    pub const SHOT: Knob<i64> = Knob::rw("shot");
    /// Arm the capture engine.
    pub const SET_ARM: Knob<()> = Knob::exec("set_arm");
    /// Abort the current capture.
    pub const SET_ABORT: Knob<()> = Knob::exec("set_abort");
    /// Fire the internal trigger line.
    pub const SOFT_TRIGGER: Knob<()> = Knob::exec("soft_trigger");
    /// Aggregator site list for recorders.
    pub const RUN0: Knob<Vec<i64>> = Knob::exec("run0");
    /// Distributor site list for generators.
    pub const PLAY0: Knob<Vec<i64>> = Knob::exec("play0");
    /// Reboot with the given magic.
    pub const REBOOT: Knob<i64> = Knob::exec("reboot");
    /// Transient settings shorthand (`DEMUX=1`, ...).
    pub const TRANSIENT_SHORTHAND: Knob<String> = Knob::rw("transient");
    /// Commit the transient settings.
    pub const TRANSIENT: Knob<bool> = Knob::rw("TRANSIENT");
    /// Pre-trigger samples.
    pub const TRANSIENT_PRE: Knob<i64> = Knob::rw("TRANSIENT:PRE");
    /// Post-trigger samples.
    pub const TRANSIENT_POST: Knob<i64> = Knob::rw("TRANSIENT:POST");
    /// Sub-rate monitoring.
    pub const TRANSIENT_OSAM: Knob<i64> = Knob::rw("TRANSIENT:OSAM");
    /// Issue a soft trigger when armed.
    pub const TRANSIENT_SOFT_TRIGGER: Knob<bool> = Knob::rw("TRANSIENT:SOFT_TRIGGER");
    /// Shots before the engine aborts itself.
    pub const TRANSIENT_REPEAT: Knob<i64> = Knob::rw("TRANSIENT:REPEAT");
    /// Arm request.
    pub const TRANSIENT_SET_ARM: Knob<bool> = Knob::exec("TRANSIENT:SET_ARM");
    /// Abort request.
    pub const TRANSIENT_SET_ABORT: Knob<bool> = Knob::exec("TRANSIENT:SET_ABORT");
    /// Streaming control (`start`/`stop`).
    pub const CONTINUOUS: Knob<String> = Knob::exec("CONTINUOUS");
    /// Null-copy streaming daemon (`start`/`stop`).
    pub const STREAMTONOWHERED: Knob<String> = Knob::exec("streamtonowhered");
    /// Streaming daemon options.
    pub const STREAM_OPTS: Knob<String> = Knob::rw("STREAM_OPTS");
    /// Streaming oversampling.
    pub const OVERSAMPLING: Knob<i64> = Knob::rw("OVERSAMPLING");
    /// Live scope mode (1 free-run, 2 pre/post).
    pub const LIVE_MODE: Knob<i64> = Knob::rw("live_mode");
    /// Live scope pre samples.
    pub const LIVE_PRE: Knob<i64> = Knob::rw("live_pre");
    /// Live scope post samples.
    pub const LIVE_POST: Knob<i64> = Knob::rw("live_post");
    /// Internal clock source selector.
    pub const SIG_ZCLK_SRC: Knob<i64> = Knob::rw("SIG:ZCLK_SRC");
    /// Front panel clock mux (`ZCLK`, `FPCLK`, ...).
    pub const SYS_CLK_FPMUX: Knob<String> = Knob::rw("SYS:CLK:FPMUX");
    /// Clock line sources.
    pub const SIG_SRC_CLK: IndexedKnob<i64> = IndexedKnob::rw("SIG:SRC:CLK", ":", 0);
    /// Trigger line sources.
    pub const SIG_SRC_TRG: IndexedKnob<i64> = IndexedKnob::rw("SIG:SRC:TRG", ":", 0);
    /// Motherboard clock input frequency.
    pub const SIG_CLK_MB_FIN: Knob<i64> = Knob::rw("SIG:CLK_MB:FIN");
    /// Motherboard clock output frequency.
    pub const SIG_CLK_MB_SET: Knob<i64> = Knob::rw("SIG:CLK_MB:SET");
    /// Front panel trigger direction.
    pub const SIG_FP_TRG: Knob<String> = Knob::rw("SIG:FP:TRG");
    /// Jitter cleaner bypass.
    pub const SYS_CLK_BYPASS: Knob<i64> = Knob::rw("SYS:CLK:BYPASS");
    /// Jitter cleaner plan (`50M`, ...).
    pub const SYS_CLK_PLAN: Knob<String> = Knob::rw("SYS:CLK:Si5326:PLAN");
    /// Current jitter cleaner configuration.
    pub const SYS_CLK_CONFIG: Knob<String> = Knob::ro("SYS:CLK:CONFIG");
    /// Clock output enable towards the FPGA.
    pub const SYS_CLK_OE_CLK1_ZYNQ: Knob<i64> = Knob::rw("SYS:CLK:OE_CLK1_ZYNQ");
    /// Jitter cleaner loss of lock.
    pub const SYS_CLK_LOL: Knob<bool> = Knob::ro("SYS:CLK:LOL");

    const TABLE: &[KnobSpec] = &[
        STATE.spec,
        SHOT.spec,
        SET_ARM.spec,
        SET_ABORT.spec,
        SOFT_TRIGGER.spec,
        RUN0.spec,
        PLAY0.spec,
        REBOOT.spec,
        TRANSIENT_SHORTHAND.spec,
        TRANSIENT.spec,
        TRANSIENT_PRE.spec,
        TRANSIENT_POST.spec,
        TRANSIENT_OSAM.spec,
        TRANSIENT_SOFT_TRIGGER.spec,
        TRANSIENT_REPEAT.spec,
        TRANSIENT_SET_ARM.spec,
        TRANSIENT_SET_ABORT.spec,
        CONTINUOUS.spec,
        STREAMTONOWHERED.spec,
        STREAM_OPTS.spec,
        OVERSAMPLING.spec,
        LIVE_MODE.spec,
        LIVE_PRE.spec,
        LIVE_POST.spec,
        SIG_ZCLK_SRC.spec,
        SYS_CLK_FPMUX.spec,
        SIG_CLK_MB_FIN.spec,
        SIG_CLK_MB_SET.spec,
        SIG_FP_TRG.spec,
        SYS_CLK_BYPASS.spec,
        SYS_CLK_PLAN.spec,
        SYS_CLK_CONFIG.spec,
        SYS_CLK_OE_CLK1_ZYNQ.spec,
        SYS_CLK_LOL.spec,
    ];

    /// Carrier schema.
    pub static SCHEMA: KnobSchema = KnobSchema {
        family: "carrier",
        groups: &[TABLE],
        indexed: &[SIG_SRC_CLK.spec, SIG_SRC_TRG.spec],
    };
}

/// Knobs shared by every module site.
pub mod module {
    use super::*;

    /// Shot counter.
    pub const SHOT: Knob<i64> = Knob::rw("shot");
    /// 32-bit sample words.
    pub const DATA32: Knob<bool> = Knob::rw("data32");
    /// Channel count.
    pub const NCHAN: Knob<i64> = Knob::ro("NCHAN");
    /// Module model name.
    pub const MODULE_NAME: Knob<String> = Knob::ro("module_name");
    /// Reset the sample counter.
    pub const SAMPLE_COUNT_RESET: Knob<bool> = Knob::exec("SIG:sample_count:RESET");
    /// Trigger routing triple (enable, source line, sense).
    pub const TRG: Knob<Vec<i64>> = Knob::rw("trg");
    /// Event 0 routing triple.
    pub const EVENT0: Knob<Vec<i64>> = Knob::rw("event0");
    /// Event 1 routing triple.
    pub const EVENT1: Knob<Vec<i64>> = Knob::rw("event1");
    /// Clock routing triple.
    pub const CLK: Knob<Vec<i64>> = Knob::rw("clk");
    /// Gated mode routing triple (mode, source line, sense).
    pub const RGM: Knob<Vec<i64>> = Knob::rw("rgm");
    /// Samples per trigger in RTM mode.
    pub const RTM_TRANSLEN: Knob<i64> = Knob::rw("rtm_translen");
    /// Embed event samples in the data.
    pub const ES_ENABLE: Knob<bool> = Knob::rw("es_enable");
    /// Sample clock divisor.
    pub const CLKDIV: Knob<i64> = Knob::rw("clkdiv");
    /// Calibration slopes, first element is a header.
    pub const CAL_ESLO: Knob<Vec<f64>> = Knob::ro("AI:CAL:ESLO");
    /// Calibration offsets, first element is a header.
    pub const CAL_EOFF: Knob<Vec<f64>> = Knob::ro("AI:CAL:EOFF");

    pub(super) const COMMON: &[KnobSpec] = &[
        SHOT.spec,
        DATA32.spec,
        NCHAN.spec,
        MODULE_NAME.spec,
        SAMPLE_COUNT_RESET.spec,
        TRG.spec,
        EVENT0.spec,
        EVENT1.spec,
        CLK.spec,
        RGM.spec,
        RTM_TRANSLEN.spec,
        ES_ENABLE.spec,
        CLKDIV.spec,
        CAL_ESLO.spec,
        CAL_EOFF.spec,
    ];
}

/// ACQ425 16-channel recorder.
pub mod acq425 {
    use super::*;

    /// Per-channel input range, sent as `<volts>V`.
    pub const GAIN: IndexedKnob<String> = IndexedKnob::rw("GAIN", ":", 2);

    /// ACQ425 schema.
    pub static SCHEMA: KnobSchema = KnobSchema {
        family: "acq425",
        groups: &[module::COMMON],
        indexed: &[GAIN.spec],
    };
}

/// ACQ480 8-channel recorder.
pub mod acq480 {
    use super::*;

    /// Per-channel gain in dB.
    pub const GAIN: IndexedKnob<i64> = IndexedKnob::rw("ACQ480:GAIN", ":", 2);
    /// Per-channel inversion.
    pub const INVERT: IndexedKnob<bool> = IndexedKnob::rw("ACQ480:INVERT", ":", 2);
    /// Per-channel high-pass filter.
    pub const HPF: IndexedKnob<i64> = IndexedKnob::rw("ACQ480:HPF", ":", 2);
    /// Per-channel low-frequency noise suppression.
    pub const LFNS: IndexedKnob<i64> = IndexedKnob::rw("ACQ480:LFNS", ":", 2);
    /// Per-channel 50 ohm termination.
    pub const T50R: IndexedKnob<bool> = IndexedKnob::rw("ACQ480:T50R", ":", 2);
    /// FIR mode per ADC pair.
    pub const FIR: IndexedKnob<i64> = IndexedKnob::rw("ACQ480:FIR", ":", 2);
    /// Effective FIR decimation.
    pub const FIR_DECIM: Knob<i64> = Knob::ro("ACQ480:FIR:DECIM");
    /// FPGA decimation.
    pub const FPGA_DECIM: Knob<i64> = Knob::rw("ACQ480:FPGA:DECIM");

    const TABLE: &[KnobSpec] = &[FIR_DECIM.spec, FPGA_DECIM.spec];

    /// ACQ480 schema.
    pub static SCHEMA: KnobSchema = KnobSchema {
        family: "acq480",
        groups: &[module::COMMON, TABLE],
        indexed: &[
            GAIN.spec,
            INVERT.spec,
            HPF.spec,
            LFNS.spec,
            T50R.spec,
            FIR.spec,
        ],
    };
}

/// AO420 4-channel waveform generator.
pub mod ao420 {
    use super::*;

    /// Output range doubling per channel.
    pub const GAIN_CH: IndexedKnob<bool> = IndexedKnob::rw("AO:GAIN:CH", ":", 0);
    /// Digital gain per channel, full scale 32767.
    pub const G: IndexedKnob<i64> = IndexedKnob::rw("G", "", 0);
    /// Digital offset per channel, full scale 32767.
    pub const D: IndexedKnob<i64> = IndexedKnob::rw("D", "", 0);

    /// AO420 schema.
    pub static SCHEMA: KnobSchema = KnobSchema {
        family: "ao420",
        groups: &[module::COMMON],
        indexed: &[GAIN_CH.spec, G.spec, D.spec],
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_paths_follow_declared_format() {
        assert_eq!(acq480::GAIN.path(3), "ACQ480:GAIN:03");
        assert_eq!(acq425::GAIN.path(12), "GAIN:12");
        assert_eq!(ao420::G.path(2), "G2");
        assert_eq!(ao420::GAIN_CH.path(4), "AO:GAIN:CH:4");
        assert_eq!(carrier::SIG_SRC_CLK.path(1), "SIG:SRC:CLK:1");
    }

    #[test]
    fn lookup_prefers_exact_paths() {
        let schema = &acq480::SCHEMA;
        assert!(matches!(
            schema.lookup("ACQ480:FIR:DECIM"),
            Some(Resolved::Plain(spec)) if spec.access == Access::ReadOnly
        ));
        assert!(matches!(
            schema.lookup("ACQ480:FIR:01 4"),
            Some(Resolved::Indexed(spec)) if spec.prefix == "ACQ480:FIR"
        ));
        assert!(schema.lookup("ACQ480:GAIN:").is_none());
        assert!(schema.lookup("GAIN:01").is_none());
    }

    #[test]
    fn executables_and_transient_reads_are_volatile() {
        let schema = &carrier::SCHEMA;
        assert!(schema.is_volatile("TRANSIENT:SET_ARM 1"));
        assert!(schema.is_volatile("run0 1,2"));
        assert!(schema.is_volatile("state"));
        assert!(schema.is_volatile("shot 12"));
        assert!(schema.is_volatile("SIG:sample_count:RESET 1"));
        assert!(!schema.is_volatile("TRANSIENT:PRE 1000"));
        assert!(!schema.is_volatile("SYS:CLK:FPMUX ZCLK"));
        assert!(!schema.is_volatile("UNDECLARED:KNOB 1"));
    }

    #[test]
    fn schemas_share_module_table() {
        assert_eq!(acq425::SCHEMA.len(), module::COMMON.len());
        assert_eq!(acq480::SCHEMA.len(), module::COMMON.len() + 2);
        assert!(!ao420::SCHEMA.is_empty());
    }
}
