//! Simulated carrier.
//!
//! [`MockCarrier`] serves every port of a real carrier on the loopback interface:
//! the state stream, one knob server per site, the per-channel data ports, the
//! streaming lanes and the waveform upload ports. It runs a small capture state
//! machine so the whole lifecycle can be exercised without hardware.
//!
//! # Behavior
//!
//! - `TRANSIENT:SET_ARM` moves `STOP` to `ARM`, unless [`MockOptions::ignore_arm`].
//! - A trigger in `ARM` runs `POST` (counting up to `TRANSIENT:POST`), `FIN1`,
//!   `FIN2` and `STOP`, one step per state period. With
//!   [`MockOptions::stick_in_fin2`] the engine parks in `FIN2` and only a direct
//!   `set_arm` followed by `set_abort` brings it back.
//! - `CONTINUOUS start` opens the streaming lanes; rows carry an event marker every
//!   [`MockOptions::marker_period`] rows when set.
//! - Data ports serve `pre + post` samples plus [`MockOptions::data_padding`], and
//!   sets listed in [`MockOptions::rejected_sets`] answer with an `ERROR` frame.
//!
//! Ports are laid out from a random base so parallel tests do not collide.

use crate::config::{CarrierConfig, ModuleConfig, PortMap, TimingConfig};
use crate::device::{CarrierKind, ModuleFamily};
use crate::state::AcqState;
use crate::streaming::marker::{EventMarker, MarkerKind, MASTER_WORD, MIN_COLUMNS};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const COMMAND_OFFSET: u16 = 1;
const STREAM_OFFSET: u16 = 10;
const DATA_OFFSET: u16 = 20;
const AWG_OFFSET: u16 = 120;
const MAX_LANES: usize = 2;
const ROWS_PER_WRITE: usize = 64;

/// Behavior of a [`MockCarrier`].
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Carrier model.
    pub kind: CarrierKind,
    /// Installed modules as `(site, family)`.
    pub modules: Vec<(u8, ModuleFamily)>,
    /// Sites per streaming lane; empty streams every recorder on lane 0.
    pub lanes: Vec<Vec<u8>>,
    /// Never leave `STOP` on an arm request.
    pub ignore_arm: bool,
    /// Park in `FIN2` after a capture.
    pub stick_in_fin2: bool,
    /// Rows between stream markers; `None` streams plain data only.
    pub marker_period: Option<usize>,
    /// Rows per lane before the stream closes.
    pub stream_rows: usize,
    /// State broadcast interval and capture step.
    pub state_period: Duration,
    /// Samples served past the capture on every data port.
    pub data_padding: usize,
    /// Knobs whose sets are answered with an error frame, as `(site, name)`.
    pub rejected_sets: Vec<(u8, String)>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            kind: CarrierKind::Acq2106,
            modules: vec![(1, ModuleFamily::Acq425)],
            lanes: Vec::new(),
            ignore_arm: false,
            stick_in_fin2: false,
            marker_period: None,
            stream_rows: 4096,
            state_period: Duration::from_millis(20),
            data_padding: 0,
            rejected_sets: Vec::new(),
        }
    }
}

/// One waveform upload received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockUpload {
    /// Whether the repeating port was used.
    pub rearm: bool,
    /// Image as received.
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Device {
    state: AcqState,
    post: u64,
    elapsed: u64,
    generation: u64,
    rearm_pending: bool,
    streaming: bool,
    knobs: HashMap<u8, HashMap<String, String>>,
    log: Vec<(u8, String)>,
    uploads: Vec<MockUpload>,
}

#[derive(Debug)]
struct Shared {
    options: MockOptions,
    device: Mutex<Device>,
}

fn seed_knobs(options: &MockOptions) -> HashMap<u8, HashMap<String, String>> {
    let mut knobs = HashMap::new();
    let carrier: HashMap<String, String> = [
        ("shot", "0"),
        ("SYS:CLK:CONFIG", "si5326_31M25-20M"),
        ("TRANSIENT:PRE", "0"),
        ("TRANSIENT:POST", "100000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    knobs.insert(0, carrier);

    for &(site, family) in &options.modules {
        let count = family.channel_count();
        let mut site_knobs = HashMap::new();
        site_knobs.insert("shot".to_string(), "0".to_string());
        site_knobs.insert("NCHAN".to_string(), count.to_string());
        site_knobs.insert("module_name".to_string(), family.to_string().to_lowercase());
        if !family.is_generator() {
            let slopes: Vec<String> = std::iter::once("0".to_string())
                .chain((0..count).map(|_| "3.0517578125e-4".to_string()))
                .collect();
            let offsets: Vec<String> = std::iter::once("0".to_string())
                .chain((0..count).map(|ch| format!("{}", ch as f64 * 1e-3)))
                .collect();
            site_knobs.insert("AI:CAL:ESLO".to_string(), slopes.join(","));
            site_knobs.insert("AI:CAL:EOFF".to_string(), offsets.join(","));
        }
        if family == ModuleFamily::Acq480 {
            site_knobs.insert("ACQ480:FPGA:DECIM".to_string(), "1".to_string());
            site_knobs.insert("ACQ480:FIR:DECIM".to_string(), "1".to_string());
        }
        knobs.insert(site, site_knobs);
    }
    knobs
}

impl Shared {
    fn knob(&self, site: u8, name: &str) -> Option<String> {
        self.device.lock().knobs.get(&site)?.get(name).cloned()
    }

    fn knob_u64(&self, site: u8, name: &str) -> u64 {
        self.knob(site, name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn status_line(&self) -> String {
        let pre = self.knob_u64(0, "TRANSIENT:PRE");
        let dev = self.device.lock();
        format!("{} {} {} {} 0", dev.state.id(), pre, dev.post, dev.elapsed)
    }

    fn sorted_modules(&self) -> Vec<(u8, ModuleFamily)> {
        let mut modules = self.options.modules.clone();
        modules.sort_by_key(|(site, _)| *site);
        modules
    }

    /// Column of `channel` among the master's channels.
    fn master_column(&self, channel: usize) -> Option<usize> {
        let mut first = 1;
        for (site, family) in self.sorted_modules() {
            if site == 1 {
                let column = channel.checked_sub(first)?;
                return (column < family.channel_count()).then_some(column);
            }
            first += family.channel_count();
        }
        None
    }

    fn lane_columns(&self, lane: usize) -> usize {
        let recorders = self
            .sorted_modules()
            .into_iter()
            .filter(|(_, family)| !family.is_generator());
        match self.options.lanes.get(lane) {
            Some(sites) => recorders
                .filter(|(site, _)| sites.contains(site))
                .map(|(_, f)| f.channel_count())
                .sum(),
            None if lane == 0 && self.options.lanes.is_empty() => {
                recorders.map(|(_, f)| f.channel_count()).sum()
            }
            None => 0,
        }
    }

    fn respond(self: &Arc<Self>, site: u8, line: &str) -> String {
        self.device.lock().log.push((site, line.to_string()));
        let (name, value) = match line.split_once(' ') {
            Some((name, value)) => (name, Some(value.trim())),
            None => (line, None),
        };
        if value.is_some()
            && self
                .options
                .rejected_sets
                .iter()
                .any(|(s, n)| *s == site && n == name)
        {
            return format!("ERROR: {} refused\n\n", name);
        }

        if site == 0 {
            match (name, value) {
                ("state", None) => return format!("{}\n\n", self.status_line()),
                ("set_arm", None) => {
                    self.force_arm();
                    return "\n".to_string();
                }
                ("set_abort", None) => {
                    self.abort();
                    return "\n".to_string();
                }
                ("soft_trigger", None) => {
                    self.trigger();
                    return "\n".to_string();
                }
                ("TRANSIENT:SET_ARM", Some(_)) => self.arm(),
                ("TRANSIENT:SET_ABORT", Some(_)) => self.abort(),
                ("CONTINUOUS", Some("start")) => self.start_stream(),
                ("CONTINUOUS", Some("stop")) => self.stop_stream(),
                ("SYS:CLK:BYPASS", Some(v)) => {
                    let config = if v == "1" {
                        CarrierKind::BYPASS_CONFIG
                    } else {
                        "si5326_31M25-20M"
                    };
                    self.store(0, "SYS:CLK:CONFIG", config);
                }
                _ => {}
            }
        } else if let (Some(rest), Some(v)) = (name.strip_prefix("ACQ480:FIR:"), value) {
            if rest != "DECIM" {
                let decim = v
                    .parse::<usize>()
                    .ok()
                    .and_then(|fir| ModuleFamily::FIR_DECIM.get(fir).copied())
                    .unwrap_or(1);
                self.store(site, "ACQ480:FIR:DECIM", &decim.to_string());
            }
        }

        match value {
            Some(v) => {
                self.store(site, name, v);
                "\n".to_string()
            }
            None => match self.knob(site, name) {
                Some(v) => format!("{} {}\n\n", name, v),
                None => format!("ERROR: unknown knob {}\n\n", name),
            },
        }
    }

    fn store(&self, site: u8, name: &str, value: &str) {
        self.device
            .lock()
            .knobs
            .entry(site)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    fn arm(&self) {
        if self.options.ignore_arm {
            return;
        }
        let mut dev = self.device.lock();
        if dev.state.is_idle() {
            dev.state = AcqState::Arm;
            dev.post = 0;
        }
    }

    fn force_arm(&self) {
        let mut dev = self.device.lock();
        if dev.state == AcqState::Fin2 {
            dev.rearm_pending = true;
            return;
        }
        drop(dev);
        self.arm();
    }

    fn abort(&self) {
        let mut dev = self.device.lock();
        if dev.state == AcqState::Fin2 && self.options.stick_in_fin2 && !dev.rearm_pending {
            return;
        }
        dev.rearm_pending = false;
        dev.generation += 1;
        dev.streaming = false;
        dev.state = AcqState::Stop;
    }

    fn trigger(self: &Arc<Self>) {
        let generation = {
            let mut dev = self.device.lock();
            if !matches!(dev.state, AcqState::Arm | AcqState::Pre) || dev.streaming {
                return;
            }
            dev.generation += 1;
            dev.state = AcqState::Post;
            dev.post = 0;
            dev.generation
        };
        let target = self.knob_u64(0, "TRANSIENT:POST");
        tokio::spawn(self.clone().capture(generation, target));
    }

    async fn capture(self: Arc<Self>, generation: u64, target: u64) {
        let period = self.options.state_period;
        for step in 1..=4u64 {
            tokio::time::sleep(period).await;
            if !self.advance(generation, |dev| dev.post = target * step / 4) {
                return;
            }
        }
        for state in [AcqState::Fin1, AcqState::Fin2] {
            tokio::time::sleep(period).await;
            if !self.advance(generation, |dev| dev.state = state) {
                return;
            }
        }
        if self.options.stick_in_fin2 {
            return;
        }
        tokio::time::sleep(period).await;
        self.advance(generation, |dev| dev.state = AcqState::Stop);
    }

    fn advance(&self, generation: u64, step: impl FnOnce(&mut Device)) -> bool {
        let mut dev = self.device.lock();
        if dev.generation != generation {
            return false;
        }
        step(&mut dev);
        dev.elapsed += 1;
        true
    }

    fn start_stream(self: &Arc<Self>) {
        let generation = {
            let mut dev = self.device.lock();
            if !dev.state.is_idle() {
                return;
            }
            dev.generation += 1;
            dev.streaming = true;
            dev.state = AcqState::Arm;
            dev.generation
        };
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.options.state_period).await;
            shared.advance(generation, |dev| dev.state = AcqState::Post);
        });
    }

    fn stop_stream(&self) {
        let mut dev = self.device.lock();
        if dev.streaming {
            dev.streaming = false;
            dev.generation += 1;
            dev.state = AcqState::Stop;
        }
    }

    fn is_streaming(&self) -> bool {
        self.device.lock().streaming
    }

    fn channel_payload(&self, channel: usize) -> Vec<u8> {
        let pre = self.knob_u64(0, "TRANSIENT:PRE");
        let post = self.knob_u64(0, "TRANSIENT:POST");
        let served = pre + post + self.options.data_padding as u64;
        let mut samples: Vec<i16> = (0..served)
            .map(|i| (i % 4096) as i16 + channel as i16)
            .collect();
        if self.knob(1, "es_enable").as_deref() == Some("1") {
            let marker = EventMarker {
                index: pre,
                clock: pre,
                kind: MarkerKind::All,
            }
            .encode(MIN_COLUMNS, MASTER_WORD);
            let word = self
                .master_column(channel)
                .and_then(|col| marker.get(col).copied())
                .unwrap_or(0);
            samples.insert(pre as usize, word);
        }
        samples.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn record_upload(&self, rearm: bool, bytes: Vec<u8>) {
        self.device.lock().uploads.push(MockUpload { rearm, bytes });
    }

    fn last_checksum(&self) -> u64 {
        self.device
            .lock()
            .uploads
            .last()
            .map_or(0, |upload| fnv1a(&upload.bytes))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

struct Listeners {
    state: TcpListener,
    commands: Vec<(u8, TcpListener)>,
    streams: Vec<(usize, TcpListener)>,
    data: Vec<(usize, TcpListener)>,
    awg_checksum: TcpListener,
    awg_upload: [(bool, TcpListener); 2],
}

async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding port {}", port))
}

async fn bind_all(base: u16, options: &MockOptions) -> Result<Listeners> {
    let mut commands = vec![(0, bind(base + COMMAND_OFFSET).await?)];
    for &(site, _) in &options.modules {
        commands.push((site, bind(base + COMMAND_OFFSET + u16::from(site)).await?));
    }
    let mut streams = Vec::with_capacity(MAX_LANES);
    for lane in 0..MAX_LANES {
        streams.push((lane, bind(base + STREAM_OFFSET + lane as u16).await?));
    }
    let channels: usize = options.modules.iter().map(|(_, f)| f.channel_count()).sum();
    let mut data = Vec::with_capacity(channels);
    for channel in 1..=channels {
        data.push((channel, bind(base + DATA_OFFSET + channel as u16).await?));
    }
    Ok(Listeners {
        state: bind(base).await?,
        commands,
        streams,
        data,
        awg_checksum: bind(base + AWG_OFFSET).await?,
        awg_upload: [
            (false, bind(base + AWG_OFFSET + 1).await?),
            (true, bind(base + AWG_OFFSET + 2).await?),
        ],
    })
}

/// A simulated carrier on the loopback interface.
#[derive(Debug)]
pub struct MockCarrier {
    ports: PortMap,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockCarrier {
    /// Bind every port and start serving.
    pub async fn start(options: MockOptions) -> Result<Self> {
        if options.modules.iter().map(|(_, f)| f.channel_count()).sum::<usize>()
            >= usize::from(AWG_OFFSET - DATA_OFFSET)
        {
            return Err(anyhow!("too many channels for the mock port layout"));
        }
        for _ in 0..32 {
            let base = rand::thread_rng().gen_range(20_000u16..60_000);
            match bind_all(base, &options).await {
                Ok(listeners) => return Ok(Self::serve(base, options, listeners)),
                Err(err) => tracing::debug!(base, error = %err, "mock port range busy"),
            }
        }
        Err(anyhow!("no free port range for the mock carrier"))
    }

    fn serve(base: u16, options: MockOptions, listeners: Listeners) -> Self {
        let shared = Arc::new(Shared {
            device: Mutex::new(Device {
                state: AcqState::Stop,
                post: 0,
                elapsed: 0,
                generation: 0,
                rearm_pending: false,
                streaming: false,
                knobs: seed_knobs(&options),
                log: Vec::new(),
                uploads: Vec::new(),
            }),
            options,
        });

        let mut tasks = vec![tokio::spawn(serve_state(shared.clone(), listeners.state))];
        for (site, listener) in listeners.commands {
            tasks.push(tokio::spawn(serve_knobs(shared.clone(), site, listener)));
        }
        for (lane, listener) in listeners.streams {
            tasks.push(tokio::spawn(serve_stream(shared.clone(), lane, listener)));
        }
        for (channel, listener) in listeners.data {
            tasks.push(tokio::spawn(serve_data(shared.clone(), channel, listener)));
        }
        tasks.push(tokio::spawn(serve_checksum(shared.clone(), listeners.awg_checksum)));
        for (rearm, listener) in listeners.awg_upload {
            tasks.push(tokio::spawn(serve_upload(shared.clone(), rearm, listener)));
        }
        tracing::info!(base, "mock carrier listening");

        Self {
            ports: PortMap {
                state: base,
                command_base: base + COMMAND_OFFSET,
                stream_base: base + STREAM_OFFSET,
                data_base: base + DATA_OFFSET,
                awg_base: base + AWG_OFFSET,
            },
            shared,
            tasks,
        }
    }

    /// Port layout of the mock.
    pub fn ports(&self) -> PortMap {
        self.ports
    }

    /// Configuration pointing at the mock, with short timings.
    pub fn config(&self) -> CarrierConfig {
        let options = &self.shared.options;
        let mut config = CarrierConfig::new("127.0.0.1", options.kind);
        config.ports = self.ports;
        for &(site, family) in &options.modules {
            config = config.with_module(ModuleConfig::new(site, family));
        }
        config.acquisition.clock_hz = 1_000_000;
        config.acquisition.lanes = options.lanes.clone();
        config.timing = TimingConfig {
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            poll: Duration::from_millis(50),
            monitor_backoff: Duration::from_millis(50),
            init_timeout: Duration::from_secs(3),
            arm_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(10),
            stream_start_timeout: Duration::from_secs(3),
        };
        config.streaming.chunk_samples = 256;
        config.recovery.fin2_hold = Duration::from_millis(100);
        config
    }

    /// Fire the trigger input.
    pub fn trigger(&self) {
        self.shared.trigger();
    }

    /// Current engine state.
    pub fn state(&self) -> AcqState {
        self.shared.device.lock().state
    }

    /// Force the engine into `state`, cancelling any capture in progress.
    pub fn set_state(&self, state: AcqState) {
        let mut dev = self.shared.device.lock();
        dev.generation += 1;
        dev.state = state;
    }

    /// Command lines received by `site`, in order.
    pub fn commands(&self, site: u8) -> Vec<String> {
        self.shared
            .device
            .lock()
            .log
            .iter()
            .filter(|(s, _)| *s == site)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Current value of a knob.
    pub fn value(&self, site: u8, path: &str) -> Option<String> {
        self.shared.knob(site, path)
    }

    /// Waveform uploads received.
    pub fn uploads(&self) -> Vec<MockUpload> {
        self.shared.device.lock().uploads.clone()
    }

    /// Stop serving.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.stop_stream();
    }
}

impl Drop for MockCarrier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_state(shared: Arc<Shared>, listener: TcpListener) {
    while let Ok((mut sock, _)) = listener.accept().await {
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let line = format!("{}\n", shared.status_line());
                if sock.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                tokio::time::sleep(shared.options.state_period).await;
            }
        });
    }
}

async fn serve_knobs(shared: Arc<Shared>, site: u8, listener: TcpListener) {
    while let Ok((sock, _)) = listener.accept().await {
        let shared = shared.clone();
        tokio::spawn(async move {
            let (rd, mut wr) = sock.into_split();
            let mut lines = BufReader::new(rd).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let reply = shared.respond(site, line);
                if wr.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn serve_data(shared: Arc<Shared>, channel: usize, listener: TcpListener) {
    while let Ok((mut sock, _)) = listener.accept().await {
        let payload = shared.channel_payload(channel);
        tokio::spawn(async move {
            let header = (payload.len() as u32).to_be_bytes();
            if sock.write_all(&header).await.is_ok() && sock.write_all(&payload).await.is_ok() {
                let _ = sock.shutdown().await;
            }
        });
    }
}

async fn serve_stream(shared: Arc<Shared>, lane: usize, listener: TcpListener) {
    while let Ok((sock, _)) = listener.accept().await {
        tokio::spawn(stream_lane(shared.clone(), lane, sock));
    }
}

/// Wait for `CONTINUOUS start`; `false` if the client hung up first.
async fn await_stream_start(shared: &Shared, sock: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    loop {
        if shared.is_streaming() {
            return true;
        }
        tokio::select! {
            _ = sock.read(&mut byte) => return false,
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
        }
    }
}

async fn stream_lane(shared: Arc<Shared>, lane: usize, mut sock: TcpStream) {
    let columns = shared.lane_columns(lane);
    if columns == 0 || !await_stream_start(&shared, &mut sock).await {
        return;
    }
    let total = shared.options.stream_rows;
    let mut row = 0;
    while row < total && shared.is_streaming() {
        let mut bytes = Vec::with_capacity(ROWS_PER_WRITE * columns * 2);
        for _ in 0..ROWS_PER_WRITE {
            if row >= total {
                break;
            }
            let words = match shared.options.marker_period {
                Some(period) if period > 0 && row > 0 && row % period == 0 => EventMarker {
                    index: row as u64,
                    clock: row as u64,
                    kind: MarkerKind::Gate,
                }
                .encode(columns, MASTER_WORD),
                _ => vec![(row % 1000) as i16; columns],
            };
            bytes.extend(words.iter().flat_map(|w| w.to_le_bytes()));
            row += 1;
        }
        if sock.write_all(&bytes).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let _ = sock.shutdown().await;
    tracing::debug!(lane, rows = row, "mock stream closed");
}

async fn serve_upload(shared: Arc<Shared>, rearm: bool, listener: TcpListener) {
    while let Ok((mut sock, _)) = listener.accept().await {
        let shared = shared.clone();
        tokio::spawn(async move {
            if sock.write_all(b"awg ready\n").await.is_err() {
                return;
            }
            let mut image = Vec::new();
            if sock.read_to_end(&mut image).await.is_err() {
                return;
            }
            let len = image.len();
            shared.record_upload(rearm, image);
            let reply = format!("received {} bytes\n", len);
            if sock.write_all(reply.as_bytes()).await.is_ok() {
                let _ = sock.shutdown().await;
            }
        });
    }
}

async fn serve_checksum(shared: Arc<Shared>, listener: TcpListener) {
    while let Ok((mut sock, _)) = listener.accept().await {
        let checksum = format!("{:040x}", shared.last_checksum());
        tokio::spawn(async move {
            if sock.write_all(checksum.as_bytes()).await.is_ok() {
                let _ = sock.shutdown().await;
            }
        });
    }
}
