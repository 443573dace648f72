//! Capture lifecycle.
//!
//! An [`Acquisition`] drives one carrier through `init → arm → trigger → store →
//! deinit`. It owns nothing long-lived itself: the state monitor lease and the
//! stream session registry come from the [`DeviceManager`](crate::manager::DeviceManager),
//! the command clients from the [`Carrier`].
//!
//! Waits return `Ok(false)` when their deadline passes or when no trigger was
//! captured; transport failures propagate as `DeviceOffline`.

use crate::config::{AcquisitionConfig, CarrierConfig};
use crate::device::awg::UploadReceipt;
use crate::device::{Carrier, CarrierKind, CarrierLease, ClockSetup, Module, Timebase, TriggerSetup};
use crate::download::{store_event_samples, store_plain, ChannelJob, DownloadPool, TransferPlan};
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::knob::schema::carrier as knobs;
use crate::state::{AcqState, MonitorLease, MonitorStatus};
use crate::storage::{Calibration, StorageSink};
use crate::streaming::{LaneChannel, LanePlan, SessionKey, SessionRegistry, StreamSession};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

/// Capture parameters of one init.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitRequest {
    /// Front-panel clock frequency; `None` uses the internal clock.
    pub external_clock_hz: Option<u64>,
    /// Sample clock.
    pub clock_hz: u64,
    /// Pre-trigger samples.
    pub pre: u64,
    /// Post-trigger samples.
    pub post: u64,
    /// Drive the trigger from software.
    pub soft_trigger: bool,
    /// Read through the streaming engine instead of on-board memory.
    pub streaming: bool,
}

impl InitRequest {
    /// Request matching the acquisition section of the configuration.
    pub fn from_config(acq: &AcquisitionConfig) -> Self {
        Self {
            external_clock_hz: acq.external_clock_hz,
            clock_hz: acq.clock_hz,
            pre: acq.pre,
            post: acq.post,
            soft_trigger: acq.soft_trigger,
            streaming: acq.needs_streaming(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Prepared {
    request: InitRequest,
    timebase: Timebase,
    shot: u64,
}

/// Lifecycle of one carrier.
pub struct Acquisition {
    carrier: CarrierLease,
    shot: u64,
    monitor: MonitorLease,
    sessions: Arc<SessionRegistry>,
    sink: Arc<dyn StorageSink>,
    prepared: Mutex<Option<Prepared>>,
    audit: Mutex<Option<serde_json::Value>>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("host", &self.carrier.host())
            .field("prepared", &self.prepared.lock())
            .finish()
    }
}

fn joined<T>(result: Result<AppResult<T>, JoinError>) -> AppResult<T> {
    result.unwrap_or_else(|err| Err(DaqError::InvalidSetup(format!("init task failed: {}", err))))
}

fn is_stop(status: &MonitorStatus) -> bool {
    status.observed.contains(&AcqState::Stop)
}

impl Acquisition {
    /// Assemble a lifecycle from its collaborators.
    ///
    /// The shot number starts as the one of the carrier's configuration.
    pub fn new(
        carrier: CarrierLease,
        monitor: MonitorLease,
        sessions: Arc<SessionRegistry>,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        Self {
            shot: carrier.config().device.shot,
            carrier,
            monitor,
            sessions,
            sink,
            prepared: Mutex::new(None),
            audit: Mutex::new(None),
        }
    }

    /// Use `shot` instead of the configured shot number.
    pub fn with_shot(mut self, shot: u64) -> Self {
        self.shot = shot;
        self
    }

    /// The carrier, shared with every other open of the same host.
    pub fn carrier(&self) -> &Arc<Carrier> {
        self.carrier.shared()
    }

    /// Shot number written at init.
    pub fn shot(&self) -> u64 {
        self.shot
    }

    /// The host's state monitor.
    pub fn monitor(&self) -> &MonitorLease {
        &self.monitor
    }

    fn config(&self) -> &CarrierConfig {
        self.carrier.config()
    }

    fn host(&self) -> &str {
        self.carrier.host()
    }

    /// Timebase established by the last init.
    pub fn timebase(&self) -> Option<Timebase> {
        self.prepared.lock().map(|p| p.timebase)
    }

    /// Settings applied by the last init.
    pub fn applied_settings(&self) -> Option<serde_json::Value> {
        self.audit.lock().clone()
    }

    /// Whether the capture goes through the streaming engine.
    pub fn is_streaming(&self) -> bool {
        self.prepared.lock().map_or(false, |p| p.request.streaming)
    }

    fn prepared(&self) -> AppResult<Prepared> {
        self.prepared
            .lock()
            .ok_or_else(|| DaqError::InvalidSetup(format!("{} is not initialized", self.host())))
    }

    async fn remote_state(&self) -> AppResult<AcqState> {
        Ok(self.carrier.state().await?.state)
    }

    /// Configure carrier and modules for one shot.
    ///
    /// The carrier part and every enabled module are configured in parallel and
    /// joined before the master routes clock and trigger. All settings applied are
    /// collected into the audit log returned by [`applied_settings`](Self::applied_settings).
    pub async fn init(&self, request: InitRequest) -> AppResult<Timebase> {
        let shot = self.shot;
        let span = tracing::info_span!("init", host = %self.host(), shot);
        async {
            let cache = self.carrier.cache();
            cache.begin();
            let result = self.configure(request, shot).await;
            let audit = cache.close();
            match &result {
                Ok(timebase) => {
                    *self.audit.lock() = audit;
                    *self.prepared.lock() = Some(Prepared {
                        request,
                        timebase: *timebase,
                        shot,
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "init failed");
                    *self.prepared.lock() = None;
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn configure(&self, request: InitRequest, shot: u64) -> AppResult<Timebase> {
        let timing = self.config().timing;
        if !self.abort(Some(timing.init_timeout)).await? {
            tracing::warn!("device did not reach STOP before init");
        }

        let master: Arc<Module> = self.carrier.master()?.clone();
        let mb_set_hz = master.mb_clock_hz(request.clock_hz).await?;
        let clock = ClockSetup {
            external: request.external_clock_hz.is_some(),
            fin_hz: request.external_clock_hz.unwrap_or(CarrierKind::ZCLK_HZ),
            set_hz: mb_set_hz,
        };
        let trigger = TriggerSetup {
            pre: request.pre,
            post: request.post,
            soft: request.soft_trigger,
        };

        let carrier = Arc::clone(self.carrier.shared());
        let carrier_task = tokio::spawn(
            async move { carrier.configure(clock, trigger, shot).await }.in_current_span(),
        );
        let mut module_tasks = JoinSet::new();
        for module in self.carrier.enabled_modules() {
            module_tasks.spawn(async move { module.init(shot).await }.in_current_span());
        }

        let mut first_error = joined(carrier_task.await).err();
        while let Some(result) = module_tasks.join_next().await {
            if let Err(err) = joined(result) {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        master
            .init_master(request.pre, request.soft_trigger, request.clock_hz, mb_set_hz, timing.poll)
            .await
    }

    /// Arm the capture engine.
    ///
    /// The arm request is repeated every poll interval while the device stays in
    /// `STOP`/`CLEANUP` until `ARM` is observed. A device that is already past the
    /// idle states counts as armed. Returns `Ok(false)` at the deadline.
    pub async fn arm(&self, timeout: Option<Duration>) -> AppResult<bool> {
        let prepared = self.prepared()?;
        let limit = timeout.unwrap_or(self.config().timing.arm_timeout);
        let span = tracing::info_span!("arm", host = %self.host(), shot = prepared.shot);
        async {
            if prepared.request.streaming {
                self.streaming_arm(prepared, limit).await
            } else {
                self.wait4arm(limit).await
            }
        }
        .instrument(span)
        .await
    }

    async fn wait4arm(&self, limit: Duration) -> AppResult<bool> {
        let poll = self.config().timing.poll;
        let deadline = Instant::now() + limit;
        if !self.remote_state().await?.is_idle() {
            return Ok(true);
        }
        self.monitor.discard(AcqState::Arm);
        self.carrier.request_arm().await?;
        loop {
            let window = poll.min(deadline.saturating_duration_since(Instant::now()));
            let armed = self
                .monitor
                .wait_until(Some(window), |status| {
                    status.observed.contains(&AcqState::Arm)
                        || status.latest.map_or(false, |l| !l.state.is_idle())
                })
                .await;
            if armed {
                tracing::info!("armed");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(after = ?limit, "device did not arm");
                return Ok(false);
            }
            self.carrier.request_arm().await?;
        }
    }

    /// Wait while the engine captures and fewer than `target` post samples arrived.
    ///
    /// An observed `STOP` ends the wait early. Returns `false` at the deadline.
    pub async fn wait4post(&self, target: u64, timeout: Option<Duration>) -> bool {
        self.monitor.discard(AcqState::Stop);
        self.monitor
            .wait_until(timeout, |status| {
                is_stop(status)
                    || status
                        .latest
                        .map_or(false, |l| !l.state.is_capturing() || l.post >= target)
            })
            .await
    }

    /// Wait until the device reports `target`.
    pub async fn wait4state(&self, target: AcqState, timeout: Option<Duration>) -> AppResult<bool> {
        self.monitor.discard(target);
        if self.remote_state().await? == target {
            return Ok(true);
        }
        Ok(self
            .monitor
            .wait_until(timeout, |status| {
                status.observed.contains(&target) || status.latest.map_or(false, |l| l.state == target)
            })
            .await)
    }

    /// Bring the device back to `STOP`.
    ///
    /// Safe to call from any state and any number of times. Streaming is stopped, the
    /// abort request repeated every poll interval, and an engine parked in `FIN2`
    /// longer than the configured hold is kicked with a forced re-arm.
    pub async fn abort(&self, timeout: Option<Duration>) -> AppResult<bool> {
        let config = self.config();
        let limit = timeout.unwrap_or(config.timing.init_timeout);
        let poll = config.timing.poll;
        let recovery = config.recovery;
        let deadline = Instant::now() + limit;

        self.carrier.stop_streams().await?;
        self.carrier.request_abort().await?;

        let state = self.remote_state().await?;
        if state == AcqState::Stop {
            return Ok(true);
        }
        if state == AcqState::Fin2 && recovery.fin2_rearm {
            tokio::time::sleep(recovery.fin2_hold).await;
            if self.remote_state().await? == AcqState::Fin2 {
                self.carrier.force_rearm().await?;
            }
        }
        self.monitor.clear_observed();

        loop {
            let window = poll.min(deadline.saturating_duration_since(Instant::now()));
            if self.monitor.wait_until(Some(window), is_stop).await
                || self.remote_state().await? == AcqState::Stop
            {
                tracing::info!(host = %self.host(), "aborted");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(host = %self.host(), after = ?limit, "device did not reach STOP");
                return Ok(false);
            }
            self.carrier.request_abort().await?;
        }
    }

    /// Fire the internal trigger.
    pub async fn soft_trigger(&self) -> AppResult<()> {
        self.carrier.soft_trigger().await
    }

    /// Upload waveforms to a generator carrier; `rearm` selects the repeating port.
    pub async fn arm_generator(&self, channels: &[Vec<f64>], rearm: bool) -> AppResult<UploadReceipt> {
        if !self.carrier.is_generator() {
            return Err(DaqError::InvalidSetup(format!(
                "{} has no waveform generator master",
                self.host()
            )));
        }
        self.carrier.upload_waveforms(channels, rearm).await
    }

    /// Collect the captured data and hand it to the sink.
    ///
    /// Returns `Ok(false)` when no trigger was captured or a wait ran out.
    pub async fn store(&self, timeout: Option<Duration>) -> AppResult<bool> {
        let prepared = self.prepared()?;
        let limit = timeout.unwrap_or(self.config().timing.store_timeout);
        let span = tracing::info_span!("store", host = %self.host(), shot = prepared.shot);
        let outcome = async {
            if prepared.request.streaming {
                self.streaming_store(prepared, limit).await
            } else {
                self.memory_store(prepared, limit).await
            }
        }
        .instrument(span)
        .await;
        match outcome {
            Err(err) if matches!(err.kind(), ErrorKind::Timeout | ErrorKind::NotTriggered) => {
                tracing::warn!(host = %self.host(), shot = prepared.shot, error = %err, "store failed");
                Ok(false)
            }
            other => other,
        }
    }

    async fn memory_store(&self, prepared: Prepared, limit: Duration) -> AppResult<bool> {
        let deadline = Instant::now() + limit;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let poll = self.config().timing.poll;
        let waiting = |s: AcqState| matches!(s, AcqState::Arm | AcqState::Pre);

        let mut state = self.remote_state().await?;
        for _ in 0..5 {
            if !waiting(state) {
                break;
            }
            tokio::time::sleep(poll).await;
            state = self.remote_state().await?;
        }
        if waiting(state) {
            return Err(DaqError::NotTriggered {
                host: self.host().to_string(),
                shot: prepared.shot,
            });
        }

        if !self.wait4post(prepared.request.post, Some(remaining())).await {
            return Err(DaqError::timeout("post-trigger samples", limit));
        }
        if !self.wait4state(AcqState::Stop, Some(remaining())).await? {
            return Err(DaqError::timeout("STOP after capture", limit));
        }
        self.transfer(prepared, remaining()).await?;
        Ok(true)
    }

    async fn calibrations(&self) -> AppResult<HashMap<usize, Calibration>> {
        let mut calibrations = HashMap::new();
        for module in self.carrier.enabled_modules() {
            if module.family().is_generator() {
                continue;
            }
            let table = module.calibration().await?;
            for channel in module.channels() {
                let cal = table.get(channel.index - 1).copied().unwrap_or_default();
                calibrations.insert(channel.number, cal);
            }
        }
        Ok(calibrations)
    }

    async fn transfer(&self, prepared: Prepared, limit: Duration) -> AppResult<()> {
        let config = self.config();
        let timebase = prepared.timebase;
        let event_channels: Vec<usize> = if timebase.events_embedded {
            self.carrier.master()?.channels().iter().take(8).map(|c| c.number).collect()
        } else {
            Vec::new()
        };

        let plan = TransferPlan {
            pre: prepared.request.pre,
            post: prepared.request.post,
            dt_ns: timebase.dt_ns(),
            trigger_ns: config.acquisition.trigger_ns,
            segment_samples: config.download.segment_samples,
            fpga_decim: timebase.fpga_decim,
            skip: timebase.skip,
            calibrations: self.calibrations().await?,
        };

        let mut jobs = Vec::new();
        for module in self.carrier.enabled_modules() {
            if module.family().is_generator() {
                continue;
            }
            for channel in module.channels() {
                let job = ChannelJob::new(channel.number, self.carrier.data_endpoint(channel.number), channel.enabled)
                    .with_range(plan.capture_range());
                jobs.push(if event_channels.contains(&channel.number) {
                    job.always_fetch()
                } else {
                    job
                });
            }
        }

        let pool = DownloadPool::new(
            config.download.workers,
            config.timing.connect_timeout,
            config.timing.read_timeout,
        );
        let channels = jobs.len();
        let payloads = pool.fetch(jobs, limit).await?;

        let summary = if timebase.events_embedded {
            let summary = store_event_samples(payloads, &event_channels, &plan, self.sink.as_ref()).await?;
            if summary.markers == 0 {
                return Err(DaqError::NotTriggered {
                    host: self.host().to_string(),
                    shot: prepared.shot,
                });
            }
            summary
        } else {
            store_plain(payloads, &plan, self.sink.as_ref()).await?
        };
        tracing::info!(channels, segments = summary.segments, markers = summary.markers, "capture stored");
        Ok(())
    }

    fn lane_plans(&self, prepared: Prepared, calibrations: &HashMap<usize, Calibration>) -> Vec<LanePlan> {
        let config = self.config();
        let recorders: Vec<Arc<Module>> = self
            .carrier
            .enabled_modules()
            .into_iter()
            .filter(|m| !m.family().is_generator())
            .collect();
        let lanes: Vec<Vec<u8>> = if config.acquisition.lanes.is_empty() {
            vec![recorders.iter().map(|m| m.site()).collect()]
        } else {
            config.acquisition.lanes.clone()
        };

        lanes
            .iter()
            .enumerate()
            .map(|(lane, sites)| LanePlan {
                lane,
                endpoint: self.carrier.stream_endpoint(lane),
                channels: recorders
                    .iter()
                    .filter(|m| sites.contains(&m.site()))
                    .flat_map(|m| m.channels())
                    .map(|c| LaneChannel {
                        number: c.number,
                        enabled: c.enabled,
                        calibration: calibrations.get(&c.number).copied().unwrap_or_default(),
                    })
                    .collect(),
                chunk_rows: config.streaming.chunk_samples,
                pre: prepared.request.pre,
                fpga_decim: prepared.timebase.fpga_decim,
                skip: prepared.timebase.skip,
                dt_ns: prepared.timebase.dt_ns(),
                trigger_ns: config.acquisition.trigger_ns,
                connect_timeout: config.timing.connect_timeout,
                poll: config.timing.poll,
            })
            .filter(|plan| !plan.channels.is_empty())
            .collect()
    }

    async fn streaming_arm(&self, prepared: Prepared, limit: Duration) -> AppResult<bool> {
        if let Some(key) = self.sessions.key(self.host()) {
            return Err(DaqError::InvalidSetup(format!(
                "streams of {} shot {} are still running",
                key.host, key.shot
            )));
        }
        let client = self.carrier.client();
        self.carrier.stop_streams().await?;
        client.set(&knobs::OVERSAMPLING, &0).await?;
        client.set(&knobs::STREAM_OPTS, &"\"\"".to_string()).await?;

        let calibrations = self.calibrations().await?;
        let key = SessionKey {
            host: self.host().to_string(),
            shot: prepared.shot,
        };
        let session = StreamSession::start(key, self.lane_plans(prepared, &calibrations), self.sink.clone());
        self.sessions.insert(session)?;

        let start = async {
            client.set(&knobs::TRANSIENT, &true).await?;
            client.set(&knobs::CONTINUOUS, &"start".to_string()).await
        };
        if let Err(err) = start.await {
            if let Some(session) = self.sessions.take(self.host()) {
                if let Err(stop_err) = session.finish(false, Duration::ZERO).await {
                    tracing::debug!(error = %stop_err, "stopping abandoned stream session");
                }
            }
            return Err(err);
        }

        let wait = limit.min(self.config().timing.stream_start_timeout);
        let started = self
            .monitor
            .wait_until(Some(wait), |status| {
                status.latest.map_or(false, |l| !l.state.is_idle())
            })
            .await;
        if !started {
            tracing::warn!(after = ?wait, "stream did not start");
        }
        Ok(started)
    }

    async fn streaming_store(&self, prepared: Prepared, limit: Duration) -> AppResult<bool> {
        if let Err(err) = self.carrier.client().set(&knobs::CONTINUOUS, &"stop".to_string()).await {
            tracing::debug!(error = %err, "stopping stream");
        }
        let session = self.sessions.take(self.host()).ok_or_else(|| {
            DaqError::InvalidSetup(format!("{} has no stream session to store", self.host()))
        })?;
        let drain = session.any_triggered();
        let report = session.finish(drain, limit).await?;
        if !report.triggered() {
            return Err(DaqError::NotTriggered {
                host: self.host().to_string(),
                shot: prepared.shot,
            });
        }
        let chunks: usize = report.lanes.iter().map(|l| l.chunks).sum();
        tracing::info!(lanes = report.lanes.len(), chunks, "stream stored");
        Ok(true)
    }

    /// Release the device: abort, stop and join streams, drop connections.
    ///
    /// Never fails; problems are logged.
    pub async fn deinit(&self) -> AppResult<()> {
        let span = tracing::info_span!("deinit", host = %self.host());
        async {
            match self.abort(None).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!("abort timed out during deinit"),
                Err(err) => tracing::warn!(error = %err, "abort failed during deinit"),
            }
            if let Some(session) = self.sessions.take(self.host()) {
                if let Err(err) = session.finish(false, Duration::ZERO).await {
                    tracing::warn!(error = %err, "stream session ended with error");
                }
            }
            if self.carrier.cache().is_open() {
                self.carrier.cache().close();
            }
            self.carrier.close().await;
            *self.prepared.lock() = None;
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_follows_acquisition_config() {
        let mut acq = AcquisitionConfig {
            pre: 1000,
            post: 9000,
            soft_trigger: true,
            memory_samples: 20_000,
            ..AcquisitionConfig::default()
        };
        let request = InitRequest::from_config(&acq);
        assert_eq!((request.pre, request.post), (1000, 9000));
        assert!(request.soft_trigger);
        assert!(!request.streaming);
        assert_eq!(request.external_clock_hz, None);

        acq.post = 30_000;
        assert!(InitRequest::from_config(&acq).streaming);
        acq.post = 10;
        acq.continuous = true;
        assert!(InitRequest::from_config(&acq).streaming);
    }
}
