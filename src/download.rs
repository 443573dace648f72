//! Channel downloader pool.
//!
//! After an on-board capture every channel's samples sit in the carrier's memory
//! and are served on a per-channel data port: one connection per request, a 4-byte
//! big-endian length prefix, then little-endian 16-bit words.
//!
//! A job may name a sample range; only the bytes up to its end are read off the
//! port, whatever length the device announces.
//!
//! A fixed number of workers pull channels one at a time from a shared work list
//! and push `(channel, samples, enabled)` entries into a completion queue sized to
//! the channel count. The consumer drains exactly one entry per channel, then
//! calibrates, builds the time base and hands bounded segments to the sink.

use crate::error::{AppResult, DaqError};
use crate::storage::{Calibration, Segment, StorageSink};
use crate::streaming::marker::{event_sample_clock, EventMarker, MarkerKind, TimeAligner, MIN_COLUMNS};
use crate::transport::{words_le, Connection, Endpoint};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

/// Read ceiling for jobs without a sample range.
pub const MAX_CHANNEL_BYTES: usize = 1 << 28;

/// One channel to pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelJob {
    /// Carrier channel number.
    pub channel: usize,
    /// Data port of the channel.
    pub endpoint: Endpoint,
    /// Whether the channel is stored.
    pub enabled: bool,
    /// Whether the samples are fetched.
    pub fetch: bool,
    /// Samples kept out of the channel payload; `None` keeps everything served.
    pub range: Option<Range<usize>>,
}

impl ChannelJob {
    /// Job fetching the channel only when it is enabled.
    pub fn new(channel: usize, endpoint: Endpoint, enabled: bool) -> Self {
        Self {
            channel,
            endpoint,
            enabled,
            fetch: enabled,
            range: None,
        }
    }

    /// Keep only `range` of the served samples.
    pub fn with_range(mut self, range: Range<usize>) -> Self {
        self.range = Some(range);
        self
    }

    fn byte_limit(&self) -> usize {
        self.range
            .as_ref()
            .map_or(MAX_CHANNEL_BYTES, |r| r.end.saturating_mul(2).min(MAX_CHANNEL_BYTES))
    }

    /// Fetch the channel even when it is not stored.
    pub fn always_fetch(mut self) -> Self {
        self.fetch = true;
        self
    }
}

/// A completion-queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPayload {
    /// Carrier channel number.
    pub channel: usize,
    /// Raw samples; empty when the channel was not fetched.
    pub samples: Vec<i16>,
    /// Whether the channel is stored.
    pub enabled: bool,
}

/// Fixed-size pool of channel pullers.
#[derive(Debug, Clone, Copy)]
pub struct DownloadPool {
    workers: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl DownloadPool {
    /// Pool of `workers` pullers (at least one).
    pub fn new(workers: usize, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            workers: workers.max(1),
            connect_timeout,
            read_timeout,
        }
    }

    /// Worker count.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Pull every job and return one payload per job, ordered by channel.
    ///
    /// Fails with `Timeout` when the queue is not drained within `deadline`, or with
    /// the first transfer error once every worker is done.
    pub async fn fetch(&self, jobs: Vec<ChannelJob>, deadline: Duration) -> AppResult<Vec<ChannelPayload>> {
        let expected = jobs.len();
        if expected == 0 {
            return Ok(Vec::new());
        }
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let (tx, mut rx) = mpsc::channel::<AppResult<ChannelPayload>>(expected);

        let mut tasks = JoinSet::new();
        for worker in 0..self.workers.min(expected) {
            let queue = queue.clone();
            let tx = tx.clone();
            let pool = *self;
            let span = tracing::debug_span!("channel_puller", worker);
            tasks.spawn(
                async move {
                    loop {
                        let next = queue.lock().pop_front();
                        let Some(job) = next else {
                            break;
                        };
                        let entry = pool.pull(job).await;
                        if tx.send(entry).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(span),
            );
        }
        drop(tx);

        let until = Instant::now() + deadline;
        let mut payloads = Vec::with_capacity(expected);
        let mut first_error = None;
        for _ in 0..expected {
            match tokio::time::timeout_at(until, rx.recv()).await {
                Ok(Some(Ok(payload))) => payloads.push(payload),
                Ok(Some(Err(err))) => {
                    first_error.get_or_insert(err);
                }
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    return Err(DaqError::timeout("channel download", deadline));
                }
            }
        }
        while tasks.join_next().await.is_some() {}

        if let Some(err) = first_error {
            return Err(err);
        }
        if payloads.len() != expected {
            return Err(DaqError::InvalidSetup(format!(
                "download pool produced {} of {} channels",
                payloads.len(),
                expected
            )));
        }
        payloads.sort_by_key(|p| p.channel);
        Ok(payloads)
    }

    async fn pull(&self, job: ChannelJob) -> AppResult<ChannelPayload> {
        let samples = if job.fetch {
            let mut conn = Connection::connect(&job.endpoint, self.connect_timeout, self.read_timeout).await?;
            let bytes = conn.recv_length_prefixed(job.byte_limit()).await?;
            tracing::debug!(channel = job.channel, bytes = bytes.len(), "channel pulled");
            let mut words = words_le(&bytes);
            if let Some(range) = &job.range {
                words.truncate(range.end);
                let start = range.start.min(words.len());
                words.drain(..start);
            }
            words
        } else {
            Vec::new()
        };
        Ok(ChannelPayload {
            channel: job.channel,
            samples,
            enabled: job.enabled,
        })
    }
}

/// How downloaded channels become segments.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Pre-trigger samples.
    pub pre: u64,
    /// Post-trigger samples.
    pub post: u64,
    /// Sample period in ns.
    pub dt_ns: f64,
    /// Trigger time in ns.
    pub trigger_ns: f64,
    /// Maximum samples per segment.
    pub segment_samples: usize,
    /// FPGA decimation used in event-sample clock counts.
    pub fpga_decim: u64,
    /// Rows dropped after each event sample.
    pub skip: usize,
    /// Calibration per channel; missing entries are identity.
    pub calibrations: HashMap<usize, Calibration>,
}

impl TransferPlan {
    /// Samples of one channel that belong to the capture.
    pub fn capture_range(&self) -> Range<usize> {
        0..(self.pre + self.post) as usize
    }

    fn calibration(&self, channel: usize) -> Calibration {
        self.calibrations.get(&channel).copied().unwrap_or_default()
    }
}

/// What a transfer handed to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Segments stored.
    pub segments: usize,
    /// Event samples found (event-sample form only).
    pub markers: usize,
}

async fn store_split(
    segment: Segment,
    max_samples: usize,
    sink: &dyn StorageSink,
    summary: &mut TransferSummary,
) -> AppResult<()> {
    for part in segment.split(max_samples) {
        sink.store_segment(part).await?;
        summary.segments += 1;
    }
    Ok(())
}

/// Store enabled channels with the plain time base `(i - pre) * dt + trigger`.
pub async fn store_plain(
    payloads: Vec<ChannelPayload>,
    plan: &TransferPlan,
    sink: &dyn StorageSink,
) -> AppResult<TransferSummary> {
    let mut summary = TransferSummary::default();
    for payload in payloads.into_iter().filter(|p| p.enabled) {
        if payload.samples.is_empty() {
            tracing::warn!(channel = payload.channel, "channel delivered no samples");
            continue;
        }
        let segment = Segment::new(
            payload.channel,
            payload.samples,
            -(plan.pre as i64),
            plan.dt_ns,
            plan.trigger_ns,
            plan.calibration(payload.channel),
        );
        store_split(segment, plan.segment_samples, sink, &mut summary).await?;
    }
    Ok(summary)
}

/// Store enabled channels of an event-sample capture.
///
/// `event_channels` are the eight channels whose rows carry the event samples; they
/// must be among `payloads`. Each block between event samples gets its own time
/// offset; event rows, the `skip` rows after them and everything before the first
/// event are dropped.
pub async fn store_event_samples(
    payloads: Vec<ChannelPayload>,
    event_channels: &[usize],
    plan: &TransferPlan,
    sink: &dyn StorageSink,
) -> AppResult<TransferSummary> {
    let by_channel: HashMap<usize, &[i16]> = payloads
        .iter()
        .map(|p| (p.channel, p.samples.as_slice()))
        .collect();
    let columns: Vec<&[i16]> = event_channels
        .iter()
        .take(MIN_COLUMNS)
        .filter_map(|ch| by_channel.get(ch).copied())
        .collect();
    if columns.len() < MIN_COLUMNS {
        return Err(DaqError::InvalidSetup(format!(
            "event samples need {} channels, got {}",
            MIN_COLUMNS,
            columns.len()
        )));
    }
    let rows = columns.iter().map(|c| c.len()).min().unwrap_or(0);

    let mut aligner = TimeAligner::new(0, plan.fpga_decim, plan.skip);
    let mut row = [0i16; MIN_COLUMNS];
    let blocks: Vec<_> = aligner
        .align_rows(rows, |r| {
            for (slot, column) in row.iter_mut().zip(&columns) {
                *slot = column[r];
            }
            event_sample_clock(&row).map(|clock| EventMarker {
                index: r as u64,
                clock,
                kind: MarkerKind::All,
            })
        })
        .into_iter()
        .filter(|b| b.aligned)
        .collect();

    let mut summary = TransferSummary {
        markers: aligner.markers(),
        ..TransferSummary::default()
    };
    tracing::debug!(markers = summary.markers, blocks = blocks.len(), "event samples located");
    for payload in payloads.iter().filter(|p| p.enabled) {
        for block in &blocks {
            let Some(raw) = payload.samples.get(block.range()) else {
                continue;
            };
            let segment = Segment::new(
                payload.channel,
                raw.to_vec(),
                block.start_tick,
                plan.dt_ns,
                plan.trigger_ns,
                plan.calibration(payload.channel),
            );
            store_split(segment, plan.segment_samples, sink, &mut summary).await?;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::MemorySink;
    use crate::streaming::marker::STATIC_WORD;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn data_port(samples: Vec<i16>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let body: Vec<u8> = samples.iter().flat_map(|w| w.to_le_bytes()).collect();
                let _ = sock.write_all(&(body.len() as u32).to_be_bytes()).await;
                let _ = sock.write_all(&body).await;
            }
        });
        endpoint
    }

    async fn jobs(count: usize) -> Vec<ChannelJob> {
        let mut jobs = Vec::new();
        for ch in 1..=count {
            let endpoint = data_port(vec![ch as i16; 10]).await;
            jobs.push(ChannelJob::new(ch, endpoint, ch % 4 != 0));
        }
        jobs
    }

    fn plan(pre: u64) -> TransferPlan {
        TransferPlan {
            pre,
            post: 8,
            dt_ns: 1000.0,
            trigger_ns: 0.0,
            segment_samples: 4,
            fpga_decim: 1,
            skip: 0,
            calibrations: HashMap::from([(1, Calibration::new(2.0, 0.5))]),
        }
    }

    #[tokio::test]
    async fn every_channel_completes_regardless_of_pool_size() {
        for workers in [1, 2, 16] {
            let pool = DownloadPool::new(workers, Duration::from_secs(1), Duration::from_secs(1));
            let payloads = pool.fetch(jobs(16).await, Duration::from_secs(5)).await.unwrap();
            assert_eq!(payloads.len(), 16, "pool of {}", workers);
            let channels: Vec<usize> = payloads.iter().map(|p| p.channel).collect();
            assert_eq!(channels, (1..=16).collect::<Vec<_>>());
            assert_eq!(payloads[2].samples, vec![3; 10]);
            assert!(!payloads[3].enabled);
            assert!(payloads[3].samples.is_empty());
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_cut_to_the_capture() {
        // the port serves 100 samples but the capture is 2 pre + 8 post
        let endpoint = data_port((0..100).collect()).await;
        let capture = plan(2).capture_range();
        let jobs = vec![
            ChannelJob::new(1, endpoint.clone(), true).with_range(capture),
            ChannelJob::new(2, endpoint, true).with_range(3..6),
        ];
        let pool = DownloadPool::new(2, Duration::from_secs(1), Duration::from_secs(1));
        let payloads = pool.fetch(jobs, Duration::from_secs(5)).await.unwrap();
        assert_eq!(payloads[0].samples, (0..10).collect::<Vec<i16>>());
        assert_eq!(payloads[1].samples, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn short_payload_keeps_what_arrived() {
        let endpoint = data_port((0..4).collect()).await;
        let job = ChannelJob::new(1, endpoint, true).with_range(2..10);
        let pool = DownloadPool::new(1, Duration::from_secs(1), Duration::from_secs(1));
        let payloads = pool.fetch(vec![job], Duration::from_secs(5)).await.unwrap();
        assert_eq!(payloads[0].samples, vec![2, 3]);
    }

    #[tokio::test]
    async fn offline_channel_fails_the_fetch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);
        let mut all = jobs(3).await;
        all.push(ChannelJob::new(4, dead, true));
        let pool = DownloadPool::new(2, Duration::from_millis(200), Duration::from_millis(200));
        let err = pool.fetch(all, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceOffline);
    }

    #[tokio::test]
    async fn plain_transfer_splits_and_calibrates() {
        let payloads = vec![
            ChannelPayload { channel: 1, samples: (0..10).collect(), enabled: true },
            ChannelPayload { channel: 2, samples: vec![0; 10], enabled: false },
        ];
        let sink = MemorySink::new();
        let summary = store_plain(payloads, &plan(2), &sink).await.unwrap();
        assert_eq!(summary.segments, 3);
        let segments = sink.segments();
        assert_eq!(segments[0].start_tick, -2);
        assert_eq!(segments[0].values[1], 2.5);
        assert_eq!(segments[2].start_tick, 6);
        assert_eq!(segments[2].end_tick, 7);
        assert!(!sink.calls_per_channel().contains_key(&2));
    }

    #[tokio::test]
    async fn event_sample_transfer_uses_block_offsets() {
        // 8 columns, 12 rows, event samples at rows 2 and 7
        let mut columns: Vec<Vec<i16>> = (0..8).map(|c| vec![c as i16 * 10; 12]).collect();
        for (row, clock) in [(2usize, 100u32), (7, 150)] {
            columns[3][row] = STATIC_WORD as i16;
            columns[7][row] = STATIC_WORD as i16;
            columns[4][row] = clock as i16;
            columns[5][row] = 0;
        }
        let payloads: Vec<ChannelPayload> = columns
            .into_iter()
            .enumerate()
            .map(|(i, samples)| ChannelPayload { channel: i + 1, samples, enabled: i == 0 })
            .collect();
        let mut transfer = plan(0);
        transfer.segment_samples = 100;
        transfer.fpga_decim = 10;
        let sink = MemorySink::new();
        let summary = store_event_samples(payloads, &[1, 2, 3, 4, 5, 6, 7, 8], &transfer, &sink)
            .await
            .unwrap();
        assert_eq!(summary.markers, 2);
        let segments = sink.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start_tick, segments[0].len()), (0, 4));
        assert_eq!((segments[1].start_tick, segments[1].len()), (5, 4));
    }
}
