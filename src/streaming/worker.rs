//! One streaming lane reader.

use super::marker::TimeAligner;
use crate::error::{AppResult, DaqError};
use crate::storage::{Calibration, Segment, StorageSink};
use crate::transport::{words_le, Connection, Endpoint, Fill};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Column of a lane's row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneChannel {
    /// Carrier channel number.
    pub number: usize,
    /// Whether the channel is handed to the sink.
    pub enabled: bool,
    /// Calibration applied to the channel.
    pub calibration: Calibration,
}

/// Everything a worker needs to read one lane.
#[derive(Debug, Clone)]
pub struct LanePlan {
    /// Lane index.
    pub lane: usize,
    /// Streaming endpoint.
    pub endpoint: Endpoint,
    /// Row columns in wire order.
    pub channels: Vec<LaneChannel>,
    /// Rows per chunk.
    pub chunk_rows: usize,
    /// Pre-trigger samples of the capture.
    pub pre: u64,
    /// FPGA decimation used in marker clock counts.
    pub fpga_decim: u64,
    /// Rows dropped after each marker.
    pub skip: usize,
    /// Sample period in ns.
    pub dt_ns: f64,
    /// Trigger time in ns.
    pub trigger_ns: f64,
    /// Connect deadline.
    pub connect_timeout: Duration,
    /// Read poll interval; the stop flag is checked at this granularity.
    pub poll: Duration,
}

impl LanePlan {
    /// Bytes per chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_rows * self.channels.len() * 2
    }
}

/// Final account of a lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneReport {
    /// Lane index.
    pub lane: usize,
    /// Chunks handed to the sink.
    pub chunks: usize,
    /// Rows read, marker rows included.
    pub rows: usize,
    /// Markers decoded.
    pub markers: usize,
    /// Whether at least one marker was decoded.
    pub triggered: bool,
}

#[derive(Debug, Default)]
struct Progress {
    stop: AtomicBool,
    triggered: AtomicBool,
    chunks: AtomicUsize,
}

/// A running lane reader.
#[derive(Debug)]
pub struct StreamWorker {
    lane: usize,
    progress: Arc<Progress>,
    task: JoinHandle<AppResult<LaneReport>>,
}

impl StreamWorker {
    /// Spawn a reader for `plan` feeding `sink`.
    pub fn spawn(plan: LanePlan, sink: Arc<dyn StorageSink>) -> Self {
        let lane = plan.lane;
        let progress = Arc::new(Progress::default());
        let span = tracing::info_span!("stream_worker", lane, endpoint = %plan.endpoint);
        let task = tokio::spawn(run(plan, sink, progress.clone()).instrument(span));
        Self { lane, progress, task }
    }

    /// Lane index.
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Whether a marker has been decoded so far.
    pub fn triggered(&self) -> bool {
        self.progress.triggered.load(Ordering::Acquire)
    }

    /// Chunks handed to the sink so far.
    pub fn chunks(&self) -> usize {
        self.progress.chunks.load(Ordering::Acquire)
    }

    /// Whether the reader has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the reader to stop at its next read boundary.
    pub fn stop(&self) {
        self.progress.stop.store(true, Ordering::Release);
    }

    /// Wait for the reader to exit.
    pub async fn join(self) -> AppResult<LaneReport> {
        match self.task.await {
            Ok(report) => report,
            Err(err) => Err(DaqError::InvalidSetup(format!(
                "stream worker {} panicked: {}",
                self.lane, err
            ))),
        }
    }
}

async fn run(plan: LanePlan, sink: Arc<dyn StorageSink>, progress: Arc<Progress>) -> AppResult<LaneReport> {
    let columns = plan.channels.len();
    let mut report = LaneReport {
        lane: plan.lane,
        ..LaneReport::default()
    };
    if columns == 0 {
        return Ok(report);
    }
    let mut conn = Connection::connect(&plan.endpoint, plan.connect_timeout, plan.poll).await?;
    let mut aligner = TimeAligner::new(plan.pre, plan.fpga_decim, plan.skip);
    let mut buf = vec![0u8; plan.chunk_bytes()];
    let row_bytes = columns * 2;
    tracing::info!(columns, chunk_bytes = buf.len(), "streaming");

    loop {
        let fill = conn.fill_cooperative(&mut buf, plan.poll, &progress.stop).await?;
        let received = match fill {
            Fill::Full => buf.len(),
            Fill::Eof(n) | Fill::Stopped(n) => n,
        };
        let usable = received - received % row_bytes;
        if usable > 0 {
            let words = words_le(&buf[..usable]);
            let rows = usable / row_bytes;
            deliver(&plan, &words, &mut aligner, sink.as_ref()).await?;
            report.rows += rows;
            report.chunks += 1;
            progress.chunks.fetch_add(1, Ordering::AcqRel);
            if aligner.triggered() && !progress.triggered.swap(true, Ordering::AcqRel) {
                tracing::info!(marker = ?aligner.last_marker(), "trigger marker decoded");
            }
        }
        match fill {
            Fill::Full if !progress.stop.load(Ordering::Acquire) => continue,
            Fill::Full | Fill::Stopped(_) => {
                tracing::debug!("stop requested");
                break;
            }
            Fill::Eof(_) => {
                tracing::debug!("end of stream");
                break;
            }
        }
    }

    report.markers = aligner.markers();
    report.triggered = aligner.triggered();
    tracing::info!(chunks = report.chunks, rows = report.rows, markers = report.markers, "lane finished");
    Ok(report)
}

async fn deliver(
    plan: &LanePlan,
    words: &[i16],
    aligner: &mut TimeAligner,
    sink: &dyn StorageSink,
) -> AppResult<()> {
    let columns = plan.channels.len();
    let blocks = aligner.align(words, columns);
    for block in blocks {
        for (col, channel) in plan.channels.iter().enumerate() {
            if !channel.enabled {
                continue;
            }
            let raw: Vec<i16> = block.range().map(|row| words[row * columns + col]).collect();
            let segment = Segment::new(
                channel.number,
                raw,
                block.start_tick,
                plan.dt_ns,
                plan.trigger_ns,
                channel.calibration,
            );
            sink.store_segment(segment).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySink;
    use crate::streaming::marker::{EventMarker, MarkerKind, MASTER_WORD};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn plan(endpoint: Endpoint, columns: usize) -> LanePlan {
        LanePlan {
            lane: 0,
            endpoint,
            channels: (1..=columns)
                .map(|number| LaneChannel {
                    number,
                    enabled: number != 2,
                    calibration: Calibration::default(),
                })
                .collect(),
            chunk_rows: 16,
            pre: 4,
            fpga_decim: 1,
            skip: 0,
            dt_ns: 1000.0,
            trigger_ns: 0.0,
            connect_timeout: Duration::from_secs(1),
            poll: Duration::from_millis(20),
        }
    }

    async fn serve(rows: Vec<Vec<i16>>, hold_open: bool) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let bytes: Vec<u8> = rows.iter().flatten().flat_map(|w| w.to_le_bytes()).collect();
            sock.write_all(&bytes).await.unwrap();
            if hold_open {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        endpoint
    }

    #[tokio::test]
    async fn stream_without_marker_is_not_triggered() {
        let rows: Vec<Vec<i16>> = (0..20).map(|r| vec![r as i16; 8]).collect();
        let sink = Arc::new(MemorySink::new());
        let worker = StreamWorker::spawn(plan(serve(rows, false).await, 8), sink.clone());
        let report = worker.join().await.unwrap();
        assert!(!report.triggered);
        assert_eq!(report.markers, 0);
        assert_eq!(report.rows, 20);
        assert_eq!(report.chunks, 2);
        // 7 enabled channels, one block per chunk
        assert_eq!(sink.segments().len(), 14);
        assert_eq!(sink.segments()[0].start_tick, -4);
        assert!(!sink.calls_per_channel().contains_key(&2));
    }

    #[tokio::test]
    async fn marker_aligns_following_rows() {
        let mut rows: Vec<Vec<i16>> = (0..3).map(|_| vec![7; 8]).collect();
        rows.push(
            EventMarker { index: 3, clock: 100, kind: MarkerKind::Gate }.encode(8, MASTER_WORD),
        );
        rows.extend((0..5).map(|_| vec![9; 8]));
        let sink = Arc::new(MemorySink::new());
        let worker = StreamWorker::spawn(plan(serve(rows, false).await, 8), sink.clone());
        let report = worker.join().await.unwrap();
        assert!(report.triggered);
        assert_eq!(report.markers, 1);

        let ch1: Vec<Segment> = sink.segments().into_iter().filter(|s| s.channel == 1).collect();
        assert_eq!(ch1.len(), 2);
        assert_eq!((ch1[0].start_tick, ch1[0].len()), (-4, 3));
        assert_eq!((ch1[1].start_tick, ch1[1].len()), (0, 5));
        assert!(ch1[1].raw.iter().all(|&v| v == 9));
    }

    #[tokio::test]
    async fn stop_interrupts_idle_stream() {
        let rows: Vec<Vec<i16>> = (0..3).map(|_| vec![1; 8]).collect();
        let sink = Arc::new(MemorySink::new());
        let worker = StreamWorker::spawn(plan(serve(rows, true).await, 8), sink.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!worker.is_finished());
        worker.stop();
        let report = tokio::time::timeout(Duration::from_secs(2), worker.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.rows, 3);
        assert!(!report.triggered);
    }
}
