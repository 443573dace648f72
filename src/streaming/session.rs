//! Per-shot grouping of lane workers.

use super::worker::{LanePlan, LaneReport, StreamWorker};
use crate::error::{AppResult, DaqError};
use crate::storage::StorageSink;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    /// Carrier host.
    pub host: String,
    /// Shot number.
    pub shot: u64,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Session identity.
    pub key: SessionKey,
    /// One entry per lane.
    pub lanes: Vec<LaneReport>,
}

impl SessionReport {
    /// Whether any lane decoded a marker.
    pub fn triggered(&self) -> bool {
        self.lanes.iter().any(|lane| lane.triggered)
    }
}

/// The workers of one armed shot.
#[derive(Debug)]
pub struct StreamSession {
    key: SessionKey,
    workers: Vec<StreamWorker>,
}

impl StreamSession {
    /// Spawn one worker per lane plan.
    pub fn start(key: SessionKey, plans: Vec<LanePlan>, sink: Arc<dyn StorageSink>) -> Self {
        tracing::info!(host = %key.host, shot = key.shot, lanes = plans.len(), "starting stream session");
        let workers = plans
            .into_iter()
            .map(|plan| StreamWorker::spawn(plan, sink.clone()))
            .collect();
        Self { key, workers }
    }

    /// Session identity.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Number of lanes.
    pub fn lanes(&self) -> usize {
        self.workers.len()
    }

    /// Whether any lane has decoded a marker so far.
    pub fn any_triggered(&self) -> bool {
        self.workers.iter().any(StreamWorker::triggered)
    }

    /// Ask every worker to stop.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Join every worker.
    ///
    /// With `drain` set, every lane is given until `deadline` to reach the end of its
    /// stream and only the lanes still running then are stopped; otherwise all lanes
    /// stop right away. The first worker error is returned after all workers exited.
    pub async fn finish(self, drain: bool, deadline: Duration) -> AppResult<SessionReport> {
        let until = Instant::now() + deadline;
        if !drain {
            self.stop();
        } else {
            while Instant::now() < until && !self.workers.iter().all(StreamWorker::is_finished) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if !self.workers.iter().all(StreamWorker::is_finished) {
                tracing::warn!(host = %self.key.host, shot = self.key.shot, "streams still running at deadline, stopping");
                self.stop();
            }
        }

        let mut lanes = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for worker in self.workers {
            let lane = worker.lane();
            match worker.join().await {
                Ok(report) => lanes.push(report),
                Err(err) => {
                    tracing::warn!(lane, error = %err, "stream worker failed");
                    lanes.push(LaneReport { lane, ..LaneReport::default() });
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(SessionReport { key: self.key, lanes }),
        }
    }
}

/// Live sessions, at most one per host.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    live: Mutex<HashMap<String, StreamSession>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `session`; fails if its host already has one.
    pub fn insert(&self, session: StreamSession) -> AppResult<()> {
        let mut live = self.live.lock();
        if let Some(existing) = live.get(&session.key.host) {
            session.stop();
            return Err(DaqError::InvalidSetup(format!(
                "stream session for {} (shot {}) is still live",
                existing.key.host, existing.key.shot
            )));
        }
        live.insert(session.key.host.clone(), session);
        Ok(())
    }

    /// Whether `host` has a live session.
    pub fn is_live(&self, host: &str) -> bool {
        self.live.lock().contains_key(host)
    }

    /// Key of `host`'s live session.
    pub fn key(&self, host: &str) -> Option<SessionKey> {
        self.live.lock().get(host).map(|s| s.key.clone())
    }

    /// Whether `host`'s live session has decoded a marker.
    pub fn triggered(&self, host: &str) -> bool {
        self.live.lock().get(host).map_or(false, StreamSession::any_triggered)
    }

    /// Remove and return `host`'s session.
    pub fn take(&self, host: &str) -> Option<StreamSession> {
        self.live.lock().remove(host)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and join every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<StreamSession> = self.live.lock().drain().map(|(_, s)| s).collect();
        let finishing = sessions.into_iter().map(|session| {
            let key = session.key.clone();
            async move {
                if let Err(err) = session.finish(false, Duration::ZERO).await {
                    tracing::warn!(host = %key.host, shot = key.shot, error = %err, "stream session ended with error");
                }
            }
        });
        join_all(finishing).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Calibration, MemorySink};
    use crate::streaming::worker::LaneChannel;
    use crate::transport::Endpoint;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn idle_lane(lane: usize) -> LanePlan {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        lane_plan(lane, endpoint)
    }

    /// Lane that sends `rows` plain rows after `delay`, then closes.
    async fn late_lane(lane: usize, rows: usize, delay: Duration) -> LanePlan {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(delay).await;
            let bytes: Vec<u8> = (0..rows * 8).flat_map(|w| (w as i16).to_le_bytes()).collect();
            let _ = sock.write_all(&bytes).await;
        });
        lane_plan(lane, endpoint)
    }

    fn lane_plan(lane: usize, endpoint: Endpoint) -> LanePlan {
        LanePlan {
            lane,
            endpoint,
            channels: vec![
                LaneChannel { number: 1, enabled: true, calibration: Calibration::default() };
                8
            ],
            chunk_rows: 4,
            pre: 0,
            fpga_decim: 1,
            skip: 0,
            dt_ns: 1.0,
            trigger_ns: 0.0,
            connect_timeout: Duration::from_secs(1),
            poll: Duration::from_millis(20),
        }
    }

    fn key(shot: u64) -> SessionKey {
        SessionKey { host: "acq2106_064".into(), shot }
    }

    #[tokio::test]
    async fn second_live_session_is_rejected() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(MemorySink::new());
        registry
            .insert(StreamSession::start(key(1), vec![idle_lane(0).await], sink.clone()))
            .unwrap();
        let err = registry
            .insert(StreamSession::start(key(2), vec![idle_lane(0).await], sink.clone()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidSetup);
        assert_eq!(registry.key("acq2106_064"), Some(key(1)));

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn untriggered_session_reports_not_triggered() {
        let sink = Arc::new(MemorySink::new());
        let session = StreamSession::start(key(7), vec![idle_lane(0).await, idle_lane(1).await], sink);
        assert_eq!(session.lanes(), 2);
        let report = session.finish(true, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.lanes.len(), 2);
        assert!(!report.triggered());
    }

    #[tokio::test]
    async fn draining_waits_for_untriggered_lanes() {
        let sink = Arc::new(MemorySink::new());
        let lanes = vec![
            late_lane(0, 20, Duration::from_millis(200)).await,
            late_lane(1, 12, Duration::from_millis(300)).await,
        ];
        let session = StreamSession::start(key(8), lanes, sink);
        let report = session.finish(true, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.lanes[0].rows, 20);
        assert_eq!(report.lanes[1].rows, 12);
    }

    #[tokio::test]
    async fn without_drain_lanes_stop_at_once() {
        let sink = Arc::new(MemorySink::new());
        let session = StreamSession::start(key(9), vec![late_lane(0, 20, Duration::from_secs(2)).await], sink);
        let started = Instant::now();
        let report = session.finish(false, Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.lanes[0].rows, 0);
    }
}
