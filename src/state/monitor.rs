//! Background watcher for a carrier's state stream.
//!
//! The carrier pushes status lines on its state port continuously and unsolicited.
//! A [`StateMonitor`] owns one background task per host that keeps a connection to
//! that port, parses every line and records:
//!
//! - the latest [`StateSnapshot`] (latest wins),
//! - the set of states observed since the last [`reset`](StateMonitor::reset).
//!
//! Transport errors never reach callers. The task closes the socket, waits a fixed
//! backoff and reconnects, forever, until the monitor is stopped. Callers waiting on
//! a state only ever see their own deadline expire.

use super::snapshot::{AcqState, StateSnapshot};
use crate::transport::{Connection, Endpoint, LinePoll};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// Timing knobs of the monitor task.
#[derive(Debug, Clone, Copy)]
pub struct MonitorTiming {
    /// Connect deadline for the state port.
    pub connect_timeout: Duration,
    /// Read poll interval; also the granularity of waits.
    pub poll: Duration,
    /// Pause between reconnect attempts.
    pub backoff: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            poll: Duration::from_secs(1),
            backoff: Duration::from_secs(1),
        }
    }
}

/// What the monitor has seen.
#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    /// Most recent status line, if any since the last reset.
    pub latest: Option<StateSnapshot>,
    /// States observed since the last reset.
    pub observed: HashSet<AcqState>,
    /// Whether the state socket is currently open.
    pub connected: bool,
}

#[derive(Debug)]
struct Shared {
    endpoint: Endpoint,
    timing: MonitorTiming,
    status: Mutex<MonitorStatus>,
    changed: Notify,
    wake: Notify,
    stop: AtomicBool,
    alive: AtomicBool,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn ingest(&self, line: &str) {
        let Some(snapshot) = StateSnapshot::parse(line) else {
            tracing::trace!(line, "ignoring malformed status line");
            return;
        };
        {
            let mut status = self.status.lock();
            status.latest = Some(snapshot);
            status.observed.insert(snapshot.state);
        }
        tracing::trace!(state = %snapshot.state, post = snapshot.post, "status");
        self.changed.notify_waiters();
    }

    fn set_connected(&self, connected: bool) {
        self.status.lock().connected = connected;
        self.changed.notify_waiters();
    }
}

/// Watches one host's state stream.
#[derive(Debug)]
pub struct StateMonitor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StateMonitor {
    /// Spawn the background task. Must be called inside a tokio runtime.
    pub fn start(endpoint: Endpoint, timing: MonitorTiming) -> Self {
        let shared = Arc::new(Shared {
            endpoint,
            timing,
            status: Mutex::new(MonitorStatus::default()),
            changed: Notify::new(),
            wake: Notify::new(),
            stop: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        });
        let task = tokio::spawn(run(shared.clone()));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// State port endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Copy of everything seen so far.
    pub fn status(&self) -> MonitorStatus {
        self.shared.status.lock().clone()
    }

    /// Latest status line.
    pub fn latest(&self) -> Option<StateSnapshot> {
        self.shared.status.lock().latest
    }

    /// Latest reported state.
    pub fn state(&self) -> Option<AcqState> {
        self.latest().map(|s| s.state)
    }

    /// Latest post-trigger sample count.
    pub fn post(&self) -> Option<u64> {
        self.latest().map(|s| s.post)
    }

    /// Whether `state` was observed since the last reset.
    pub fn has_observed(&self, state: AcqState) -> bool {
        self.shared.status.lock().observed.contains(&state)
    }

    /// Whether the state socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.shared.status.lock().connected
    }

    /// Whether the background task is still running.
    pub fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire) && !self.shared.stopping()
    }

    /// Clear the observed set and the latest counters.
    pub fn reset(&self) {
        {
            let mut status = self.shared.status.lock();
            status.observed.clear();
            status.latest = None;
        }
        self.shared.changed.notify_waiters();
    }

    /// Forget that `state` was observed. Returns whether it had been.
    pub fn discard(&self, state: AcqState) -> bool {
        self.shared.status.lock().observed.remove(&state)
    }

    /// Forget every observed state, keeping the latest counters.
    pub fn clear_observed(&self) {
        self.shared.status.lock().observed.clear();
    }

    /// Wait until `target` is in the observed set.
    ///
    /// Returns `false` when the deadline elapses or the monitor stops first.
    pub async fn wait4state(&self, target: AcqState, timeout: Option<Duration>) -> bool {
        self.wait_until(timeout, |status| status.observed.contains(&target))
            .await
    }

    /// Wait until `done` holds for the monitor status.
    ///
    /// The predicate is evaluated on every status update and at least once per poll
    /// interval.
    pub async fn wait_until<F>(&self, timeout: Option<Duration>, mut done: F) -> bool
    where
        F: FnMut(&MonitorStatus) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if done(&self.shared.status.lock()) {
                return true;
            }
            if !self.is_running() {
                return false;
            }
            let mut wait = self.shared.timing.poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                wait = wait.min(deadline - now);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Wait for the next status update. Returns `false` if none arrived `within`.
    pub async fn changed(&self, within: Duration) -> bool {
        tokio::time::timeout(within, self.shared.changed.notified())
            .await
            .is_ok()
    }

    /// Ask the task to finish without waiting for it.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        self.shared.changed.notify_waiters();
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(&self) {
        self.request_stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(endpoint = %self.shared.endpoint, error = %err, "state monitor task failed");
            }
        }
    }
}

impl Drop for StateMonitor {
    fn drop(&mut self) {
        self.request_stop();
    }
}

async fn run(shared: Arc<Shared>) {
    let span = tracing::info_span!("state_monitor", endpoint = %shared.endpoint);
    async {
        let timing = shared.timing;
        let mut failures = 0u32;
        while !shared.stopping() {
            match Connection::connect(&shared.endpoint, timing.connect_timeout, timing.poll).await {
                Ok(mut conn) => {
                    failures = 0;
                    shared.set_connected(true);
                    tracing::debug!("state stream connected");
                    let mut pending = Vec::new();
                    while !shared.stopping() {
                        match conn.poll_line(&mut pending, timing.poll).await {
                            Ok(LinePoll::Line(line)) => shared.ingest(&line),
                            Ok(LinePoll::Idle) => {}
                            Ok(LinePoll::Closed) => {
                                tracing::warn!("state stream closed by peer");
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "state stream read failed");
                                break;
                            }
                        }
                    }
                    shared.set_connected(false);
                }
                Err(err) => {
                    failures += 1;
                    if failures == 1 {
                        tracing::warn!(error = %err, "state stream unavailable, retrying");
                    } else {
                        tracing::debug!(error = %err, failures, "state stream still unavailable");
                    }
                }
            }
            if shared.stopping() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(timing.backoff) => {}
                _ = shared.wake.notified() => {}
            }
        }
        tracing::debug!("state monitor stopped");
    }
    .instrument(span)
    .await;
    shared.alive.store(false, Ordering::Release);
    shared.changed.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    /// State port that forwards broadcast lines to whoever is connected.
    async fn state_port() -> (Endpoint, broadcast::Sender<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, _) = broadcast::channel::<String>(64);
        let feed = tx.clone();
        let mut first = Some(feed.subscribe());
        tokio::spawn(async move {
            loop {
                let mut rx = first.take().unwrap_or_else(|| feed.subscribe());
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                while let Ok(line) = rx.recv().await {
                    if line == "<drop>" {
                        break;
                    }
                    if sock.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        (Endpoint::new("127.0.0.1", port), tx)
    }

    fn fast() -> MonitorTiming {
        MonitorTiming {
            connect_timeout: Duration::from_millis(500),
            poll: Duration::from_millis(50),
            backoff: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn wait_times_out_without_target_state() {
        let (endpoint, tx) = state_port().await;
        let monitor = StateMonitor::start(endpoint, fast());
        tx.send("1 0 0 0 0\n".into()).unwrap();
        assert!(monitor.wait4state(AcqState::Stop, Some(Duration::from_secs(2))).await);

        monitor.reset();
        assert!(monitor.latest().is_none());
        let armed = monitor.wait4state(AcqState::Arm, Some(Duration::from_secs(1))).await;
        assert!(!armed);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn wait_succeeds_when_state_arrives_in_time() {
        let (endpoint, tx) = state_port().await;
        let monitor = StateMonitor::start(endpoint, fast());
        monitor.reset();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send("2 0 0 0 0\n".into());
        });
        assert!(monitor.wait4state(AcqState::Arm, Some(Duration::from_secs(1))).await);
        assert_eq!(monitor.state(), Some(AcqState::Arm));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn malformed_lines_are_ignored_and_stream_reconnects() {
        let (endpoint, tx) = state_port().await;
        let monitor = StateMonitor::start(endpoint, fast());
        tx.send("not a status line\n".into()).unwrap();
        tx.send("4 0 512 9 0\n".into()).unwrap();
        assert!(monitor.wait4state(AcqState::Post, Some(Duration::from_secs(2))).await);
        assert_eq!(monitor.post(), Some(512));
        assert_eq!(monitor.status().observed.len(), 1);

        tx.send("<drop>".into()).unwrap();
        let reconnected = monitor
            .wait_until(Some(Duration::from_secs(2)), |s| !s.connected)
            .await;
        assert!(reconnected);
        assert!(monitor
            .wait_until(Some(Duration::from_secs(2)), |s| s.connected)
            .await);
        tx.send("1 0 0 0 0\n".into()).unwrap();
        assert!(monitor.wait4state(AcqState::Stop, Some(Duration::from_secs(2))).await);
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn stopped_monitor_ends_waits() {
        let (endpoint, _tx) = state_port().await;
        let monitor = StateMonitor::start(endpoint, fast());
        monitor.stop().await;
        assert!(!monitor.wait4state(AcqState::Arm, None).await);
    }
}
