//! Knob protocol client.
//!
//! One [`CommandClient`] talks to one control endpoint (a site's command port). The
//! connection is created lazily on first use and shared by every caller on that
//! device; a tokio mutex around it serializes request/response exchanges, so the
//! wire never sees interleaved traffic.
//!
//! # Framing
//!
//! A request is one or more `\n`-terminated lines. The device answers every line with
//! one frame: zero or more text lines closed by an empty line or by `EOF[ code]`.
//! A frame whose first line starts with `ERROR`, or whose trailer carries a non-zero
//! code, is a rejection. Frames are always read in full, so a rejection leaves the
//! connection usable; transport and framing failures drop it instead and the next
//! call reconnects.
//!
//! # Chains
//!
//! [`chain_start`](CommandClient::chain_start) opens a transaction and returns a
//! [`Chain`] that holds the command lock until it is sent or dropped. Lines added to
//! the chain are held back and [`Chain::send`] writes them as a single multi-line
//! request. Every other caller on the device waits on the lock meanwhile, so nothing
//! interleaves with the transaction. The owner must go through the [`Chain`] handle:
//! a command issued on the client itself while the owner holds the chain would wait
//! forever.

use super::cache::{strip_echo, SettingsCache};
use super::schema::{Access, IndexedKnob, Knob, KnobSchema};
use super::value::{KnobKind, KnobType};
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::transport::{Connection, Endpoint, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// One response frame.
#[derive(Debug)]
struct Frame {
    lines: Vec<String>,
    code: Option<i64>,
}

impl Frame {
    fn body(&self) -> String {
        self.lines.join("\n")
    }

    fn is_rejection(&self) -> bool {
        self.lines
            .first()
            .map_or(false, |first| first.starts_with("ERROR"))
            || self.code.map_or(false, |code| code != 0)
    }
}

/// Non-empty trimmed request lines of `text`.
fn request_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// Request line setting `path` to `value`.
///
/// Only executables encode to nothing; an empty value of any other kind would go
/// out as a bare path, which the device reads as a query.
fn set_line<T: KnobType>(endpoint: &Endpoint, path: &str, value: &T) -> AppResult<String> {
    let text = value.encode();
    if text.is_empty() && T::KIND != KnobKind::Exec {
        return Err(DaqError::InvalidSetup(format!(
            "empty {} value for {} on {}",
            T::KIND,
            path,
            endpoint
        )));
    }
    if text.contains('\n') {
        return Err(DaqError::InvalidSetup(format!(
            "value for {} on {} spans several lines",
            path, endpoint
        )));
    }
    Ok(if text.is_empty() {
        path.to_string()
    } else {
        format!("{} {}", path, text)
    })
}

fn writable<T>(knob: &Knob<T>, schema: &KnobSchema) -> AppResult<()> {
    if knob.spec().access == Access::ReadOnly {
        return Err(DaqError::InvalidSetup(format!(
            "{} is read-only on {}",
            knob.path(),
            schema.family
        )));
    }
    Ok(())
}

/// Client for one site's command port.
pub struct CommandClient {
    endpoint: Endpoint,
    site: u8,
    schema: &'static KnobSchema,
    connect_timeout: Duration,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
    chain_open: AtomicBool,
    cache: Option<Arc<SettingsCache>>,
}

impl CommandClient {
    /// Create a client. No connection is made until the first command.
    pub fn new(endpoint: Endpoint, site: u8, schema: &'static KnobSchema) -> Self {
        Self {
            endpoint,
            site,
            schema,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            conn: Mutex::new(None),
            chain_open: AtomicBool::new(false),
            cache: None,
        }
    }

    /// Override connect and per-operation I/O deadlines.
    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// Record successful commands into `cache` while it is open.
    pub fn with_cache(mut self, cache: Arc<SettingsCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Control endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Site number (0 is the carrier).
    pub fn site(&self) -> u8 {
        self.site
    }

    /// Knob schema of the device family behind this endpoint.
    pub fn schema(&self) -> &'static KnobSchema {
        self.schema
    }

    /// Issue `text` and return the framed response.
    ///
    /// Multi-line `text` is sent as one request and the responses are joined with
    /// `\n`. While a chain is open the call waits until it has been sent or dropped.
    pub async fn send_command(&self, text: &str, expect_answer: bool) -> AppResult<String> {
        let lines: Vec<String> = request_lines(text).collect();
        if lines.is_empty() {
            return Ok(String::new());
        }
        let responses = self.transact(&lines).await?;
        if !expect_answer {
            return Ok(String::new());
        }
        Ok(responses.join("\n"))
    }

    /// Query `path` and return the answer with any echo of the path removed.
    pub async fn query(&self, path: &str) -> AppResult<String> {
        let response = self.send_command(path, true).await?;
        Ok(strip_echo(path, response.trim()).to_string())
    }

    /// Send `path value`, or the bare path for an empty value.
    pub async fn set_raw(&self, path: &str, value: &str) -> AppResult<()> {
        let command = if value.is_empty() {
            path.to_string()
        } else {
            format!("{} {}", path, value)
        };
        self.send_command(&command, false).await.map(|_| ())
    }

    /// Query a path and decode it as `T`.
    pub async fn get_path<T: KnobType>(&self, path: &str) -> AppResult<T> {
        let raw = self.query(path).await?;
        T::decode(&raw).map_err(|msg| DaqError::protocol(&self.endpoint, format!("{}: {}", path, msg)))
    }

    /// Encode `value` and set it on `path`.
    ///
    /// Empty strings and lists are refused with `InvalidSetup`.
    pub async fn set_path<T: KnobType>(&self, path: &str, value: &T) -> AppResult<()> {
        let line = set_line(&self.endpoint, path, value)?;
        self.send_command(&line, false).await.map(|_| ())
    }

    /// Read a typed knob.
    pub async fn get<T: KnobType>(&self, knob: &Knob<T>) -> AppResult<T> {
        self.get_path(knob.path()).await
    }

    /// Write a typed knob.
    pub async fn set<T: KnobType>(&self, knob: &Knob<T>, value: &T) -> AppResult<()> {
        writable(knob, self.schema)?;
        self.set_path(knob.path(), value).await
    }

    /// Run a value-less executable.
    pub async fn exec(&self, knob: &Knob<()>) -> AppResult<()> {
        self.set(knob, &()).await
    }

    /// Read channel `index` of a per-channel knob.
    pub async fn get_at<T: KnobType>(&self, knob: &IndexedKnob<T>, index: usize) -> AppResult<T> {
        self.get_path(&knob.path(index)).await
    }

    /// Write channel `index` of a per-channel knob.
    pub async fn set_at<T: KnobType>(
        &self,
        knob: &IndexedKnob<T>,
        index: usize,
        value: &T,
    ) -> AppResult<()> {
        self.set_path(&knob.path(index), value).await
    }

    /// Open a chain transaction.
    ///
    /// Fails with `InvalidSetup` if one is already open on this device; otherwise
    /// waits for the command lock and keeps it until the chain is sent or dropped.
    pub async fn chain_start(&self) -> AppResult<Chain<'_>> {
        if self.chain_open.swap(true, Ordering::AcqRel) {
            return Err(DaqError::InvalidSetup(format!(
                "chain already open on {}",
                self.endpoint
            )));
        }
        let open = OpenFlag(&self.chain_open);
        let slot = self.conn.lock().await;
        Ok(Chain {
            client: self,
            slot,
            lines: Vec::new(),
            _open: open,
        })
    }

    /// Whether a chain is open.
    pub fn in_chain(&self) -> bool {
        self.chain_open.load(Ordering::Acquire)
    }

    /// Run `lines` as one chain transaction.
    pub async fn chain<I, S>(&self, lines: I) -> AppResult<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut chain = self.chain_start().await?;
        for line in lines {
            chain.append(line.as_ref());
        }
        chain.send().await
    }

    /// Drop the connection. The next command reconnects.
    pub async fn close(&self) {
        *self.conn.lock().await = None;
    }

    async fn transact(&self, lines: &[String]) -> AppResult<Vec<String>> {
        let mut slot = self.conn.lock().await;
        self.run(&mut slot, lines).await
    }

    /// Exchange `lines` on the locked connection and check every frame.
    async fn run(&self, slot: &mut Option<Connection>, lines: &[String]) -> AppResult<Vec<String>> {
        let frames = match self.exchange(slot, lines).await {
            Ok(frames) => frames,
            Err(err) => {
                if matches!(err.kind(), ErrorKind::DeviceOffline | ErrorKind::ProtocolError) {
                    tracing::warn!(endpoint = %self.endpoint, error = %err, "dropping command connection");
                    *slot = None;
                }
                return Err(err);
            }
        };

        let mut responses = Vec::with_capacity(frames.len());
        let mut rejection = None;
        for (line, frame) in lines.iter().zip(frames) {
            let body = frame.body();
            if frame.is_rejection() {
                tracing::warn!(endpoint = %self.endpoint, command = %line, response = %body, "command rejected");
                if rejection.is_none() {
                    rejection = Some(DaqError::RemoteRejected {
                        endpoint: self.endpoint.clone(),
                        command: line.clone(),
                        response: body.clone(),
                    });
                }
            } else if let Some(cache) = &self.cache {
                cache.record(self.site, self.schema, line, &body);
            }
            responses.push(body);
        }
        match rejection {
            Some(err) => Err(err),
            None => Ok(responses),
        }
    }

    async fn exchange(
        &self,
        slot: &mut Option<Connection>,
        lines: &[String],
    ) -> AppResult<Vec<Frame>> {
        if slot.is_none() {
            let conn = Connection::connect(&self.endpoint, self.connect_timeout, self.io_timeout).await?;
            *slot = Some(conn);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| DaqError::offline(&self.endpoint, "connection unavailable"))?;

        let mut request = lines.join("\n");
        request.push('\n');
        tracing::debug!(endpoint = %self.endpoint, request = %request.trim_end(), "knob request");
        conn.send_all(request.as_bytes()).await?;

        let mut frames = Vec::with_capacity(lines.len());
        for _ in lines {
            frames.push(read_frame(conn).await?);
        }
        Ok(frames)
    }
}

/// Clears the open-chain flag when the chain goes away, however it ends.
struct OpenFlag<'a>(&'a AtomicBool);

impl Drop for OpenFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An open chain transaction holding the device's command lock.
///
/// Dropping it without [`send`](Chain::send) discards the chained lines.
pub struct Chain<'a> {
    client: &'a CommandClient,
    slot: MutexGuard<'a, Option<Connection>>,
    lines: Vec<String>,
    _open: OpenFlag<'a>,
}

impl Chain<'_> {
    /// Append request text. Each non-empty line becomes one chained command.
    pub fn append(&mut self, text: &str) {
        self.lines.extend(request_lines(text));
    }

    /// Chain a set of `path` to `value`.
    pub fn set_path<T: KnobType>(&mut self, path: &str, value: &T) -> AppResult<()> {
        let line = set_line(&self.client.endpoint, path, value)?;
        self.lines.push(line);
        Ok(())
    }

    /// Chain a set of a typed knob.
    pub fn set<T: KnobType>(&mut self, knob: &Knob<T>, value: &T) -> AppResult<()> {
        writable(knob, self.client.schema)?;
        self.set_path(knob.path(), value)
    }

    /// Number of chained commands.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing has been chained.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Discard the chain. Returns the number of dropped lines.
    pub fn abort(self) -> usize {
        self.lines.len()
    }

    /// Send all chained lines as one request and release the lock.
    ///
    /// Returns one response per chained line.
    pub async fn send(mut self) -> AppResult<Vec<String>> {
        let lines = std::mem::take(&mut self.lines);
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(endpoint = %self.client.endpoint, lines = lines.len(), "sending chain");
        let client = self.client;
        client.run(&mut self.slot, &lines).await
    }
}

impl std::fmt::Debug for Chain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("endpoint", &self.client.endpoint)
            .field("lines", &self.lines)
            .finish()
    }
}

impl std::fmt::Debug for CommandClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandClient")
            .field("endpoint", &self.endpoint)
            .field("site", &self.site)
            .field("family", &self.schema.family)
            .finish()
    }
}

async fn read_frame(conn: &mut Connection) -> AppResult<Frame> {
    let mut lines = Vec::new();
    loop {
        let Some(line) = conn.read_line().await? else {
            return Err(DaqError::offline(
                conn.endpoint(),
                "connection closed in the middle of a response",
            ));
        };
        if line.is_empty() {
            return Ok(Frame { lines, code: None });
        }
        if line == "EOF" || line.starts_with("EOF ") {
            let trailer = line[3..].trim();
            let code = if trailer.is_empty() {
                None
            } else {
                Some(trailer.parse::<i64>().map_err(|_| {
                    DaqError::protocol(conn.endpoint(), format!("malformed trailer '{}'", line))
                })?)
            };
            return Ok(Frame { lines, code });
        }
        lines.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knob::schema::carrier;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    type Store = Arc<parking_lot::Mutex<HashMap<String, String>>>;

    fn respond(store: &Store, line: &str) -> Option<String> {
        match line {
            "hangup" => return None,
            "reject" => return Some("ERROR: not today\n\n".into()),
            "coded" => return Some("EOF 3\n".into()),
            "multi" => return Some("first\nsecond\nEOF 0\n".into()),
            _ => {}
        }
        let mut store = store.lock();
        match line.split_once(' ') {
            Some((name, value)) => {
                store.insert(name.to_string(), value.to_string());
                Some("\n".into())
            }
            None => match store.get(line) {
                Some(value) => Some(format!("{} {}\n\n", line, value)),
                None => Some(format!("ERROR: unknown knob {}\n\n", line)),
            },
        }
    }

    async fn knob_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store: Store = Arc::default();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let store = store.clone();
                tokio::spawn(async move {
                    let (rd, mut wr) = sock.into_split();
                    let mut lines = BufReader::new(rd).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Some(reply) = respond(&store, line.trim()) else {
                            break;
                        };
                        if wr.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    fn client(endpoint: Endpoint) -> CommandClient {
        CommandClient::new(endpoint, 0, &carrier::SCHEMA)
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn typed_values_round_trip() {
        let client = client(knob_server().await);

        client.set_path("TEST:BOOL", &true).await.unwrap();
        client.set_path("TEST:INT", &-42i64).await.unwrap();
        client.set_path("TEST:FLOAT", &2.5e-3f64).await.unwrap();
        client.set_path("TEST:STR", &"FPCLK".to_string()).await.unwrap();
        client.set_path("TEST:LIST", &vec![1i64, 0, 1]).await.unwrap();
        client.set_path("TEST:FLIST", &vec![0.5f64, -1.25]).await.unwrap();

        assert!(client.get_path::<bool>("TEST:BOOL").await.unwrap());
        assert_eq!(client.get_path::<i64>("TEST:INT").await.unwrap(), -42);
        assert_eq!(client.get_path::<f64>("TEST:FLOAT").await.unwrap(), 2.5e-3);
        assert_eq!(client.get_path::<String>("TEST:STR").await.unwrap(), "FPCLK");
        assert_eq!(client.get_path::<Vec<i64>>("TEST:LIST").await.unwrap(), vec![1, 0, 1]);
        assert_eq!(
            client.get_path::<Vec<f64>>("TEST:FLIST").await.unwrap(),
            vec![0.5, -1.25]
        );
    }

    #[tokio::test]
    async fn rejection_keeps_connection_in_sync() {
        let client = client(knob_server().await);
        client.set(&carrier::TRANSIENT_PRE, &10).await.unwrap();

        let err = client.send_command("reject", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
        let err = client.send_command("coded", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);

        assert_eq!(client.send_command("multi", true).await.unwrap(), "first\nsecond");
        assert_eq!(client.get(&carrier::TRANSIENT_PRE).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn read_only_knob_cannot_be_set() {
        let client = client(knob_server().await);
        let err = client
            .set(&carrier::SYS_CLK_CONFIG, &"1-1_bypass".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
    }

    #[tokio::test]
    async fn dropped_connection_is_offline_then_recreated() {
        let client = client(knob_server().await);
        client.set_raw("shot", "4").await.unwrap();

        let err = client.send_command("hangup", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceOffline);

        // a fresh connection is opened lazily
        client.set_raw("shot", "5").await.unwrap();
        assert_eq!(client.query("shot").await.unwrap(), "5");
    }

    #[tokio::test]
    async fn nested_chain_start_is_invalid_setup() {
        let client = client(knob_server().await);
        let mut chain = client.chain_start().await.unwrap();
        let err = client.chain_start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
        assert!(client.in_chain());

        chain.append("TRANSIENT:PRE 0");
        assert_eq!(chain.abort(), 1);
        assert!(!client.in_chain());
        // the lock is free again once the chain is gone
        client.set_raw("shot", "2").await.unwrap();
    }

    #[tokio::test]
    async fn chain_is_one_request_with_one_line_per_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // let the whole request land before looking at it
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let lines = request.lines().count();
            sock.write_all("\n".repeat(lines).as_bytes()).await.unwrap();
            tx.send(request).unwrap();
        });

        let client = client(Endpoint::new("127.0.0.1", port));
        let mut chain = client.chain_start().await.unwrap();
        chain.append("TRANSIENT:PRE 0");
        chain.append("TRANSIENT:POST 100000");
        chain.set(&carrier::TRANSIENT_OSAM, &1).unwrap();
        chain.set(&carrier::TRANSIENT_REPEAT, &0).unwrap();
        assert_eq!(chain.len(), 4);
        let responses = chain.send().await.unwrap();
        assert_eq!(responses.len(), 4);

        let request = rx.await.unwrap();
        assert_eq!(
            request,
            "TRANSIENT:PRE 0\nTRANSIENT:POST 100000\nTRANSIENT:OSAM 1\nTRANSIENT:REPEAT 0\n"
        );
    }

    #[tokio::test]
    async fn other_callers_wait_for_the_open_chain() {
        let client = Arc::new(client(knob_server().await));
        client.set_raw("shot", "4").await.unwrap();

        let mut chain = client.chain_start().await.unwrap();
        chain.append("TRANSIENT:PRE 0");
        let other = client.clone();
        let outside = tokio::spawn(async move { other.set_raw("shot", "9").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!outside.is_finished());

        assert_eq!(chain.abort(), 1);
        outside.await.unwrap().unwrap();
        assert_eq!(client.query("shot").await.unwrap(), "9");
    }

    #[tokio::test]
    async fn multi_line_append_chains_every_line() {
        let client = client(knob_server().await);
        let mut chain = client.chain_start().await.unwrap();
        chain.append("A 5\n  B 6\n\n");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.send().await.unwrap().len(), 2);

        assert_eq!(client.query("A").await.unwrap(), "5");
        assert_eq!(client.query("B").await.unwrap(), "6");
    }

    #[tokio::test]
    async fn empty_values_are_refused() {
        let client = client(knob_server().await);
        client.set_path("TEST:STR", &"FPCLK".to_string()).await.unwrap();
        client.set_path("TEST:LIST", &vec![1i64, 2]).await.unwrap();

        let err = client.set_path("TEST:STR", &String::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
        let err = client.set_path("TEST:LIST", &Vec::<i64>::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);
        let err = client
            .set_path("TEST:STR", &"two\nlines".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetup);

        assert_eq!(client.get_path::<String>("TEST:STR").await.unwrap(), "FPCLK");
        assert_eq!(client.get_path::<Vec<i64>>("TEST:LIST").await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn cache_records_successful_sets() {
        let cache = Arc::new(SettingsCache::new("127.0.0.1"));
        let client = client(knob_server().await).with_cache(cache.clone());
        cache.begin();
        client.set(&carrier::TRANSIENT_POST, &5000).await.unwrap();
        client.set(&carrier::TRANSIENT_SET_ARM, &true).await.unwrap();
        let _ = client.send_command("reject", true).await;
        let log = cache.close().unwrap();
        assert_eq!(log["0"]["TRANSIENT:POST"], "5000");
        assert!(log["0"].get("TRANSIENT:SET_ARM").is_none());
        assert!(log["0"].get("reject").is_none());
    }
}
