//! Byte-exact TCP transport.
//!
//! Every service a carrier exposes (per-site command ports, the state stream,
//! streaming lanes, per-channel data ports, AWG upload ports) is reached through a
//! [`Connection`]. All operations run under a deadline; an expired deadline or any
//! socket error is reported as [`DaqError::DeviceOffline`] and the caller is expected
//! to drop the connection.
//!
//! Reads are full-transfer loops: a request for `n` bytes keeps reading until `n`
//! bytes arrived or the peer closed the socket. A short read at EOF returns the bytes
//! received so far, which is how the device signals the end of a stream.

use crate::error::{AppResult, DaqError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-operation I/O timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A TCP service identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of a cooperative chunk fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The buffer was filled completely.
    Full,
    /// The peer closed the stream after this many bytes.
    Eof(usize),
    /// The stop flag was raised after this many bytes.
    Stopped(usize),
}

/// Outcome of [`Connection::poll_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinePoll {
    /// A complete line, terminator stripped.
    Line(String),
    /// Nothing complete arrived within the poll interval.
    Idle,
    /// The peer closed the stream.
    Closed,
}

/// An open connection to one endpoint.
///
/// The socket is closed when the value is dropped.
pub struct Connection {
    endpoint: Endpoint,
    stream: BufReader<TcpStream>,
    io_timeout: Duration,
}

impl Connection {
    /// Connect to `endpoint`, failing with `DeviceOffline` after `connect_timeout`.
    pub async fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> AppResult<Self> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DaqError::offline(endpoint, "connection timeout"))?
            .map_err(|e| DaqError::offline(endpoint, e))?;

        // Disable Nagle's algorithm for low latency
        stream
            .set_nodelay(true)
            .map_err(|e| DaqError::offline(endpoint, e))?;

        tracing::debug!(%endpoint, "connected");

        Ok(Self {
            endpoint: endpoint.clone(),
            stream: BufReader::new(stream),
            io_timeout,
        })
    }

    /// Endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Change the per-operation I/O timeout.
    pub fn set_io_timeout(&mut self, io_timeout: Duration) {
        self.io_timeout = io_timeout;
    }

    /// Write all of `data`, looping over partial writes.
    pub async fn send_all(&mut self, data: &[u8]) -> AppResult<()> {
        let endpoint = &self.endpoint;
        let stream = self.stream.get_mut();
        let io = async {
            let mut sent = 0;
            while sent < data.len() {
                let n = stream.write(&data[sent..]).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("peer accepted no more bytes ({} still to send)", data.len() - sent),
                    ));
                }
                sent += n;
            }
            stream.flush().await
        };
        timeout(self.io_timeout, io)
            .await
            .map_err(|_| DaqError::offline(endpoint, "write timeout"))?
            .map_err(|e| DaqError::offline(endpoint, e))
    }

    /// Half-close the write side, telling the peer no more data follows.
    pub async fn finish_writing(&mut self) -> AppResult<()> {
        let endpoint = &self.endpoint;
        self.stream
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| DaqError::offline(endpoint, e))
    }

    /// Read up to `buf.len()` bytes, looping over short reads.
    ///
    /// Returns the number of bytes read; fewer than requested means the peer closed
    /// the stream.
    pub async fn recv_full(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = timeout(self.io_timeout, self.stream.read(&mut buf[filled..]))
                .await
                .map_err(|_| DaqError::offline(&self.endpoint, "read timeout"))?
                .map_err(|e| DaqError::offline(&self.endpoint, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Single read of whatever is available, up to `buf.len()` bytes.
    pub async fn recv_some(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        timeout(self.io_timeout, self.stream.read(buf))
            .await
            .map_err(|_| DaqError::offline(&self.endpoint, "read timeout"))?
            .map_err(|e| DaqError::offline(&self.endpoint, e))
    }

    /// Read until the peer closes the stream.
    pub async fn recv_to_end(&mut self) -> AppResult<Vec<u8>> {
        let mut out = Vec::new();
        timeout(self.io_timeout, self.stream.read_to_end(&mut out))
            .await
            .map_err(|_| DaqError::offline(&self.endpoint, "read timeout"))?
            .map_err(|e| DaqError::offline(&self.endpoint, e))?;
        Ok(out)
    }

    /// Fill `buf`, waking up every `poll` to check `stop`.
    ///
    /// Unlike [`recv_full`](Self::recv_full) an idle socket is not an error: the read
    /// simply continues until data, EOF or a stop request arrives.
    pub async fn fill_cooperative(
        &mut self,
        buf: &mut [u8],
        poll: Duration,
        stop: &AtomicBool,
    ) -> AppResult<Fill> {
        let mut filled = 0;
        while filled < buf.len() {
            match timeout(poll, self.stream.read(&mut buf[filled..])).await {
                Err(_) => {
                    if stop.load(Ordering::Acquire) {
                        return Ok(Fill::Stopped(filled));
                    }
                }
                Ok(Ok(0)) => return Ok(Fill::Eof(filled)),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(DaqError::offline(&self.endpoint, e)),
            }
        }
        Ok(Fill::Full)
    }

    /// Read one `\n`-terminated line without the terminator.
    ///
    /// Returns `None` when the peer closed the stream before any byte of a new line.
    pub async fn read_line(&mut self) -> AppResult<Option<String>> {
        self.read_line_within(self.io_timeout).await
    }

    /// Like [`read_line`](Self::read_line) with an explicit timeout.
    pub async fn read_line_within(&mut self, limit: Duration) -> AppResult<Option<String>> {
        let mut line = String::new();
        let n = timeout(limit, self.stream.read_line(&mut line))
            .await
            .map_err(|_| DaqError::offline(&self.endpoint, "read timeout"))?
            .map_err(|e| DaqError::offline(&self.endpoint, e))?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Wait up to `poll` for the rest of a line, accumulating into `pending`.
    ///
    /// Bytes read before the poll expires stay in `pending`, so calling again resumes
    /// the same line.
    pub async fn poll_line(&mut self, pending: &mut Vec<u8>, poll: Duration) -> AppResult<LinePoll> {
        match timeout(poll, self.stream.read_until(b'\n', pending)).await {
            Err(_) => Ok(LinePoll::Idle),
            Ok(Err(e)) => Err(DaqError::offline(&self.endpoint, e)),
            Ok(Ok(0)) => Ok(LinePoll::Closed),
            Ok(Ok(_)) => {
                if pending.last() != Some(&b'\n') {
                    // EOF in the middle of a line
                    return Ok(LinePoll::Closed);
                }
                let line = String::from_utf8_lossy(pending).trim_end().to_string();
                pending.clear();
                Ok(LinePoll::Line(line))
            }
        }
    }

    /// Read a 4-byte big-endian length prefix followed by up to `limit` payload bytes.
    ///
    /// The announced length is not trusted for allocation: at most `limit` bytes are
    /// read and the rest of a longer payload is left unread, so the connection must
    /// not be reused afterwards. A payload cut short by EOF is returned as received.
    pub async fn recv_length_prefixed(&mut self, limit: usize) -> AppResult<Vec<u8>> {
        let mut header = [0u8; 4];
        let got = self.recv_full(&mut header).await?;
        if got != header.len() {
            return Err(DaqError::protocol(
                &self.endpoint,
                format!("length prefix truncated after {got} bytes"),
            ));
        }
        let announced = u32::from_be_bytes(header) as usize;
        let len = announced.min(limit);
        if announced > limit {
            tracing::debug!(
                endpoint = %self.endpoint,
                announced,
                limit,
                "payload longer than requested, reading the head only"
            );
        }
        let mut payload = vec![0u8; len];
        let got = self.recv_full(&mut payload).await?;
        if got < len {
            tracing::warn!(
                endpoint = %self.endpoint,
                expected = len,
                received = got,
                "payload shorter than announced"
            );
            payload.truncate(got);
        }
        Ok(payload)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// Decode little-endian 16-bit words, dropping a trailing odd byte.
pub fn words_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|w| i16::from_le_bytes([w[0], w[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_once(payload: Vec<u8>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // dribble the payload to force short reads on the client
            for chunk in payload.chunks(3) {
                sock.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn short_read_at_eof_returns_partial_data() {
        let endpoint = serve_once(vec![1, 2, 3, 4, 5, 6, 7]).await;
        let mut conn = Connection::connect(&endpoint, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = conn.recv_full(&mut buf).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(&buf[..7], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn length_prefixed_payload_is_reassembled() {
        let mut payload = 6u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0x01, 0x00, 0xff, 0xff, 0x55, 0xaa]);
        let endpoint = serve_once(payload).await;
        let mut conn = Connection::connect(&endpoint, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        let bytes = conn.recv_length_prefixed(1024).await.unwrap();
        assert_eq!(words_le(&bytes), vec![1, -1, 0xaa55u16 as i16]);
    }

    #[tokio::test]
    async fn announced_length_is_capped_by_limit() {
        let mut payload = u32::MAX.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);
        let endpoint = serve_once(payload).await;
        let mut conn = Connection::connect(&endpoint, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        let bytes = conn.recv_length_prefixed(4).await.unwrap();
        assert_eq!(words_le(&bytes), vec![1, 2]);
    }

    #[tokio::test]
    async fn refused_connection_is_device_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = Endpoint::new("127.0.0.1", port);
        let err = Connection::connect(&endpoint, Duration::from_secs(1), DEFAULT_IO_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DeviceOffline);
    }
}
