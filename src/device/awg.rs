//! Waveform upload for generator modules.
//!
//! The distributor takes one binary image: every sample row holds one little-endian
//! `i16` per output channel. The image goes to the one-shot port (or the rearm port
//! one above it); the device then publishes a checksum of what it received on the
//! checksum port.

use crate::error::AppResult;
use crate::transport::{Connection, Endpoint};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Full-scale code.
pub const FULL_SCALE: f64 = 32767.0;

/// Size of the checksum report.
pub const CHECKSUM_LEN: usize = 40;

/// Build the interleaved upload image.
///
/// Values are clamped to `[-1, 1]` and scaled by [`FULL_SCALE`]. Channels shorter than
/// the longest are padded with their last value; an empty channel outputs 0.
pub fn encode_waveforms(channels: &[Vec<f64>]) -> Bytes {
    let rows = channels.iter().map(Vec::len).max().unwrap_or(0);
    let mut image = BytesMut::with_capacity(rows * channels.len() * 2);
    for row in 0..rows {
        for channel in channels {
            let value = channel
                .get(row)
                .or_else(|| channel.last())
                .copied()
                .unwrap_or(0.0);
            image.put_i16_le((value.clamp(-1.0, 1.0) * FULL_SCALE) as i16);
        }
    }
    image.freeze()
}

/// Receipt of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Bytes sent.
    pub bytes: usize,
    /// Device answer on the upload port after the image.
    pub reply: String,
    /// Checksum report, trimmed.
    pub checksum: String,
}

/// Send `image` to `upload` and read the checksum from `checksum`.
pub async fn upload(
    upload: &Endpoint,
    checksum: &Endpoint,
    image: &[u8],
    connect_timeout: Duration,
) -> AppResult<UploadReceipt> {
    // the device needs time proportional to the image size to write it out
    let io_timeout = Duration::from_secs(3) + Duration::from_secs_f64(image.len() as f64 / 1e6);
    let mut conn = Connection::connect(upload, connect_timeout, io_timeout).await?;

    let mut banner = [0u8; 1024];
    let n = conn.recv_some(&mut banner).await?;
    tracing::debug!(endpoint = %upload, banner = %String::from_utf8_lossy(&banner[..n]).trim(), "upload port ready");

    conn.send_all(image).await?;
    conn.finish_writing().await?;
    let reply = String::from_utf8_lossy(&conn.recv_to_end().await?).trim().to_string();
    drop(conn);

    let mut conn = Connection::connect(checksum, connect_timeout, io_timeout).await?;
    let mut report = [0u8; CHECKSUM_LEN];
    let n = conn.recv_full(&mut report).await?;
    let checksum_text = String::from_utf8_lossy(&report[..n]).trim().to_string();

    tracing::info!(
        endpoint = %upload,
        bytes = image.len(),
        checksum = %checksum_text,
        "waveform uploaded"
    );
    Ok(UploadReceipt {
        bytes: image.len(),
        reply,
        checksum: checksum_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn image_is_padded_and_interleaved() {
        let image = encode_waveforms(&[vec![1.0, -1.0, 0.5], vec![0.25], vec![], vec![2.0, -3.0]]);
        let words: Vec<i16> = image
            .chunks_exact(2)
            .map(|w| i16::from_le_bytes([w[0], w[1]]))
            .collect();
        assert_eq!(
            words,
            vec![
                32767, 8191, 0, 32767, //
                -32767, 8191, 0, -32767, //
                16383, 8191, 0, -32767,
            ]
        );
    }

    #[test]
    fn empty_input_gives_empty_image() {
        assert!(encode_waveforms(&[]).is_empty());
        assert!(encode_waveforms(&[vec![], vec![]]).is_empty());
    }

    #[tokio::test]
    async fn upload_reads_reply_and_checksum() {
        let upload_port = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let checksum_port = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = Endpoint::new("127.0.0.1", upload_port.local_addr().unwrap().port());
        let ck = Endpoint::new("127.0.0.1", checksum_port.local_addr().unwrap().port());

        let server = tokio::spawn(async move {
            let (mut s, _) = upload_port.accept().await.unwrap();
            s.write_all(b"awg ready\n").await.unwrap();
            let mut image = Vec::new();
            s.read_to_end(&mut image).await.unwrap();
            s.write_all(format!("{} bytes\n", image.len()).as_bytes()).await.unwrap();
            drop(s);
            let (mut s, _) = checksum_port.accept().await.unwrap();
            s.write_all(format!("{:<40}", "0123abcd").as_bytes()).await.unwrap();
            image.len()
        });

        let image = encode_waveforms(&[vec![0.0; 100], vec![0.1; 100]]);
        let receipt = upload(&up, &ck, &image, Duration::from_secs(1)).await.unwrap();
        assert_eq!(receipt.bytes, 400);
        assert_eq!(receipt.reply, "400 bytes");
        assert_eq!(receipt.checksum, "0123abcd");
        assert_eq!(server.await.unwrap(), 400);
    }
}
