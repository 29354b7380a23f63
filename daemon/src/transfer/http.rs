//! HTTP relay transport
//!
//! Uploads the memory as `POST {base}/upload`, with the WAV bytes as the
//! body and the color in the `X-Color-Data: r,g,b` header.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{TransferError, TransferJob, Transport};

pub const COLOR_HEADER: &str = "X-Color-Data";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport that posts memories to the relay server
pub struct HttpRelay {
    client: reqwest::Client,
    upload_url: String,
}

impl HttpRelay {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let upload_url = format!("{}/upload", base_url.trim_end_matches('/'));
        info!(%upload_url, "HTTP relay configured");

        Ok(Self { client, upload_url })
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }
}

#[async_trait]
impl Transport for HttpRelay {
    async fn transfer(&self, job: &TransferJob) -> Result<(), TransferError> {
        let audio = tokio::fs::read(&job.audio_path)
            .await
            .map_err(|_| TransferError::MissingArtifact(job.audio_path.clone()))?;
        let color = tokio::fs::read_to_string(&job.color_path)
            .await
            .map_err(|_| TransferError::MissingArtifact(job.color_path.clone()))?;
        let color = color.trim().to_string();

        debug!(id = job.id, bytes = audio.len(), %color, "uploading memory");

        let response = self
            .client
            .post(&self.upload_url)
            .header(COLOR_HEADER, color)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(audio)
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            info!(id = job.id, %status, "relay accepted memory");
            Ok(())
        } else {
            warn!(id = job.id, %status, "relay rejected memory");
            Err(TransferError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, return its head and body, and answer with `status`
    async fn serve_once(listener: TcpListener, status: &'static str) -> (String, Vec<u8>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let content_length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())?
            })
            .unwrap_or(0);

        while buf.len() < head_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before body");
            buf.extend_from_slice(&chunk[..n]);
        }

        let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        stream.write_all(reply.as_bytes()).await.unwrap();

        (head, buf[head_end..head_end + content_length].to_vec())
    }

    fn write_job(dir: &std::path::Path) -> TransferJob {
        let audio_path = dir.join("audio.wav");
        let color_path = dir.join("color.dat");
        std::fs::write(&audio_path, b"RIFFdata").unwrap();
        std::fs::write(&color_path, "1,2,3\n").unwrap();
        TransferJob {
            id: 1,
            audio_path,
            color_path,
        }
    }

    #[tokio::test]
    async fn test_upload_success() {
        let dir = tempfile::tempdir().unwrap();
        let job = write_job(dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        let relay = HttpRelay::new(&format!("http://{addr}/")).unwrap();
        assert_eq!(relay.upload_url(), format!("http://{addr}/upload"));
        relay.transfer(&job).await.unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("POST /upload"));
        assert!(head.to_ascii_lowercase().contains("x-color-data: 1,2,3"));
        assert_eq!(body, b"RIFFdata");
    }

    #[tokio::test]
    async fn test_upload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let job = write_job(dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "500 Internal Server Error"));

        let relay = HttpRelay::new(&format!("http://{addr}")).unwrap();
        let err = relay.transfer(&job).await.unwrap_err();
        assert_eq!(err, TransferError::Rejected { status: 500 });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let job = write_job(dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = HttpRelay::new(&format!("http://{addr}")).unwrap();
        let err = relay.transfer(&job).await.unwrap_err();
        assert!(matches!(err, TransferError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = write_job(dir.path());
        job.audio_path = dir.path().join("nope.wav");

        let relay = HttpRelay::new("http://127.0.0.1:9").unwrap();
        let err = relay.transfer(&job).await.unwrap_err();
        assert_eq!(err, TransferError::MissingArtifact(job.audio_path.clone()));
    }
}
