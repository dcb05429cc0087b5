// src/index/client.rs

//! HTTP client for channel and target index requests
//!
//! Thin wrapper around a blocking reqwest client with a request timeout and
//! retries on transport failures. HTTP error statuses are not retried.

use crate::error::{Error, Result};
use indicatif::ProgressBar;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for HTTP requests (30 seconds)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for a request that fails in transport
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 500;

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Shared blocking HTTP client
#[derive(Debug, Clone)]
pub struct ChannelClient {
    client: Client,
    max_retries: u32,
}

impl ChannelClient {
    /// Create a client with the default timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("condawheel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// GET with retries on transport errors
    fn send(&self, url: &str) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if e.is_timeout() {
                        return Err(Error::DownloadError(format!("Timed out fetching {url}")));
                    }
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch {url} after {attempt} attempts: {e}"
                        )));
                    }
                    warn!("Fetch attempt {} for {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Fetch and parse a JSON document; `None` on 404
    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        debug!("Fetching {}", url);
        let response = self.send(url)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        response
            .json()
            .map(Some)
            .map_err(|e| Error::DownloadError(format!("Failed to parse JSON from {url}: {e}")))
    }

    /// Whether `url` exists: true on success, false on 404
    pub fn url_exists(&self, url: &str) -> Result<bool> {
        let response = self.send(url)?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::DownloadError(format!("HTTP {} from {}", s, url))),
        }
    }

    /// Stream `url` into `out`, returning the number of bytes written
    pub fn download_to(
        &self,
        url: &str,
        out: &mut impl Write,
        progress: Option<&ProgressBar>,
    ) -> Result<u64> {
        let mut response = self.send(url)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::ArtifactNotFound(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        if let (Some(pb), Some(len)) = (progress, response.content_length()) {
            pb.set_length(len);
        }

        let mut downloaded: u64 = 0;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .map_err(|e| Error::write("Failed to write download", e))?;
            downloaded += n as u64;
            if let Some(pb) = progress {
                pb.set_position(downloaded);
            }
        }

        Ok(downloaded)
    }
}
