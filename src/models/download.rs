use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;
use crate::utils::files::sibling_with_suffix;

pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Bytes after which the synthetic percent of an unknown-length transfer reaches 50.
const UNKNOWN_SIZE_HORIZON: u64 = 8 * 1024 * 1024;

/// One progress notification for a running transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    /// 0-100, non-decreasing. Approximate when `total` is `None`.
    pub percent: u8,
    pub received: u64,
    pub total: Option<u64>,
    pub speed_bytes_per_sec: f64,
}

/// Receives progress of a single download.
pub trait ProgressSink {
    fn on_progress(&mut self, progress: DownloadProgress);
}

impl<F> ProgressSink for F
where
    F: FnMut(DownloadProgress),
{
    fn on_progress(&mut self, progress: DownloadProgress) {
        self(progress)
    }
}

/// Sink for callers that do not care about progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&mut self, _progress: DownloadProgress) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub destination: PathBuf,
    /// Lower-case SHA-256 hex of the published file.
    pub digest: String,
    pub byte_count: u64,
}

/// HTTP client shared by transfers and manifest fetches. Redirects are
/// followed up to `max_redirects` hops, after which the request fails.
pub fn http_client(
    max_redirects: usize,
    connect_timeout: Duration,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(max_redirects))
        .connect_timeout(connect_timeout)
        .build()
}

/// Strip an optional `sha256:` prefix and lower-case the hex. Returns `None`
/// for other algorithms or anything that is not 64 hex characters.
pub fn normalize_digest(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let hex_part = match raw.split_once(':') {
        Some((algorithm, rest)) if algorithm.eq_ignore_ascii_case("sha256") => rest,
        Some(_) => return None,
        None => raw,
    };
    let hex_part = hex_part.trim();
    if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex_part.to_ascii_lowercase())
    } else {
        None
    }
}

/// Streams URLs to disk through a `.partial` sibling, hashing as bytes arrive.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn with_defaults() -> reqwest::Result<Self> {
        Ok(Self::new(http_client(
            DEFAULT_MAX_REDIRECTS,
            Duration::from_secs(30),
        )?))
    }

    /// Download `url` to `destination`.
    ///
    /// The final path is only ever created by renaming a completely received
    /// and verified partial file. Any failure removes the partial file.
    pub async fn download<S>(
        &self,
        url: &str,
        destination: &Path,
        expected_digest: Option<&str>,
        progress: &mut S,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        S: ProgressSink + ?Sized,
    {
        let expected = expected_digest
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| normalize_digest(raw).unwrap_or_else(|| raw.to_ascii_lowercase()));

        let partial = sibling_with_suffix(destination, "partial");
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| DownloadError::fs(parent, err))?;
        }
        discard_partial(&partial)
            .await
            .map_err(|err| DownloadError::fs(&partial, err))?;

        let mut meter = ProgressMeter::new();
        let digest = match self.transfer(url, &partial, &mut meter, progress).await {
            Ok(digest) => digest,
            Err(err) => {
                let _ = discard_partial(&partial).await;
                tracing::warn!(url, error = %err, "download failed");
                return Err(err);
            }
        };

        if let Some(expected) = expected {
            if expected != digest {
                let _ = discard_partial(&partial).await;
                tracing::warn!(url, %expected, actual = %digest, "SHA256 mismatch, discarded download");
                return Err(DownloadError::Integrity {
                    expected,
                    actual: digest,
                });
            }
            tracing::debug!(url, "SHA256 verified");
        }

        if let Err(err) = tokio::fs::rename(&partial, destination).await {
            let _ = discard_partial(&partial).await;
            return Err(DownloadError::fs(destination, err));
        }

        progress.on_progress(meter.finish());
        tracing::info!(
            url,
            destination = %destination.display(),
            bytes = meter.received,
            "download published"
        );

        Ok(DownloadOutcome {
            destination: destination.to_path_buf(),
            digest,
            byte_count: meter.received,
        })
    }

    async fn transfer<S>(
        &self,
        url: &str,
        partial: &Path,
        meter: &mut ProgressMeter,
        progress: &mut S,
    ) -> Result<String, DownloadError>
    where
        S: ProgressSink + ?Sized,
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DownloadError::transfer(url, err))?
            .error_for_status()
            .map_err(|err| DownloadError::transfer(url, err))?;

        meter.total = response.content_length().filter(|total| *total > 0);

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|err| DownloadError::fs(partial, err))?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| DownloadError::transfer(url, err))?;
            file.write_all(&chunk)
                .await
                .map_err(|err| DownloadError::fs(partial, err))?;
            hasher.update(&chunk);
            if let Some(update) = meter.advance(chunk.len() as u64) {
                tracing::debug!(url, percent = update.percent, "download progress");
                progress.on_progress(update);
            }
        }

        file.flush()
            .await
            .map_err(|err| DownloadError::fs(partial, err))?;
        file.sync_all()
            .await
            .map_err(|err| DownloadError::fs(partial, err))?;

        if let Some(total) = meter.total {
            if meter.received != total {
                return Err(DownloadError::transfer(
                    url,
                    format!(
                        "connection closed after {} of {} bytes",
                        meter.received, total
                    ),
                ));
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

async fn discard_partial(partial: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Integer percent tracker. In-flight values stop at 99 so that 100 is only
/// reported once the file has been published.
#[derive(Debug)]
struct ProgressMeter {
    total: Option<u64>,
    received: u64,
    last_percent: Option<u8>,
    started: Instant,
}

impl ProgressMeter {
    fn new() -> Self {
        Self {
            total: None,
            received: 0,
            last_percent: None,
            started: Instant::now(),
        }
    }

    fn percent(&self) -> u8 {
        let raw = match self.total {
            Some(total) => self.received.saturating_mul(100) / total,
            None => {
                self.received.saturating_mul(100) / (self.received + UNKNOWN_SIZE_HORIZON)
            }
        };
        raw.min(99) as u8
    }

    fn speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.received as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Record `bytes` and return an update if the integer percent changed.
    fn advance(&mut self, bytes: u64) -> Option<DownloadProgress> {
        self.received += bytes;
        let percent = self.percent();
        if self.last_percent.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(self.snapshot(percent))
    }

    fn finish(&mut self) -> DownloadProgress {
        self.last_percent = Some(100);
        self.snapshot(100)
    }

    fn snapshot(&self, percent: u8) -> DownloadProgress {
        DownloadProgress {
            percent,
            received: self.received,
            total: self.total,
            speed_bytes_per_sec: self.speed(),
        }
    }
}
