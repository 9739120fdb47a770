//! Resumable artifact downloader
//!
//! Bytes land in `<destination>.partial`; the destination path only ever
//! appears through a rename of a complete partial file. A cancelled or
//! interrupted transfer leaves the partial file in place so the next call
//! resumes with `Range: bytes=<offset>-`.

use futures::StreamExt;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::manifest::UpdateManifest;
use crate::core::config::UpdaterConfig;
use crate::core::error::DownloadError;
use crate::core::utils::{format_file_size, generate_uuid};

/// Suffix of the in-progress file next to the destination
pub const PARTIAL_SUFFIX: &str = ".partial";

lazy_static! {
    static ref CONTENT_RANGE_RE: Option<Regex> =
        Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").ok();
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Download progress information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Average over the current attempt
    pub bytes_per_second: u64,
    pub percent: u8,
}

impl DownloadProgress {
    pub fn new(downloaded_bytes: u64, total_bytes: u64, bytes_per_second: u64) -> Self {
        Self {
            downloaded_bytes,
            total_bytes,
            bytes_per_second,
            percent: Self::calculate_percentage(downloaded_bytes, total_bytes),
        }
    }

    /// Calculate percentage (0-100)
    pub fn calculate_percentage(downloaded: u64, total: u64) -> u8 {
        if total == 0 {
            return 0;
        }
        ((downloaded as u128 * 100 / total as u128).min(100)) as u8
    }
}

/// State of one transfer from start to completion, cancellation or failure
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub id: Uuid,
    pub artifact_url: String,
    pub destination_path: PathBuf,
    pub partial_path: PathBuf,
    pub expected_total_bytes: u64,
    pub downloaded_bytes: u64,
    pub cancelled: bool,
}

impl DownloadSession {
    pub fn new(manifest: &UpdateManifest, destination: &Path) -> Self {
        Self {
            id: generate_uuid(),
            artifact_url: manifest.download_url.clone(),
            destination_path: destination.to_path_buf(),
            partial_path: partial_path(destination),
            expected_total_bytes: manifest.file_size,
            downloaded_bytes: 0,
            cancelled: false,
        }
    }
}

/// A complete artifact on disk; integrity is still unverified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// Started from a partial file left by an earlier attempt
    pub resumed: bool,
    /// Destination already existed; nothing was transferred
    pub reused: bool,
}

/// Path of the in-progress file for `destination`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Parse `bytes <start>-<end>/<total>`; total is `None` for `*`
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let caps = CONTENT_RANGE_RE.as_ref()?.captures(value.trim())?;
    let start = caps.get(1)?.as_str().parse().ok()?;
    let end = caps.get(2)?.as_str().parse().ok()?;
    let total = match caps.get(3)?.as_str() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

/// Coalesces per-chunk updates into at most one event per interval
struct ProgressThrottle {
    interval: Duration,
    started: Instant,
    start_bytes: u64,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    fn new(interval: Duration, start_bytes: u64) -> Self {
        Self {
            interval,
            started: Instant::now(),
            start_bytes,
            last_emit: None,
        }
    }

    fn tick(&mut self, downloaded: u64, total: u64, force: bool) -> Option<DownloadProgress> {
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !force && !due {
            return None;
        }
        self.last_emit = Some(now);

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let transferred = downloaded.saturating_sub(self.start_bytes);
        let bytes_per_second = if elapsed > 0.0 {
            (transferred as f64 / elapsed) as u64
        } else {
            0
        };
        Some(DownloadProgress::new(downloaded, total, bytes_per_second))
    }
}

/// Removes the destination from the active set when the transfer ends
struct ActiveGuard {
    active: Arc<Mutex<HashSet<PathBuf>>>,
    destination: PathBuf,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.destination);
    }
}

/// What the response status told us to do with the partial file
enum TransferPlan {
    Fresh,
    Append,
    AlreadyComplete,
}

/// HTTP downloader with byte-range resume
pub struct ResumableDownloader {
    /// Artifact client; bodies are stored exactly as received
    client: reqwest::Client,
    /// Secondary metadata client with transparent decompression
    metadata_client: reqwest::Client,
    timeout: Duration,
    progress_interval: Duration,
    progress_callback: Option<ProgressCallback>,
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ResumableDownloader {
    pub fn new(config: &UpdaterConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .no_gzip()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let metadata_client = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.download_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            metadata_client,
            timeout: config.download_timeout,
            progress_interval: config.progress_interval,
            progress_callback: None,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Set progress callback
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Whether a transfer to `destination` is running
    pub fn is_active(&self, destination: &Path) -> bool {
        self.active.lock().contains(destination)
    }

    /// Bytes already on disk for `destination`
    pub async fn resume_offset(&self, destination: &Path) -> u64 {
        tokio::fs::metadata(partial_path(destination))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Download `manifest`'s artifact to `destination`
    pub async fn download(
        &self,
        manifest: &UpdateManifest,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifact, DownloadError> {
        let mut session = DownloadSession::new(manifest, destination);
        self.run(&mut session, cancel).await
    }

    /// Drive `session` to completion
    pub async fn run(
        &self,
        session: &mut DownloadSession,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifact, DownloadError> {
        let _guard = self.claim(&session.destination_path)?;

        if let Some(artifact) = self.reuse_existing(session).await? {
            return Ok(artifact);
        }

        if let Some(parent) = session.destination_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        session.downloaded_bytes = match tokio::fs::metadata(&session.partial_path).await {
            Ok(meta) if meta.len() > session.expected_total_bytes => {
                tracing::warn!(
                    path = %session.partial_path.display(),
                    bytes = meta.len(),
                    expected = session.expected_total_bytes,
                    "Partial file larger than artifact, discarding"
                );
                tokio::fs::remove_file(&session.partial_path).await?;
                0
            }
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let resumed = session.downloaded_bytes > 0;

        tracing::info!(
            session = %session.id,
            url = %session.artifact_url,
            offset = session.downloaded_bytes,
            total = session.expected_total_bytes,
            "Starting download"
        );

        let deadline = tokio::time::Instant::now() + self.timeout;
        self.transfer(session, cancel, deadline).await?;

        let size = tokio::fs::metadata(&session.destination_path).await?.len();
        tracing::info!(
            session = %session.id,
            path = %session.destination_path.display(),
            size = %format_file_size(size),
            resumed,
            "Download complete"
        );

        Ok(LocalArtifact {
            path: session.destination_path.clone(),
            size,
            resumed,
            reused: false,
        })
    }

    fn claim(&self, destination: &Path) -> Result<ActiveGuard, DownloadError> {
        let mut active = self.active.lock();
        if !active.insert(destination.to_path_buf()) {
            return Err(DownloadError::AlreadyActive {
                destination: destination.display().to_string(),
            });
        }
        Ok(ActiveGuard {
            active: Arc::clone(&self.active),
            destination: destination.to_path_buf(),
        })
    }

    /// A destination of the declared size is taken as complete
    async fn reuse_existing(
        &self,
        session: &DownloadSession,
    ) -> Result<Option<LocalArtifact>, DownloadError> {
        let meta = match tokio::fs::metadata(&session.destination_path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Ok(None),
        };

        if meta.len() == session.expected_total_bytes {
            tracing::info!(
                path = %session.destination_path.display(),
                "Artifact already downloaded"
            );
            return Ok(Some(LocalArtifact {
                path: session.destination_path.clone(),
                size: meta.len(),
                resumed: false,
                reused: true,
            }));
        }

        tracing::warn!(
            path = %session.destination_path.display(),
            size = meta.len(),
            expected = session.expected_total_bytes,
            "Stale artifact at destination, removing"
        );
        tokio::fs::remove_file(&session.destination_path).await?;
        Ok(None)
    }

    async fn transfer(
        &self,
        session: &mut DownloadSession,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<(), DownloadError> {
        let offset = session.downloaded_bytes;
        let mut request = self.client.get(&session.artifact_url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.cancelled = true;
                return Err(DownloadError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(self.timeout_error());
            }
            response = request.send() => response?,
        };

        let status = response.status();
        tracing::debug!(session = %session.id, status = status.as_u16(), offset, "Response received");

        match self.plan(session, &response).await? {
            TransferPlan::AlreadyComplete => {
                tracing::info!(
                    session = %session.id,
                    offset,
                    "Range not satisfiable, promoting partial file"
                );
                return self.promote(session).await;
            }
            TransferPlan::Fresh => {
                if offset > 0 {
                    tracing::info!(session = %session.id, "Server ignored range, restarting");
                }
                session.downloaded_bytes = 0;
            }
            TransferPlan::Append => {}
        }

        let mut file = match session.downloaded_bytes {
            0 => {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&session.partial_path)
                    .await?
            }
            _ => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&session.partial_path)
                    .await?
            }
        };

        let outcome = self
            .pump(response, &mut file, session, cancel, deadline)
            .await;

        // Whatever happened, bytes already received stay usable for a resume
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = outcome {
            if matches!(e, DownloadError::SizeMismatch { .. }) {
                tokio::fs::remove_file(&session.partial_path).await.ok();
            }
            tracing::warn!(
                session = %session.id,
                bytes = session.downloaded_bytes,
                error = %e,
                "Download interrupted"
            );
            return Err(e);
        }

        if session.downloaded_bytes < session.expected_total_bytes {
            return Err(DownloadError::Incomplete {
                received: session.downloaded_bytes,
                expected: session.expected_total_bytes,
            });
        }

        self.promote(session).await
    }

    /// Decide from the status line how the body relates to the partial file
    async fn plan(
        &self,
        session: &DownloadSession,
        response: &reqwest::Response,
    ) -> Result<TransferPlan, DownloadError> {
        let offset = session.downloaded_bytes;
        let declared = session.expected_total_bytes;

        match response.status() {
            StatusCode::OK => {
                if let Some(reported) = response.content_length() {
                    if reported != declared {
                        tokio::fs::remove_file(&session.partial_path).await.ok();
                        return Err(DownloadError::SizeMismatch { declared, reported });
                    }
                }
                Ok(TransferPlan::Fresh)
            }
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let range = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                // A range we cannot append to would fail the same way on every
                // retry, so the next attempt starts from byte 0
                let Some((start, _end, total)) = range else {
                    tokio::fs::remove_file(&session.partial_path).await.ok();
                    return Err(DownloadError::BadStatus {
                        status: StatusCode::PARTIAL_CONTENT.as_u16(),
                    });
                };
                if start != offset {
                    tokio::fs::remove_file(&session.partial_path).await.ok();
                    return Err(DownloadError::UnexpectedRange {
                        requested: offset,
                        actual: start,
                    });
                }
                if let Some(reported) = total {
                    if reported != declared {
                        tokio::fs::remove_file(&session.partial_path).await.ok();
                        return Err(DownloadError::SizeMismatch { declared, reported });
                    }
                }
                Ok(TransferPlan::Append)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset == declared => {
                Ok(TransferPlan::AlreadyComplete)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                // Short partial the server refuses to extend; start over next time
                tokio::fs::remove_file(&session.partial_path).await.ok();
                Err(DownloadError::BadStatus {
                    status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                })
            }
            other => Err(DownloadError::BadStatus {
                status: other.as_u16(),
            }),
        }
    }

    async fn pump(
        &self,
        response: reqwest::Response,
        file: &mut tokio::fs::File,
        session: &mut DownloadSession,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<(), DownloadError> {
        let total = session.expected_total_bytes;
        let mut throttle = ProgressThrottle::new(self.progress_interval, session.downloaded_bytes);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.cancelled = true;
                    return Err(DownloadError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.timeout_error());
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            let received = session.downloaded_bytes + chunk.len() as u64;
            if received > total {
                return Err(DownloadError::SizeMismatch {
                    declared: total,
                    reported: received,
                });
            }
            file.write_all(&chunk).await?;
            session.downloaded_bytes = received;

            if let Some(progress) = throttle.tick(received, total, false) {
                tracing::debug!(
                    session = %session.id,
                    downloaded = %format_file_size(progress.downloaded_bytes),
                    total = %format_file_size(total),
                    percent = progress.percent,
                    "Download progress"
                );
                self.emit(progress);
            }
        }

        if let Some(progress) = throttle.tick(session.downloaded_bytes, total, true) {
            self.emit(progress);
        }
        Ok(())
    }

    async fn promote(&self, session: &DownloadSession) -> Result<(), DownloadError> {
        tokio::fs::rename(&session.partial_path, &session.destination_path).await?;
        Ok(())
    }

    fn emit(&self, progress: DownloadProgress) {
        if let Some(callback) = &self.progress_callback {
            callback(progress);
        }
    }

    fn timeout_error(&self) -> DownloadError {
        DownloadError::Timeout {
            timeout_secs: self.timeout.as_secs(),
        }
    }

    /// Fetch a small text document (signature files); gzip is decoded
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        tracing::debug!(url, "Fetching metadata");
        let response = self.metadata_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::BadStatus {
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Delete a staging directory and everything in it
pub async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            tracing::info!(dir = %dir.display(), "Cleared directory");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
