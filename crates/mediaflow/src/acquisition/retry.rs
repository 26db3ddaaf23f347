//! Bounded, classified retry of remote acquisition
//!
//! Attempt `n` that fails with a retryable error is followed by a sleep of
//! `backoff_base * 2^n`, so with the default 1 s base and three attempts the waits are
//! 2 s and 4 s. Terminal categories stop immediately.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::classify::{extract_error_detail, ClassificationRules};
use super::remote::{DownloadProgress, FetchError, FormatSelector, RemoteSource};
use crate::config::DownloadConfig;
use crate::messaging::TransferStats;
use crate::types::{FailureKind, JobError};

const LIVE_STREAM_DETAIL: &str = "Cannot download currently streaming or upcoming live streams";
const NO_COMBINED_FORMAT_DETAIL: &str = "No suitable audio+video formats available";

pub const DOWNLOAD_STAGE: &str = "Downloading audio";
pub const FORMAT_FALLBACK_STAGE: &str = "Audio-only format not available, trying low-res video+audio...";

/// Receives stage and transfer progress while acquiring
pub trait ProgressSink: Send + Sync {
    fn stage(&self, stage: &str);
    fn transfer(&self, stage: &str, percent: Option<f64>, transfer: TransferStats);
}

/// Outcome of a classified retry loop
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T, JobError>,
    /// Primary attempts made, at least 1
    pub attempts: u32,
    /// Sleeps taken between attempts
    pub backoffs: Vec<Duration>,
}

/// Result of [`DownloadPolicy::acquire`]
#[derive(Debug)]
pub struct Acquisition {
    pub outcome: Result<PathBuf, JobError>,
    pub attempts: u32,
    pub backoffs: Vec<Duration>,
    /// Whether the low-resolution combined format fallback ran
    pub used_fallback: bool,
}

/// Retry policy for remote calls
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    rules: ClassificationRules,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            rules: ClassificationRules::default(),
        }
    }
}

impl DownloadPolicy {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            ..Default::default()
        }
    }

    /// Sleep after failed attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Classify a failure into a persisted error record
    pub fn classify(&self, error: &FetchError) -> JobError {
        match error {
            FetchError::LiveStream(_) => JobError::new(FailureKind::LiveStream, LIVE_STREAM_DETAIL),
            FetchError::Message(message) => {
                JobError::new(self.rules.classify(message), extract_error_detail(message))
            }
        }
    }

    /// Run `operation` until it succeeds, fails terminally or runs out of attempts
    pub async fn retry_classified<T, F, Fut>(&self, label: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut backoffs = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    return Attempted {
                        outcome: Ok(value),
                        attempts: attempt,
                        backoffs,
                    }
                }
                Err(e) => self.classify(&e),
            };

            if !error.kind.is_retryable() || attempt >= self.max_attempts {
                tracing::warn!(
                    "{} failed after {} attempt(s): {}",
                    label,
                    attempt,
                    error
                );
                return Attempted {
                    outcome: Err(error),
                    attempts: attempt,
                    backoffs,
                };
            }

            let delay = self.backoff_for(attempt);
            tracing::debug!(
                "{} attempt {} failed, retrying in {:?}: {}",
                label,
                attempt,
                delay,
                error.detail
            );
            backoffs.push(delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Download the audio of a remote resource into `dest_dir`. Live and upcoming streams
    /// are refused before any download starts.
    pub async fn acquire(
        &self,
        source: &dyn RemoteSource,
        resource_id: &str,
        dest_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Acquisition {
        let best_audio = &FormatSelector::BestAudio;
        let on_progress = &|p: DownloadProgress| report_transfer(progress, DOWNLOAD_STAGE, p);

        // Live status can change between attempts, so every attempt inspects first
        let attempted = self
            .retry_classified(resource_id, move |_| async move {
                let info = match source.inspect(resource_id).await {
                    Ok(info) => info,
                    Err(e) => return Err(e),
                };
                if info.is_live() {
                    return Err(FetchError::LiveStream(format!(
                        "{} is {}",
                        resource_id,
                        info.live_status.as_deref().unwrap_or("live")
                    )));
                }
                source
                    .download(resource_id, best_audio, dest_dir, on_progress)
                    .await
            })
            .await;

        let outcome = match attempted.outcome {
            Err(error) if error.kind == FailureKind::NoSuitableFormat => {
                let outcome = self
                    .fallback_format(source, resource_id, dest_dir, progress)
                    .await;
                return Acquisition {
                    outcome,
                    attempts: attempted.attempts,
                    backoffs: attempted.backoffs,
                    used_fallback: true,
                };
            }
            outcome => outcome,
        };

        Acquisition {
            outcome,
            attempts: attempted.attempts,
            backoffs: attempted.backoffs,
            used_fallback: false,
        }
    }

    /// One attempt at the lowest-resolution combined audio+video format
    async fn fallback_format(
        &self,
        source: &dyn RemoteSource,
        resource_id: &str,
        dest_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, JobError> {
        progress.stage(FORMAT_FALLBACK_STAGE);

        let no_suitable_format =
            |e: FetchError| JobError::new(FailureKind::NoSuitableFormat, self.classify(&e).detail);

        let info = source
            .inspect(resource_id)
            .await
            .map_err(no_suitable_format)?;

        let format = info
            .lowest_combined_format()
            .ok_or_else(|| JobError::new(FailureKind::NoSuitableFormat, NO_COMBINED_FORMAT_DETAIL))?;

        let stage = format!(
            "Downloading with format {} ({}p)",
            format.format_id,
            format
                .height
                .map(|h| h.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        progress.stage(&stage);
        tracing::info!("{}: {}", resource_id, stage);

        let selector = FormatSelector::Id(format.format_id.clone());
        let on_progress = |p: DownloadProgress| report_transfer(progress, &stage, p);
        source
            .download(resource_id, &selector, dest_dir, &on_progress)
            .await
            .map_err(no_suitable_format)
    }
}

fn report_transfer(progress: &dyn ProgressSink, stage: &str, p: DownloadProgress) {
    const MB: f64 = 1024.0 * 1024.0;

    let total = p.total_bytes.filter(|t| *t > 0);
    let percent = total.map(|t| p.downloaded_bytes as f64 / t as f64 * 100.0);
    let speed = match p.speed {
        Some(s) if s > MB => format!("{:.2} MB/s", s / MB),
        Some(s) => format!("{:.2} KB/s", s / 1024.0),
        None => "N/A".to_string(),
    };

    progress.transfer(
        stage,
        percent,
        TransferStats {
            downloaded_mb: p.downloaded_bytes as f64 / MB,
            total_mb: total.map(|t| t as f64 / MB),
            speed: Some(speed),
        },
    );
}
