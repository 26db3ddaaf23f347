//! Remote media source backed by yt-dlp

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::DownloadConfig;
use crate::settings::SharedSettings;
use crate::types::{Chapter, MetadataResult};

/// Error raised by a remote source call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The resource is live or an upcoming scheduled stream
    #[error("live stream: {0}")]
    LiveStream(String),
    /// Tool error text, classified by the caller
    #[error("{0}")]
    Message(String),
}

/// Which format to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    BestAudio,
    Id(String),
}

impl FormatSelector {
    pub fn as_arg(&self) -> &str {
        match self {
            Self::BestAudio => "bestaudio",
            Self::Id(id) => id.as_str(),
        }
    }
}

/// Transfer progress of a running download
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second
    pub speed: Option<f64>,
}

/// One available format of a remote resource
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteFormat {
    pub format_id: String,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
}

impl RemoteFormat {
    /// Carries both an audio and a video track
    pub fn is_combined(&self) -> bool {
        let has = |codec: &Option<String>| codec.as_deref().is_some_and(|c| c != "none");
        has(&self.acodec) && has(&self.vcodec)
    }
}

/// Descriptive info of a remote resource
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RemoteInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub aspect_ratio: Option<f64>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub chapters: Option<Vec<Chapter>>,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub playable_in_embed: Option<bool>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<RemoteFormat>,
}

impl RemoteInfo {
    pub fn is_live(&self) -> bool {
        matches!(self.live_status.as_deref(), Some("is_live") | Some("is_upcoming"))
    }

    /// Lowest-resolution format with both audio and video
    pub fn lowest_combined_format(&self) -> Option<&RemoteFormat> {
        self.formats
            .iter()
            .filter(|f| f.is_combined() && f.height.is_some())
            .min_by_key(|f| f.height.unwrap_or(0))
    }

    /// Highest-resolution format with both audio and video
    pub fn best_combined_format(&self) -> Option<&RemoteFormat> {
        self.formats
            .iter()
            .filter(|f| f.is_combined())
            .max_by_key(|f| f.height.unwrap_or(0))
    }

    /// Metadata record; a raw stream url is included when the resource cannot be embedded
    pub fn to_metadata(&self, force_raw_stream: bool) -> MetadataResult {
        let embeddable = if force_raw_stream {
            Some(false)
        } else {
            self.playable_in_embed
        };
        let stream_url = if embeddable != Some(true) {
            self.best_combined_format().and_then(|f| f.url.clone())
        } else {
            None
        };

        MetadataResult {
            title: self.title.clone(),
            duration: self.duration,
            aspect_ratio: self.aspect_ratio,
            channel: self.channel.clone(),
            channel_id: self.channel_id.clone(),
            date_uploaded: self.upload_date.clone(),
            chapters: self
                .chapters
                .iter()
                .flatten()
                .filter(|chapter| chapter.title != PLACEHOLDER_CHAPTER)
                .cloned()
                .collect(),
            embeddable,
            stream_url,
        }
    }
}

/// Source of remote media
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch descriptive info without downloading
    async fn inspect(&self, resource_id: &str) -> Result<RemoteInfo, FetchError>;

    /// Download into `dest_dir`, returning the written file
    async fn download(
        &self,
        resource_id: &str,
        format: &FormatSelector,
        dest_dir: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf, FetchError>;
}

const PROGRESS_PREFIX: &str = "progress:";

/// Chapter title the site generates for videos without real chapters
const PLACEHOLDER_CHAPTER: &str = "<Untitled Chapter 1>";

/// yt-dlp command line driver
pub struct YtDlp {
    program: String,
    socket_timeout_secs: u64,
    settings: SharedSettings,
}

impl YtDlp {
    /// Cookie source is read from `settings` on every call
    pub fn new(config: &DownloadConfig, settings: SharedSettings) -> Self {
        Self {
            program: config.tool_path.clone(),
            socket_timeout_secs: config.socket_timeout_secs,
            settings,
        }
    }

    fn watch_url(resource_id: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", resource_id)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--no-warnings")
            .arg("--socket-timeout")
            .arg(self.socket_timeout_secs.to_string());
        if let Some(browser) = self.settings.cookies_from_browser() {
            cmd.arg("--cookies-from-browser").arg(browser);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteSource for YtDlp {
    async fn inspect(&self, resource_id: &str) -> Result<RemoteInfo, FetchError> {
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg(Self::watch_url(resource_id))
            .output()
            .await
            .map_err(|e| FetchError::Message(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(FetchError::Message(last_error_line(&output.stderr)));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::Message(format!("Unreadable resource info: {}", e)))
    }

    async fn download(
        &self,
        resource_id: &str,
        format: &FormatSelector,
        dest_dir: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf, FetchError> {
        let template = dest_dir.join(format!("temp_{}.%(ext)s", resource_id));

        tracing::debug!("Downloading {} with format {}", resource_id, format.as_arg());

        let mut child = self
            .command()
            .arg("--format")
            .arg(format.as_arg())
            .arg("--retries")
            .arg("3")
            .arg("--output")
            .arg(&template)
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(format!(
                "download:{}%(progress.downloaded_bytes)s %(progress.total_bytes)s \
                 %(progress.total_bytes_estimate)s %(progress.speed)s",
                PROGRESS_PREFIX
            ))
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg(Self::watch_url(resource_id))
            .spawn()
            .map_err(|e| FetchError::Message(format!("Failed to run {}: {}", self.program, e)))?;

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_end(&mut text).await;
            }
            text
        });

        let mut downloaded = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(progress) = parse_progress_line(&line) {
                    on_progress(progress);
                } else if !line.trim().is_empty() {
                    downloaded = Some(PathBuf::from(line.trim()));
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::Message(format!("Failed to wait for {}: {}", self.program, e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(FetchError::Message(last_error_line(&stderr)));
        }

        match downloaded {
            Some(path) if path.exists() => Ok(path),
            _ => Err(FetchError::Message("Download produced no file".to_string())),
        }
    }
}

fn last_error_line(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .find(|line| line.contains("ERROR"))
        .or_else(|| text.lines().rev().find(|line| !line.trim().is_empty()))
        .unwrap_or("Unknown error")
        .trim()
        .to_string()
}

fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let rest = line.strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split_whitespace();

    let number = |value: Option<&str>| value.and_then(|v| v.parse::<f64>().ok());
    let downloaded = number(fields.next())?;
    let total = number(fields.next());
    let estimate = number(fields.next());
    let speed = number(fields.next());

    Some(DownloadProgress {
        downloaded_bytes: downloaded as u64,
        total_bytes: total.or(estimate).map(|t| t as u64),
        speed,
    })
}
