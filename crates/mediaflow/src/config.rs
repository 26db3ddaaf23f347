//! Configuration for the media job orchestrator

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "MEDIAFLOW_CONFIG";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database and scratch locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Remote acquisition
    #[serde(default)]
    pub download: DownloadConfig,
    /// ffmpeg/ffprobe and preview extraction
    #[serde(default)]
    pub media: MediaConfig,
    /// Analysis engine
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl AppConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the explicit path, else from `MEDIAFLOW_CONFIG`, else defaults
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        match explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.max_attempts == 0 {
            return Err(Error::Config("download.max_attempts must be at least 1".into()));
        }
        if self.media.frame_width == 0 || self.media.thumbnail_width == 0 {
            return Err(Error::Config("media widths must be positive".into()));
        }
        if self.media.frame_interval_secs == 0 || self.media.long_frame_interval_secs == 0 {
            return Err(Error::Config("frame intervals must be positive".into()));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Scratch directory for downloads and transcodes, emptied at startup
    pub temp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
            .join("mediaflow");

        Self {
            db_path: base.join("media.db"),
            temp_dir: std::env::temp_dir().join("mediaflow"),
        }
    }
}

/// Remote acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// yt-dlp executable
    #[serde(default = "default_tool_path")]
    pub tool_path: String,
    /// Attempts per acquisition, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff after attempt n is `backoff_base_ms * 2^n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
    /// Browser to read session cookies from (e.g. "firefox")
    #[serde(default)]
    pub cookies_from_browser: Option<String>,
}

fn default_tool_path() -> String { "yt-dlp".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_socket_timeout() -> u64 { 10 }

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            socket_timeout_secs: default_socket_timeout(),
            cookies_from_browser: None,
        }
    }
}

/// Media tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
    /// Width of preview frames
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    /// Seconds between preview frames
    #[serde(default = "default_frame_interval")]
    pub frame_interval_secs: u32,
    /// Seconds between preview frames for long media
    #[serde(default = "default_long_frame_interval")]
    pub long_frame_interval_secs: u32,
    /// Duration above which media counts as long
    #[serde(default = "default_long_media_threshold")]
    pub long_media_threshold_secs: u32,
    /// Frames written per store transaction
    #[serde(default = "default_frame_batch_size")]
    pub frame_batch_size: usize,
    /// Width of the low resolution thumbnail
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
}

fn default_ffmpeg() -> String { "ffmpeg".to_string() }
fn default_ffprobe() -> String { "ffprobe".to_string() }
fn default_frame_width() -> u32 { 320 }
fn default_frame_interval() -> u32 { 5 }
fn default_long_frame_interval() -> u32 { 10 }
fn default_long_media_threshold() -> u32 { 300 }
fn default_frame_batch_size() -> usize { 20 }
fn default_thumbnail_width() -> u32 { 426 }

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            frame_width: default_frame_width(),
            frame_interval_secs: default_frame_interval(),
            long_frame_interval_secs: default_long_frame_interval(),
            long_media_threshold_secs: default_long_media_threshold(),
            frame_batch_size: default_frame_batch_size(),
            thumbnail_width: default_thumbnail_width(),
        }
    }
}

impl MediaConfig {
    /// Frame spacing for media of the given length
    pub fn seconds_per_frame(&self, duration_secs: f64) -> u32 {
        if duration_secs > f64::from(self.long_media_threshold_secs) {
            self.long_frame_interval_secs
        } else {
            self.frame_interval_secs
        }
    }
}

/// Analysis engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Engine executable, run once with `--serve` and fed one JSON request per line
    #[serde(default = "default_analysis_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Load models once at worker start
    #[serde(default = "default_warm_up")]
    pub warm_up: bool,
}

fn default_analysis_command() -> String { "mediaflow-diarize".to_string() }
fn default_warm_up() -> bool { true }

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            command: default_analysis_command(),
            args: Vec::new(),
            warm_up: default_warm_up(),
        }
    }
}
