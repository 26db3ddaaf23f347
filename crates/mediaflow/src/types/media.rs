//! Media item, status and result types
//!
//! A [`MediaItem`] is one submitted job. It carries two independent state machines:
//! `status` for the main processing pipeline and `metadata_status` for the lightweight
//! metadata pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where the media comes from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Remote resource, `uri` is the resource id
    Remote,
    /// Local file, `uri` is the file path
    Local,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "remote" => Some(Self::Remote),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Kind of media
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Video,
    Audio,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Main pipeline status
///
/// Moves forward only: `queued -> processing -> {success, failed}`. A terminal row goes
/// back to `queued` only through an explicit retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `success` or `failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Metadata pipeline status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    Pending,
    Success,
    Failed,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which pipeline a store operation targets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Main pipeline (acquire, transcode, analyze), governed by `status`
    Processing,
    /// Descriptive info, thumbnails and frame previews, governed by `metadata_status`
    Metadata,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Metadata => write!(f, "metadata"),
        }
    }
}

/// Machine-readable failure category persisted with a failed job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AgeRestricted,
    Bot,
    LiveStream,
    NoSuitableFormat,
    NoAudio,
    NoSpeakers,
    Interrupted,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgeRestricted => "age_restricted",
            Self::Bot => "bot",
            Self::LiveStream => "live_stream",
            Self::NoSuitableFormat => "no_suitable_format",
            Self::NoAudio => "no_audio",
            Self::NoSpeakers => "no_speakers",
            Self::Interrupted => "interrupted",
            Self::Other => "other",
        }
    }

    /// Whether an acquisition attempt that failed with this kind may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Other)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure record: `{kind, detail}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: FailureKind,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn interrupted() -> Self {
        Self::new(FailureKind::Interrupted, "Processing interrupted")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// One speaker turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

/// Per-stage wall time reported by the analysis engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimingStats {
    pub total_secs: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, f64>,
}

/// Output of the heavy-analysis stage. Empty when speaker identification is off.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub raw_segments: Vec<Segment>,
    pub merged_segments: Vec<Segment>,
    pub speaker_count: usize,
    #[serde(default)]
    pub timing: TimingStats,
}

/// Chapter marker of a remote video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
}

/// Output of the metadata pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// YYYYMMDD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_uploaded: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chapters: Vec<Chapter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddable: Option<bool>,
    /// Combined audio+video stream url, set when the video cannot be embedded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
}

/// Timestamped preview image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Seconds from the start of the media
    pub timestamp: u32,
    /// JPEG bytes
    pub image: Vec<u8>,
}

/// A persisted media item (one row of the `media` table, without blob columns)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub source: Source,
    pub uri: String,
    pub media_type: MediaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: JobStatus,
    pub metadata_status: MetadataStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_created_at: Option<DateTime<Utc>>,
    pub force_raw_stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_secs: Option<f64>,
    pub thumbnail_available: bool,
    pub frames_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_per_frame: Option<u32>,
}

impl MediaItem {
    pub fn is_local(&self) -> bool {
        self.source == Source::Local
    }
}

/// Input of [`crate::storage::MediaStore::submit`]
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub source: Source,
    pub uri: String,
    pub media_type: MediaType,
    pub title: Option<String>,
    pub content_hash: Option<String>,
    pub file_created_at: Option<DateTime<Utc>>,
}

impl NewSubmission {
    /// Submission of a remote resource id
    pub fn remote(resource_id: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            source: Source::Remote,
            uri: resource_id.into(),
            media_type,
            title: None,
            content_hash: None,
            file_created_at: None,
        }
    }

    /// Submission of a local file path
    pub fn local(path: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            source: Source::Local,
            uri: path.into(),
            media_type,
            title: None,
            content_hash: None,
            file_created_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_file_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.file_created_at = Some(created_at);
        self
    }
}

/// Outcome of a submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub id: String,
    /// `false` when an existing row was returned instead of inserting
    pub created: bool,
}

/// Media items grouped by main pipeline status
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaPreviews {
    /// Oldest start first
    pub processing: Vec<MediaItem>,
    /// Oldest submission first
    pub queued: Vec<MediaItem>,
    /// Newest finish first
    pub failed: Vec<MediaItem>,
    /// Newest finish first
    pub success: Vec<MediaItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_serializes_as_tagged_record() {
        let error = JobError::new(FailureKind::NoSpeakers, "No speakers in audio");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["kind"], "no_speakers");
        assert_eq!(value["detail"], "No speakers in audio");
    }

    #[test]
    fn test_status_string_roundtrip_matches_serde() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("done"), None);
    }

    #[test]
    fn test_only_other_is_retryable() {
        assert!(FailureKind::Other.is_retryable());
        assert!(!FailureKind::Bot.is_retryable());
        assert!(!FailureKind::AgeRestricted.is_retryable());
        assert!(!FailureKind::LiveStream.is_retryable());
        assert!(!FailureKind::NoSuitableFormat.is_retryable());
    }
}
