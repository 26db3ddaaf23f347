//! Messages exchanged between the coordinator and its workers

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::settings::RuntimeSettings;

/// Identity of a worker endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The metadata pipeline worker
    pub fn metadata() -> Self {
        Self::new("metadata")
    }

    /// The processing pipeline worker
    pub fn processing() -> Self {
        Self::new("processing")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinator to worker signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The store has new work; re-query it
    NewJobSubmission,
    /// Leave the idle-wait and stop
    Shutdown,
}

/// Download transfer figures attached to progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferStats {
    pub downloaded_mb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
}

/// Stage progress of the job a worker is running
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdate {
    pub id: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferStats>,
}

impl ProgressUpdate {
    pub fn stage(id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            percent: None,
            transfer: None,
        }
    }

    pub fn with_transfer(mut self, transfer: TransferStats) -> Self {
        self.transfer = Some(transfer);
        self
    }
}

/// Worker to coordinator message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message_type", content = "content", rename_all = "snake_case")]
pub enum WorkerMessage {
    Registration,
    ProcessorStatus(String),
    NewJobStarted { id: String },
    ProgressUpdate(ProgressUpdate),
    JobDone { id: String },
    MetadataRefresh,
}

/// A worker message tagged with its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: WorkerId,
    pub message: WorkerMessage,
}

/// Event forwarded to observers as `{message_type, content}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayedEvent {
    pub message_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl RelayedEvent {
    /// Flatten a worker message into its wire shape
    pub fn from_message(message: &WorkerMessage) -> Result<Self> {
        let mut value = serde_json::to_value(message)?;
        let message_type = value
            .get("message_type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let content = value
            .get_mut("content")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);

        Ok(Self {
            message_type,
            content,
        })
    }

    /// Observer notification for a new submission, timestamp in unix millis
    pub fn new_job_submission(timestamp_ms: i64) -> Self {
        Self {
            message_type: "new_job_submission".to_string(),
            content: serde_json::json!({ "timestamp": timestamp_ms }),
        }
    }

    pub fn settings_update(settings: &RuntimeSettings) -> Result<Self> {
        Ok(Self {
            message_type: "settings_update".to_string(),
            content: serde_json::to_value(settings)?,
        })
    }
}
