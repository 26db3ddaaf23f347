//! Process-local status cache
//!
//! Holds the processing worker's readiness and the progress of the job it is running, so
//! status polls never touch the store or the workers.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::messaging::ProgressUpdate;

/// Processor status before the processing worker reports anything
pub const INITIAL_PROCESSOR_STATUS: &str = "loading";

/// Point-in-time copy of the cache
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub processor_status: String,
    pub active_job_status: Option<ProgressUpdate>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            processor_status: INITIAL_PROCESSOR_STATUS.to_string(),
            active_job_status: None,
        }
    }
}

/// Shared status cache
#[derive(Clone, Default)]
pub struct StatusCache {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processor_status(&self) -> String {
        self.inner.lock().processor_status.clone()
    }

    pub fn set_processor_status(&self, status: impl Into<String>) {
        self.inner.lock().processor_status = status.into();
    }

    pub fn active_job(&self) -> Option<ProgressUpdate> {
        self.inner.lock().active_job_status.clone()
    }

    /// Replace the active job progress, `None` once the job is done
    pub fn set_active_job(&self, progress: Option<ProgressUpdate>) {
        self.inner.lock().active_job_status = progress;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cache = StatusCache::new();
        assert_eq!(cache.processor_status(), "loading");
        assert!(cache.active_job().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let cache = StatusCache::new();
        let writer = cache.clone();

        writer.set_processor_status("warmed up");
        writer.set_active_job(Some(ProgressUpdate::stage("abc", "Identifying speakers...")));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.processor_status, "warmed up");
        assert_eq!(
            snapshot.active_job_status.map(|p| p.stage),
            Some("Identifying speakers...".to_string())
        );

        writer.set_active_job(None);
        assert!(cache.active_job().is_none());
    }
}
