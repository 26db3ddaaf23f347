//! Worker-side progress reporting

use crate::acquisition::ProgressSink;
use crate::messaging::{Outbox, ProgressUpdate, TransferStats, WorkerMessage};

/// Sends lifecycle and progress messages to the coordinator.
///
/// Delivery failures are logged and dropped; a vanished coordinator is noticed by the
/// worker's idle-wait instead.
#[derive(Clone)]
pub struct ProgressReporter {
    outbox: Outbox,
}

impl ProgressReporter {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }

    fn send(&self, message: WorkerMessage) {
        if let Err(e) = self.outbox.send(message) {
            tracing::debug!("{} could not report: {}", self.outbox.identity(), e);
        }
    }

    pub fn processor_status(&self, status: &str) {
        self.send(WorkerMessage::ProcessorStatus(status.to_string()));
    }

    pub fn job_started(&self, id: &str) {
        self.send(WorkerMessage::NewJobStarted { id: id.to_string() });
    }

    pub fn progress(&self, update: ProgressUpdate) {
        self.send(WorkerMessage::ProgressUpdate(update));
    }

    pub fn job_done(&self, id: &str) {
        self.send(WorkerMessage::JobDone { id: id.to_string() });
    }

    pub fn metadata_refresh(&self) {
        self.send(WorkerMessage::MetadataRefresh);
    }

    /// Progress scoped to one job
    pub fn for_job<'a>(&'a self, id: &'a str) -> JobProgress<'a> {
        JobProgress { reporter: self, id }
    }
}

/// [`ProgressReporter`] bound to a job id
pub struct JobProgress<'a> {
    reporter: &'a ProgressReporter,
    id: &'a str,
}

impl ProgressSink for JobProgress<'_> {
    fn stage(&self, stage: &str) {
        tracing::debug!("{}: {}", self.id, stage);
        self.reporter.progress(ProgressUpdate::stage(self.id, stage));
    }

    fn transfer(&self, stage: &str, percent: Option<f64>, transfer: TransferStats) {
        let mut update = ProgressUpdate::stage(self.id, stage).with_transfer(transfer);
        update.percent = percent;
        self.reporter.progress(update);
    }
}
