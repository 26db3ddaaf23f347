//! Worker loop shared by the metadata and processing pipelines
//!
//! A worker polls the store for the oldest eligible item. When there is none it blocks on
//! its endpoint until the coordinator signals, then polls again. Signals sent while the
//! worker is busy stay buffered, so no submission is missed between a poll and the next
//! receive.

mod metadata;
mod processing;
mod reporter;

pub use metadata::MetadataPipeline;
pub use processing::ProcessingPipeline;
pub use reporter::{JobProgress, ProgressReporter};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::messaging::{Signal, WorkerEndpoint};
use crate::storage::{JobOutput, MediaStore};
use crate::types::{JobError, JobKind, MediaItem};

/// Terminal outcome of one job run
#[derive(Debug)]
pub enum JobOutcome {
    /// Output for the worker to write
    Completed(JobOutput),
    /// The pipeline wrote its own success while it ran. Nothing is written again, so a
    /// reset made meanwhile by a retry survives and the item is claimed afresh.
    Persisted,
    Failed(JobError),
}

impl From<JobError> for JobOutcome {
    fn from(error: JobError) -> Self {
        Self::Failed(error)
    }
}

/// What a worker needs while executing a job
pub struct JobContext<'a> {
    pub store: &'a MediaStore,
    pub reporter: &'a ProgressReporter,
}

/// Stages run for one claimed item
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Which status column this pipeline drives
    fn kind(&self) -> JobKind;

    /// One-off setup before the first poll
    async fn prepare(&self, _reporter: &ProgressReporter) {}

    /// Run every stage. The outer error is an infrastructure failure and stops the worker.
    async fn execute(&self, item: &MediaItem, ctx: &JobContext<'_>) -> Result<JobOutcome>;
}

/// Polling worker over one pipeline
pub struct Worker<P: Pipeline> {
    store: MediaStore,
    endpoint: WorkerEndpoint,
    reporter: ProgressReporter,
    pipeline: P,
}

impl<P: Pipeline> Worker<P> {
    pub fn new(store: MediaStore, endpoint: WorkerEndpoint, pipeline: P) -> Self {
        let reporter = ProgressReporter::new(endpoint.outbox());
        Self {
            store,
            endpoint,
            reporter,
            pipeline,
        }
    }

    /// Run until shutdown. Store errors end the worker.
    pub async fn run(mut self) -> Result<()> {
        let kind = self.pipeline.kind();
        let identity = self.endpoint.identity().clone();

        self.pipeline.prepare(&self.reporter).await;
        tracing::info!("{} worker started", identity);

        loop {
            if let Some(item) = self.store.claim_next(kind)? {
                self.run_job(item).await?;
                continue;
            }

            match self.endpoint.recv().await {
                Some(Signal::NewJobSubmission) => {
                    tracing::debug!("{} worker woken", identity);
                }
                Some(Signal::Shutdown) => {
                    tracing::info!("{} worker shutting down", identity);
                    return Ok(());
                }
                None => {
                    return Err(Error::channel(format!(
                        "{} worker lost its coordinator",
                        identity
                    )))
                }
            }
        }
    }

    async fn run_job(&self, item: MediaItem) -> Result<()> {
        let kind = self.pipeline.kind();

        if kind == JobKind::Processing {
            if !self.store.mark_processing(&item.id)? {
                tracing::debug!("{} was claimed elsewhere, skipping", item.id);
                return Ok(());
            }
            self.reporter.job_started(&item.id);
        }

        tracing::info!("Running {} job {} ({})", kind, item.id, item.uri);
        let ctx = JobContext {
            store: &self.store,
            reporter: &self.reporter,
        };
        let outcome = self.pipeline.execute(&item, &ctx).await?;

        let persisted = match &outcome {
            JobOutcome::Completed(output) if output.kind() != kind => {
                return Err(Error::internal(format!(
                    "{} pipeline produced {} output for {}",
                    kind,
                    output.kind(),
                    item.id
                )))
            }
            JobOutcome::Completed(output) => {
                tracing::info!("{} job {} succeeded", kind, item.id);
                self.store.complete(&item.id, output)?
            }
            JobOutcome::Persisted => {
                tracing::info!("{} job {} succeeded", kind, item.id);
                true
            }
            JobOutcome::Failed(error) => {
                tracing::warn!("{} job {} failed: {}", kind, item.id, error);
                self.store.fail(kind, &item.id, error)?
            }
        };
        if !persisted {
            tracing::warn!("{} job {} changed underneath the worker, result dropped", kind, item.id);
        }

        match kind {
            JobKind::Processing => self.reporter.job_done(&item.id),
            JobKind::Metadata => self.reporter.metadata_refresh(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Router, RouterHandle, RouterInbox, WorkerId, WorkerMessage};
    use crate::types::{AnalysisResult, FailureKind, JobStatus, MediaType, NewSubmission};
    use parking_lot::Mutex;

    /// Pipeline that records the ids it ran and fails ids starting with "fail"
    #[derive(Default)]
    struct RecordingPipeline {
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Pipeline for std::sync::Arc<RecordingPipeline> {
        fn kind(&self) -> JobKind {
            JobKind::Processing
        }

        async fn execute(&self, item: &MediaItem, _ctx: &JobContext<'_>) -> Result<JobOutcome> {
            self.ran.lock().push(item.uri.clone());
            if item.uri.starts_with("fail") {
                return Ok(JobError::new(FailureKind::NoAudio, "No audio track found in file").into());
            }
            Ok(JobOutcome::Completed(JobOutput::Processing {
                result: AnalysisResult::default(),
                processing_secs: 0.0,
            }))
        }
    }

    fn setup() -> (MediaStore, RouterHandle, RouterInbox, WorkerEndpoint) {
        let store = MediaStore::in_memory().unwrap();
        let router = Router::new();
        let endpoint = router.connector().connect(WorkerId::processing()).unwrap();
        let (handle, inbox) = router.split();
        (store, handle, inbox, endpoint)
    }

    #[tokio::test]
    async fn test_worker_drains_queue_then_waits_for_signal() {
        let (store, handle, mut inbox, endpoint) = setup();
        let pipeline = std::sync::Arc::new(RecordingPipeline::default());

        store
            .submit(NewSubmission::local("/m/a.wav", MediaType::Audio))
            .unwrap();
        let worker = Worker::new(store.clone(), endpoint, pipeline.clone());
        let task = tokio::spawn(worker.run());

        // Registration, then the first job's lifecycle
        inbox.collect_registrations(1).await.unwrap();
        assert!(matches!(
            inbox.recv().await.unwrap().message,
            WorkerMessage::NewJobStarted { .. }
        ));
        assert!(matches!(
            inbox.recv().await.unwrap().message,
            WorkerMessage::JobDone { .. }
        ));

        // Submitted while idle: only runs after the wake signal
        let id = store
            .submit(NewSubmission::local("fail.wav", MediaType::Audio))
            .unwrap()
            .id;
        handle.broadcast(Signal::NewJobSubmission);
        assert!(matches!(
            inbox.recv().await.unwrap().message,
            WorkerMessage::NewJobStarted { .. }
        ));
        assert!(matches!(
            inbox.recv().await.unwrap().message,
            WorkerMessage::JobDone { .. }
        ));

        let item = store.get(&id).unwrap().unwrap();
        assert_eq!(item.status, JobStatus::Failed);
        assert_eq!(item.error.unwrap().kind, FailureKind::NoAudio);

        handle.broadcast(Signal::Shutdown);
        task.await.unwrap().unwrap();
        let first = store.claim_next(JobKind::Metadata).unwrap().unwrap();
        assert_eq!(first.uri, "/m/a.wav");
        assert_eq!(store.get(&first.id).unwrap().unwrap().status, JobStatus::Success);
        assert_eq!(*pipeline.ran.lock(), vec!["/m/a.wav", "fail.wav"]);
    }

    #[tokio::test]
    async fn test_worker_stops_when_coordinator_is_gone() {
        let (store, handle, inbox, endpoint) = setup();
        let worker = Worker::new(
            store,
            endpoint,
            std::sync::Arc::new(RecordingPipeline::default()),
        );

        drop(handle);
        drop(inbox);
        // The peers map held the only signal sender
        let result = worker.run().await;
        assert!(matches!(result, Err(Error::Channel(_))));
    }
}
