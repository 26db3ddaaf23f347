//! Coordinator: owns the store, the router and the status cache
//!
//! Startup order: recover interrupted rows, prepare the temp dir, connect and spawn both
//! workers, wait for their registrations, then start the relay and report ready.

use chrono::{DateTime, Utc};
use futures::future::select_all;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::acquisition::{extract_resource_id, DownloadPolicy, RemoteSource, YtDlp};
use crate::cache::{StatusCache, StatusSnapshot};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::media::{Analyzer, CommandAnalyzer, Ffmpeg, MediaTool};
use crate::messaging::{RelayedEvent, Relay, Router, RouterHandle, Signal, WorkerId};
use crate::settings::{RuntimeSettings, SettingsUpdate, SharedSettings};
use crate::storage::MediaStore;
use crate::types::{JobKind, MediaItem, MediaPreviews, MediaType, NewSubmission, Submission};
use crate::worker::{MetadataPipeline, ProcessingPipeline, Worker};

/// Buffered observer events per subscriber
const EVENT_CAPACITY: usize = 256;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

const AUDIO_EXTENSIONS: &[&str] = &["aac", "flac", "m4a", "mp3", "oga", "ogg", "opus", "wav", "wma"];

/// External tools the workers drive
#[derive(Clone)]
pub struct Tooling {
    pub media: Arc<dyn MediaTool>,
    pub analyzer: Arc<dyn Analyzer>,
    pub source: Arc<dyn RemoteSource>,
    pub http: reqwest::Client,
    /// Live runtime settings, replaced from the store at launch
    pub settings: SharedSettings,
}

impl Tooling {
    /// ffmpeg, yt-dlp and the configured analysis command
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download.socket_timeout_secs.max(1) * 3))
            .build()?;
        let settings = SharedSettings::new(RuntimeSettings::from_config(config));

        Ok(Self {
            media: Arc::new(Ffmpeg::new(&config.media)),
            analyzer: Arc::new(CommandAnalyzer::new(&config.analysis)),
            source: Arc::new(YtDlp::new(&config.download, settings.clone())),
            http,
            settings,
        })
    }
}

/// Awaits the worker tasks. Workers are never restarted.
pub struct Supervisor {
    workers: Vec<(WorkerId, JoinHandle<Result<()>>)>,
}

impl Supervisor {
    /// Resolve when the first worker exits, with its error if it failed
    pub async fn wait(self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }

        let (identities, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        let (joined, index, _rest) = select_all(handles).await;
        let identity = &identities[index];

        match joined {
            Ok(Ok(())) => {
                tracing::info!("{} worker exited", identity);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!("{} worker failed: {}", identity, e);
                Err(e)
            }
            Err(e) => Err(Error::internal(format!("{} worker panicked: {}", identity, e))),
        }
    }
}

/// Handle to the running orchestrator, shared by the HTTP layer
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: AppConfig,
    store: MediaStore,
    cache: StatusCache,
    router: RouterHandle,
    events: broadcast::Sender<RelayedEvent>,
    settings: SharedSettings,
    ready: RwLock<bool>,
}

impl Coordinator {
    /// Start both workers and the relay over an opened store
    pub async fn launch(
        config: AppConfig,
        store: MediaStore,
        tooling: Tooling,
    ) -> Result<(Self, Supervisor)> {
        store.recover_interrupted()?;
        prepare_temp_dir(&config.storage.temp_dir).await?;

        // Stored values win over the config seed; the merged set is written back
        let settings = store.load_settings(&tooling.settings.get())?;
        store.save_settings(&settings)?;
        tracing::info!("Runtime settings: {:?}", settings);
        tooling.settings.replace(settings);

        let router = Router::new();
        let connector = router.connector();
        let metadata_endpoint = connector.connect(WorkerId::metadata())?;
        let processing_endpoint = connector.connect(WorkerId::processing())?;
        drop(connector);
        let (handle, mut inbox) = router.split();

        let policy = DownloadPolicy::new(&config.download);
        let metadata = Worker::new(
            store.clone(),
            metadata_endpoint,
            MetadataPipeline::new(
                tooling.media.clone(),
                tooling.source.clone(),
                policy.clone(),
                tooling.http.clone(),
                config.media.clone(),
            ),
        );
        let processing = Worker::new(
            store.clone(),
            processing_endpoint,
            ProcessingPipeline::new(
                tooling.media.clone(),
                tooling.analyzer.clone(),
                tooling.source.clone(),
                policy,
                config.storage.temp_dir.clone(),
                tooling.settings.clone(),
            ),
        );

        let supervisor = Supervisor {
            workers: vec![
                (WorkerId::metadata(), tokio::spawn(metadata.run())),
                (WorkerId::processing(), tokio::spawn(processing.run())),
            ],
        };

        let registered = inbox.collect_registrations(2).await?;
        tracing::info!(
            "Workers registered: {}",
            registered
                .iter()
                .map(|w| w.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let cache = StatusCache::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tokio::spawn(Relay::new(cache.clone(), events.clone()).run(inbox));

        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                config,
                store,
                cache,
                router: handle,
                events,
                settings: tooling.settings,
                ready: RwLock::new(true),
            }),
        };
        Ok((coordinator, supervisor))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &MediaStore {
        &self.inner.store
    }

    /// Registration barrier passed and not shut down
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Submit a remote url or bare resource id
    pub fn submit_remote(&self, url: &str, media_type: MediaType) -> Result<Submission> {
        let resource_id = extract_resource_id(url)
            .ok_or_else(|| Error::InvalidRequest(format!("Not a recognised video url: {}", url)))?;

        let submission = self
            .inner
            .store
            .submit(NewSubmission::remote(resource_id, media_type))?;
        self.announce(&submission);
        Ok(submission)
    }

    /// Submit a local file, de-duplicated by content hash
    pub async fn submit_local(&self, path: &Path) -> Result<Submission> {
        let file_meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::InvalidRequest(format!("Cannot read {}: {}", path.display(), e)))?;
        if !file_meta.is_file() {
            return Err(Error::InvalidRequest(format!("Not a file: {}", path.display())));
        }

        let hash = hash_file(path).await?;
        let mut submission = NewSubmission::local(path.to_string_lossy(), media_type_for(path))
            .with_content_hash(hash);
        if let Some(name) = path.file_name() {
            submission = submission.with_title(name.to_string_lossy());
        }
        if let Ok(created) = file_meta.created().or_else(|_| file_meta.modified()) {
            submission = submission.with_file_created_at(DateTime::<Utc>::from(created));
        }

        let submission = self.inner.store.submit(submission)?;
        self.announce(&submission);
        Ok(submission)
    }

    /// Wake every worker and tell observers, only for newly created rows
    fn announce(&self, submission: &Submission) {
        if !submission.created {
            tracing::debug!("{} already submitted", submission.id);
            return;
        }

        let woken = self.inner.router.broadcast(Signal::NewJobSubmission);
        tracing::info!("Submitted {}, woke {} worker(s)", submission.id, woken);
        let _ = self
            .inner
            .events
            .send(RelayedEvent::new_job_submission(Utc::now().timestamp_millis()));
    }

    /// Reset the given stages of a finished item and wake their workers.
    /// Returns the stages that were actually reset.
    pub fn retry(
        &self,
        id: &str,
        stages: &[JobKind],
        force_raw_stream: bool,
    ) -> Result<Vec<JobKind>> {
        if self.inner.store.get(id)?.is_none() {
            return Err(Error::not_found(id));
        }

        let mut reset = Vec::new();
        for &stage in stages {
            let (accepted, worker) = match stage {
                JobKind::Processing => (
                    self.inner.store.retry_processing(id)?,
                    WorkerId::processing(),
                ),
                JobKind::Metadata => (
                    self.inner.store.refetch_metadata(id, force_raw_stream)?,
                    WorkerId::metadata(),
                ),
            };

            if accepted {
                // The reset row is picked up on the worker's next poll even without the wake
                if let Err(e) = self.inner.router.send(&worker, Signal::NewJobSubmission) {
                    tracing::warn!("Could not wake {} worker for {}: {}", worker, id, e);
                }
                if !reset.contains(&stage) {
                    reset.push(stage);
                }
            } else {
                tracing::debug!("{} {} is still in flight, not retried", id, stage);
            }
        }

        tracing::info!("Retry of {}: {:?}", id, reset);
        Ok(reset)
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.inner.settings.get()
    }

    /// Apply and persist a settings change, then tell observers
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<RuntimeSettings> {
        let mut settings = self.inner.settings.get();
        settings.apply(update);
        self.inner.store.save_settings(&settings)?;
        self.inner.settings.replace(settings.clone());

        tracing::info!("Settings updated: {:?}", settings);
        let _ = self
            .inner
            .events
            .send(RelayedEvent::settings_update(&settings)?);
        Ok(settings)
    }

    pub fn poll_status(&self) -> StatusSnapshot {
        self.inner.cache.snapshot()
    }

    /// Delete items with their frames, then reclaim space
    pub fn delete(&self, ids: &[String]) -> Result<usize> {
        let deleted = self.inner.store.delete(ids)?;
        if deleted > 0 {
            self.inner.store.vacuum()?;
        }
        Ok(deleted)
    }

    pub fn previews(&self) -> Result<MediaPreviews> {
        self.inner.store.list_previews()
    }

    pub fn item(&self, id: &str) -> Result<MediaItem> {
        self.inner
            .store
            .get(id)?
            .ok_or_else(|| Error::not_found(id))
    }

    /// Existing non-failed item for a remote url or resource id
    pub fn exists(&self, url: &str) -> Result<Option<String>> {
        match extract_resource_id(url) {
            Some(resource_id) => self.inner.store.find_remote(&resource_id),
            None => Ok(None),
        }
    }

    pub fn thumbnail(&self, id: &str, low_res: bool) -> Result<Vec<u8>> {
        self.inner
            .store
            .thumbnail(id, low_res)?
            .ok_or_else(|| Error::not_found(id))
    }

    pub fn frame(&self, id: &str, timestamp: u32) -> Result<Vec<u8>> {
        self.inner
            .store
            .frame(id, timestamp)?
            .ok_or_else(|| Error::not_found(format!("{} frame at {}s", id, timestamp)))
    }

    /// Observer stream of relayed worker messages and submission events
    pub fn subscribe(&self) -> broadcast::Receiver<RelayedEvent> {
        self.inner.events.subscribe()
    }

    /// Ask idle workers to stop. Running jobs finish first.
    pub fn shutdown(&self) {
        *self.inner.ready.write() = false;
        let signalled = self.inner.router.broadcast(Signal::Shutdown);
        tracing::info!("Shutdown sent to {} worker(s)", signalled);
    }
}

/// Create the temp dir, or empty it of leftovers from a previous run
async fn prepare_temp_dir(dir: &Path) -> Result<()> {
    if !tokio::fs::try_exists(dir).await? {
        tokio::fs::create_dir_all(dir).await?;
        return Ok(());
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Could not clean {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        tracing::info!("Removed {} leftover file(s) from {}", removed, dir.display());
    }
    Ok(())
}

/// Hex SHA-256 of a file's content
async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn media_type_for(path: &Path) -> MediaType {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        MediaType::Audio
    } else {
        MediaType::Video
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
