//! Main pipeline: acquire audio, transcode to speech WAV, run speaker analysis
//!
//! With speaker identification switched off in the runtime settings, items complete at once
//! with an empty result and only the metadata pipeline does work for them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::{JobContext, JobOutcome, Pipeline, ProgressReporter};
use crate::acquisition::{DownloadPolicy, ProgressSink, RemoteSource};
use crate::error::Result;
use crate::media::{Analyzer, MediaTool, TranscodeParams};
use crate::settings::SharedSettings;
use crate::storage::JobOutput;
use crate::types::{AnalysisResult, FailureKind, JobError, JobKind, MediaItem};

pub const START_DOWNLOAD_STAGE: &str = "Starting download";
pub const DECOMPRESS_STAGE: &str = "Decompressing audio";
pub const ANALYZE_STAGE: &str = "Identifying speakers...";
pub const SKIPPED_STAGE: &str = "Speaker identification is off";

const NO_AUDIO_DETAIL: &str = "No audio track found in file";
const NO_SPEAKERS_DETAIL: &str = "No speakers in audio!";

/// Audio file handed to the transcoder
struct AudioInput {
    path: PathBuf,
    /// Downloaded into the temp dir, removed after transcoding
    temporary: bool,
}

/// Processing pipeline over pluggable tools
pub struct ProcessingPipeline {
    tool: Arc<dyn MediaTool>,
    analyzer: Arc<dyn Analyzer>,
    source: Arc<dyn RemoteSource>,
    policy: DownloadPolicy,
    temp_dir: PathBuf,
    settings: SharedSettings,
}

impl ProcessingPipeline {
    pub fn new(
        tool: Arc<dyn MediaTool>,
        analyzer: Arc<dyn Analyzer>,
        source: Arc<dyn RemoteSource>,
        policy: DownloadPolicy,
        temp_dir: impl Into<PathBuf>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            tool,
            analyzer,
            source,
            policy,
            temp_dir: temp_dir.into(),
            settings,
        }
    }

    async fn audio_input(
        &self,
        item: &MediaItem,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<AudioInput, JobError> {
        if item.is_local() {
            let path = PathBuf::from(&item.uri);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(JobError::new(
                    FailureKind::Other,
                    format!("File not found: {}", item.uri),
                ));
            }
            return Ok(AudioInput {
                path,
                temporary: false,
            });
        }

        progress.stage(START_DOWNLOAD_STAGE);
        let acquisition = self
            .policy
            .acquire(self.source.as_ref(), &item.uri, &self.temp_dir, progress)
            .await;
        tracing::debug!(
            "{} acquisition took {} attempt(s), fallback: {}",
            item.id,
            acquisition.attempts,
            acquisition.used_fallback
        );

        acquisition.outcome.map(|path| AudioInput {
            path,
            temporary: true,
        })
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl Pipeline for ProcessingPipeline {
    fn kind(&self) -> JobKind {
        JobKind::Processing
    }

    async fn prepare(&self, reporter: &ProgressReporter) {
        if !self.settings.get().warm_up_processor {
            reporter.processor_status("warmed up");
            return;
        }

        reporter.processor_status("warming up");
        let started = Instant::now();
        match self.analyzer.warm_up().await {
            Ok(()) => {
                tracing::info!("Analyzer warmed up in {:.1}s", started.elapsed().as_secs_f64());
                reporter.processor_status("warmed up");
            }
            Err(e) => {
                tracing::error!("Analyzer warm-up failed: {}", e);
                reporter.processor_status("warm up failed");
            }
        }
    }

    async fn execute(&self, item: &MediaItem, ctx: &JobContext<'_>) -> Result<JobOutcome> {
        let started = Instant::now();
        let progress = ctx.reporter.for_job(&item.id);

        if !self.settings.identify_speakers() {
            progress.stage(SKIPPED_STAGE);
            return Ok(JobOutcome::Completed(JobOutput::Processing {
                result: AnalysisResult::default(),
                processing_secs: 0.0,
            }));
        }

        let input = match self.audio_input(item, &progress).await {
            Ok(input) => input,
            Err(error) => return Ok(error.into()),
        };

        progress.stage(DECOMPRESS_STAGE);
        let wav = self.temp_dir.join(format!("{}.wav", item.id));
        let transcoded = self
            .tool
            .transcode(&input.path, &wav, &TranscodeParams::speech())
            .await;
        if input.temporary {
            remove_quietly(&input.path).await;
        }
        if let Err(e) = transcoded {
            tracing::warn!("{} transcode failed: {}", item.id, e);
            remove_quietly(&wav).await;
            return Ok(JobError::new(FailureKind::NoAudio, NO_AUDIO_DETAIL).into());
        }

        progress.stage(ANALYZE_STAGE);
        let analyzed = self.analyzer.analyze(&wav).await;
        remove_quietly(&wav).await;

        let outcome = match analyzed {
            Ok(Some(result)) => JobOutcome::Completed(JobOutput::Processing {
                result,
                processing_secs: started.elapsed().as_secs_f64(),
            }),
            Ok(None) => JobError::new(FailureKind::NoSpeakers, NO_SPEAKERS_DETAIL).into(),
            Err(e) => JobError::new(FailureKind::Other, e.to_string()).into(),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{DownloadProgress, FetchError, FormatSelector, RemoteInfo};
    use crate::error::Error;
    use crate::media::ProbeInfo;
    use crate::messaging::{Router, RouterInbox, WorkerId, WorkerMessage};
    use crate::settings::RuntimeSettings;
    use crate::storage::MediaStore;
    use crate::types::{MediaType, NewSubmission, Segment, TimingStats};
    use futures::FutureExt;
    use parking_lot::Mutex;

    /// Transcoder that writes an empty WAV, or fails for paths containing "silent"
    struct FakeTool;

    #[async_trait]
    impl MediaTool for FakeTool {
        async fn probe(&self, _path: &Path) -> Result<ProbeInfo> {
            Ok(ProbeInfo::default())
        }

        async fn transcode(&self, input: &Path, output: &Path, _p: &TranscodeParams) -> Result<()> {
            if input.to_string_lossy().contains("silent") {
                return Err(Error::tool("ffmpeg", "Output file does not contain any stream"));
            }
            tokio::fs::write(output, b"RIFF").await?;
            Ok(())
        }

        async fn extract_frame(&self, _input: &Path, _at: f64, _w: Option<u32>) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn downscale(&self, image: &[u8], _width: u32) -> Result<Vec<u8>> {
            Ok(image.to_vec())
        }
    }

    struct FakeAnalyzer {
        result: Option<AnalysisResult>,
        warm_ups: Mutex<u32>,
        analyses: Mutex<u32>,
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        async fn warm_up(&self) -> Result<()> {
            *self.warm_ups.lock() += 1;
            Ok(())
        }

        async fn analyze(&self, wav: &Path) -> Result<Option<AnalysisResult>> {
            assert!(wav.exists(), "analysis runs on the transcoded file");
            *self.analyses.lock() += 1;
            Ok(self.result.clone())
        }
    }

    /// Remote source that writes a dummy download into the destination
    struct FakeSource;

    #[async_trait]
    impl RemoteSource for FakeSource {
        async fn inspect(&self, _resource_id: &str) -> std::result::Result<RemoteInfo, FetchError> {
            Ok(RemoteInfo::default())
        }

        async fn download(
            &self,
            resource_id: &str,
            _format: &FormatSelector,
            dest_dir: &Path,
            _on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        ) -> std::result::Result<PathBuf, FetchError> {
            let path = dest_dir.join(format!("temp_{}.m4a", resource_id));
            tokio::fs::write(&path, b"audio")
                .await
                .map_err(|e| FetchError::Message(e.to_string()))?;
            Ok(path)
        }
    }

    fn one_speaker() -> AnalysisResult {
        let segment = Segment {
            start: 0.0,
            end: 2.5,
            speaker: "SPEAKER_00".to_string(),
        };
        AnalysisResult {
            raw_segments: vec![segment.clone()],
            merged_segments: vec![segment],
            speaker_count: 1,
            timing: TimingStats::default(),
        }
    }

    fn build_pipeline(dir: &Path, result: Option<AnalysisResult>) -> (ProcessingPipeline, Arc<FakeAnalyzer>) {
        build_pipeline_with(dir, result, RuntimeSettings::default())
    }

    fn build_pipeline_with(
        dir: &Path,
        result: Option<AnalysisResult>,
        settings: RuntimeSettings,
    ) -> (ProcessingPipeline, Arc<FakeAnalyzer>) {
        let analyzer = Arc::new(FakeAnalyzer {
            result,
            warm_ups: Mutex::new(0),
            analyses: Mutex::new(0),
        });
        let pipeline = ProcessingPipeline::new(
            Arc::new(FakeTool),
            analyzer.clone(),
            Arc::new(FakeSource),
            DownloadPolicy::default(),
            dir,
            SharedSettings::new(settings),
        );
        (pipeline, analyzer)
    }

    fn failure(outcome: JobOutcome) -> JobError {
        match outcome {
            JobOutcome::Failed(error) => error,
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    async fn reporter() -> (ProgressReporter, RouterInbox) {
        let router = Router::new();
        let endpoint = router.connector().connect(WorkerId::processing()).unwrap();
        let (_handle, mut inbox) = router.split();
        inbox.collect_registrations(1).await.unwrap();
        (ProgressReporter::new(endpoint.outbox()), inbox)
    }

    fn stages(inbox: &mut RouterInbox) -> Vec<String> {
        let mut stages = Vec::new();
        while let Some(Some(envelope)) = inbox.recv().now_or_never() {
            if let WorkerMessage::ProgressUpdate(update) = envelope.message {
                stages.push(update.stage);
            }
        }
        stages
    }

    #[tokio::test]
    async fn test_remote_job_cleans_up_intermediate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::in_memory().unwrap();
        let id = store
            .submit(NewSubmission::remote("dQw4w9WgXcQ", MediaType::Video))
            .unwrap()
            .id;
        let item = store.get(&id).unwrap().unwrap();
        let (reporter, mut inbox) = reporter().await;
        let (pipeline, _) = build_pipeline(dir.path(), Some(one_speaker()));

        let ctx = JobContext {
            store: &store,
            reporter: &reporter,
        };
        let outcome = pipeline.execute(&item, &ctx).await.unwrap();

        match outcome {
            JobOutcome::Completed(JobOutput::Processing { result, .. }) => {
                assert_eq!(result.speaker_count, 1)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            stages(&mut inbox),
            vec![START_DOWNLOAD_STAGE, DECOMPRESS_STAGE, ANALYZE_STAGE]
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_local_job_without_speech_fails_with_no_speakers() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        std::fs::write(&clip, b"RIFF").unwrap();

        let store = MediaStore::in_memory().unwrap();
        let id = store
            .submit(NewSubmission::local(clip.to_string_lossy(), MediaType::Audio))
            .unwrap()
            .id;
        let item = store.get(&id).unwrap().unwrap();
        let (reporter, _inbox) = reporter().await;
        let (pipeline, _) = build_pipeline(dir.path(), None);

        let ctx = JobContext {
            store: &store,
            reporter: &reporter,
        };
        let error = failure(pipeline.execute(&item, &ctx).await.unwrap());

        assert_eq!(error.kind, FailureKind::NoSpeakers);
        assert_eq!(error.detail, NO_SPEAKERS_DETAIL);
        // The source file is left alone
        assert!(clip.exists());
    }

    #[tokio::test]
    async fn test_transcode_failure_is_no_audio() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("silent.mp4");
        std::fs::write(&clip, b"video").unwrap();

        let store = MediaStore::in_memory().unwrap();
        let id = store
            .submit(NewSubmission::local(clip.to_string_lossy(), MediaType::Video))
            .unwrap()
            .id;
        let item = store.get(&id).unwrap().unwrap();
        let (reporter, _inbox) = reporter().await;
        let (pipeline, _) = build_pipeline(dir.path(), Some(one_speaker()));

        let ctx = JobContext {
            store: &store,
            reporter: &reporter,
        };
        let error = failure(pipeline.execute(&item, &ctx).await.unwrap());
        assert_eq!(error.kind, FailureKind::NoAudio);
        assert_eq!(error.detail, NO_AUDIO_DETAIL);
    }

    #[tokio::test]
    async fn test_prepare_reports_warm_up() {
        let dir = tempfile::tempdir().unwrap();
        let (reporter, mut inbox) = reporter().await;
        let (pipeline, analyzer) = build_pipeline(dir.path(), None);

        pipeline.prepare(&reporter).await;
        assert_eq!(*analyzer.warm_ups.lock(), 1);

        let mut statuses = Vec::new();
        while let Some(Some(envelope)) = inbox.recv().now_or_never() {
            if let WorkerMessage::ProcessorStatus(status) = envelope.message {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec!["warming up", "warmed up"]);

        let (pipeline, analyzer) = build_pipeline_with(
            dir.path(),
            None,
            RuntimeSettings {
                warm_up_processor: false,
                ..Default::default()
            },
        );
        pipeline.prepare(&reporter).await;
        assert_eq!(*analyzer.warm_ups.lock(), 0);
    }

    #[tokio::test]
    async fn test_identification_off_completes_without_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::in_memory().unwrap();
        let id = store
            .submit(NewSubmission::remote("dQw4w9WgXcQ", MediaType::Video))
            .unwrap()
            .id;
        let item = store.get(&id).unwrap().unwrap();
        let (reporter, mut inbox) = reporter().await;
        let (pipeline, analyzer) = build_pipeline_with(
            dir.path(),
            Some(one_speaker()),
            RuntimeSettings {
                identify_speakers: false,
                ..Default::default()
            },
        );

        let ctx = JobContext {
            store: &store,
            reporter: &reporter,
        };
        match pipeline.execute(&item, &ctx).await.unwrap() {
            JobOutcome::Completed(JobOutput::Processing { result, .. }) => {
                assert_eq!(result, AnalysisResult::default())
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(*analyzer.analyses.lock(), 0);
        assert_eq!(stages(&mut inbox), vec![SKIPPED_STAGE]);
        // Nothing was downloaded
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
