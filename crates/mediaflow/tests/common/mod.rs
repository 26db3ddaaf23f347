//! Fake tools and a launcher shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use mediaflow::acquisition::{DownloadProgress, FetchError, FormatSelector, RemoteInfo, RemoteSource};
use mediaflow::media::{Analyzer, MediaTool, ProbeInfo, StreamInfo, TranscodeParams};
use mediaflow::types::{AnalysisResult, Segment, TimingStats};
use mediaflow::{AppConfig, Coordinator, MediaItem, MediaStore, SharedSettings, Supervisor, Tooling};

/// Media tool over in-memory files
pub struct FakeTool {
    pub duration: f64,
    pub probes: Mutex<u32>,
    /// Held by the first preview frame until the sender fires
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Notified when a preview frame is waiting on the gate
    pub gated: Notify,
}

impl FakeTool {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            probes: Mutex::new(0),
            gate: Mutex::new(None),
            gated: Notify::new(),
        }
    }

    /// Hold the next preview frame until the returned sender fires
    pub fn hold_next_frame(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl MediaTool for FakeTool {
    async fn probe(&self, _path: &Path) -> mediaflow::Result<ProbeInfo> {
        *self.probes.lock() += 1;
        Ok(ProbeInfo {
            duration: Some(self.duration),
            streams: vec![
                StreamInfo {
                    codec_type: "video".to_string(),
                    width: Some(640),
                    height: Some(360),
                },
                StreamInfo {
                    codec_type: "audio".to_string(),
                    ..Default::default()
                },
            ],
        })
    }

    async fn transcode(
        &self,
        _input: &Path,
        output: &Path,
        _params: &TranscodeParams,
    ) -> mediaflow::Result<()> {
        tokio::fs::write(output, b"RIFF").await?;
        Ok(())
    }

    async fn extract_frame(
        &self,
        _input: &Path,
        at_secs: f64,
        width: Option<u32>,
    ) -> mediaflow::Result<Vec<u8>> {
        let gate = match width {
            Some(_) => self.gate.lock().take(),
            None => None,
        };
        if let Some(gate) = gate {
            self.gated.notify_one();
            let _ = gate.await;
        }
        Ok(format!("frame@{}", at_secs).into_bytes())
    }

    async fn downscale(&self, image: &[u8], _width: u32) -> mediaflow::Result<Vec<u8>> {
        Ok(image.to_vec())
    }
}

/// Analyzer returning a fixed result and counting calls
pub struct FakeAnalyzer {
    pub result: Option<AnalysisResult>,
    pub calls: Mutex<Vec<PathBuf>>,
}

impl FakeAnalyzer {
    pub fn speaking() -> Self {
        let segment = Segment {
            start: 0.0,
            end: 4.0,
            speaker: "SPEAKER_00".to_string(),
        };
        Self {
            result: Some(AnalysisResult {
                raw_segments: vec![segment.clone()],
                merged_segments: vec![segment],
                speaker_count: 1,
                timing: TimingStats::default(),
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self {
            result: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn warm_up(&self) -> mediaflow::Result<()> {
        Ok(())
    }

    async fn analyze(&self, wav: &Path) -> mediaflow::Result<Option<AnalysisResult>> {
        self.calls.lock().push(wav.to_path_buf());
        Ok(self.result.clone())
    }
}

/// Remote source replaying scripted download failures before succeeding
#[derive(Default)]
pub struct ScriptedSource {
    pub failures: Mutex<VecDeque<FetchError>>,
    pub downloads: Mutex<u32>,
    pub live_status: Option<String>,
}

impl ScriptedSource {
    pub fn failing_with(messages: &[&str]) -> Self {
        Self {
            failures: Mutex::new(
                messages
                    .iter()
                    .map(|m| FetchError::Message(m.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn live() -> Self {
        Self {
            live_status: Some("is_live".to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    async fn inspect(&self, resource_id: &str) -> Result<RemoteInfo, FetchError> {
        Ok(RemoteInfo {
            id: resource_id.to_string(),
            title: Some(format!("Video {}", resource_id)),
            duration: Some(60.0),
            playable_in_embed: Some(true),
            live_status: self.live_status.clone(),
            ..Default::default()
        })
    }

    async fn download(
        &self,
        resource_id: &str,
        _format: &FormatSelector,
        dest_dir: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf, FetchError> {
        *self.downloads.lock() += 1;
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        on_progress(DownloadProgress {
            downloaded_bytes: 1024,
            total_bytes: Some(1024),
            speed: None,
        });
        let path = dest_dir.join(format!("temp_{}.m4a", resource_id));
        tokio::fs::write(&path, b"audio")
            .await
            .map_err(|e| FetchError::Message(e.to_string()))?;
        Ok(path)
    }
}

/// A launched coordinator with its fakes and scratch space
pub struct Harness {
    pub coordinator: Coordinator,
    pub supervisor: Supervisor,
    pub tool: Arc<FakeTool>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub source: Arc<ScriptedSource>,
    pub dir: tempfile::TempDir,
}

pub async fn launch(analyzer: FakeAnalyzer, source: ScriptedSource) -> Harness {
    launch_with(
        MediaStore::in_memory().unwrap(),
        FakeTool::new(10.0),
        analyzer,
        source,
    )
    .await
}

/// Launch over a store prepared by the caller
pub async fn launch_with(
    store: MediaStore,
    tool: FakeTool,
    analyzer: FakeAnalyzer,
    source: ScriptedSource,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.storage.temp_dir = dir.path().join("scratch");
    config.download.backoff_base_ms = 1;

    let tool = Arc::new(tool);
    let analyzer = Arc::new(analyzer);
    let source = Arc::new(source);
    let tooling = Tooling {
        media: tool.clone(),
        analyzer: analyzer.clone(),
        source: source.clone(),
        http: reqwest::Client::new(),
        settings: SharedSettings::default(),
    };

    let (coordinator, supervisor) = Coordinator::launch(config, store, tooling).await.unwrap();

    Harness {
        coordinator,
        supervisor,
        tool,
        analyzer,
        source,
        dir,
    }
}

/// Poll the store until `done` holds for the item
pub async fn wait_for(
    coordinator: &Coordinator,
    id: &str,
    done: impl Fn(&MediaItem) -> bool,
) -> MediaItem {
    let poll = async {
        loop {
            let item = coordinator.item(id).unwrap();
            if done(&item) {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("item did not reach the expected state")
}

/// Write a small file with distinct content
pub fn write_clip(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("clip {}", name)).unwrap();
    path
}
