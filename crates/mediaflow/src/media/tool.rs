//! ffmpeg/ffprobe wrapper

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::MediaConfig;
use crate::error::{Error, Result};

/// One stream reported by the prober
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    pub codec_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Container-level facts about a media file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub duration: Option<f64>,
    pub streams: Vec<StreamInfo>,
}

impl ProbeInfo {
    pub fn has_audio(&self) -> bool {
        self.streams.iter().any(|s| s.codec_type == "audio")
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.codec_type == "video")
    }

    /// Width over height of the first video stream
    pub fn aspect_ratio(&self) -> Option<f64> {
        self.streams
            .iter()
            .find(|s| s.codec_type == "video")
            .and_then(|s| match (s.width, s.height) {
                (Some(w), Some(h)) if h > 0 => Some(f64::from(w) / f64::from(h)),
                _ => None,
            })
    }
}

/// Target of an audio transcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeParams {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
}

impl TranscodeParams {
    /// 16 kHz mono 16-bit PCM, the input format of the analysis engine
    pub fn speech() -> Self {
        Self {
            codec: "pcm_s16le".to_string(),
            channels: 1,
            sample_rate: 16_000,
        }
    }
}

/// Media probing, transcoding and frame extraction
#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo>;

    async fn transcode(&self, input: &Path, output: &Path, params: &TranscodeParams) -> Result<()>;

    /// JPEG of the frame at `at_secs`, scaled to `width` when given
    async fn extract_frame(&self, input: &Path, at_secs: f64, width: Option<u32>) -> Result<Vec<u8>>;

    /// Re-encode a JPEG at a smaller width
    async fn downscale(&self, image: &[u8], width: u32) -> Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
}

/// [`MediaTool`] over the ffmpeg command line tools
pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
}

impl Ffmpeg {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
        }
    }

    fn ffmpeg(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn failure(tool: &str, stderr: &[u8]) -> Error {
    let text = String::from_utf8_lossy(stderr);
    let message = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("exited unsuccessfully");
    Error::tool(tool, message.trim())
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(failure("ffprobe", &output.stderr));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        Ok(ProbeInfo {
            duration: probe
                .format
                .and_then(|f| f.duration)
                .and_then(|d| d.parse::<f64>().ok()),
            streams: probe
                .streams
                .into_iter()
                .map(|s| StreamInfo {
                    codec_type: s.codec_type,
                    width: s.width,
                    height: s.height,
                })
                .collect(),
        })
    }

    async fn transcode(&self, input: &Path, output: &Path, params: &TranscodeParams) -> Result<()> {
        let result = self
            .ffmpeg()
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-acodec")
            .arg(&params.codec)
            .arg("-ac")
            .arg(params.channels.to_string())
            .arg("-ar")
            .arg(params.sample_rate.to_string())
            .arg(output)
            .output()
            .await?;

        if !result.status.success() {
            return Err(failure("ffmpeg", &result.stderr));
        }
        Ok(())
    }

    async fn extract_frame(&self, input: &Path, at_secs: f64, width: Option<u32>) -> Result<Vec<u8>> {
        let mut cmd = self.ffmpeg();
        cmd.arg("-ss")
            .arg(format!("{:.3}", at_secs))
            .arg("-i")
            .arg(input)
            .args(["-frames:v", "1"]);
        if let Some(width) = width {
            cmd.arg("-vf").arg(format!("scale={}:-2", width));
        }
        let output = cmd
            .args(["-q:v", "5", "-f", "image2", "-c:v", "mjpeg", "pipe:1"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(failure("ffmpeg", &output.stderr));
        }
        if output.stdout.is_empty() {
            return Err(Error::tool("ffmpeg", format!("no frame at {:.3}s", at_secs)));
        }
        Ok(output.stdout)
    }

    async fn downscale(&self, image: &[u8], width: u32) -> Result<Vec<u8>> {
        let mut child = self
            .ffmpeg()
            .args(["-f", "image2pipe", "-i", "pipe:0"])
            .arg("-vf")
            .arg(format!("scale='min({},iw)':-2", width))
            .args(["-q:v", "3", "-f", "image2", "-c:v", "mjpeg", "pipe:1"])
            .stdin(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("ffmpeg stdin unavailable"))?;
        let input = image.to_vec();
        let writer = tokio::spawn(async move {
            let written = stdin.write_all(&input).await;
            drop(stdin);
            written
        });

        let output = child.wait_with_output().await?;
        writer
            .await
            .map_err(|e| Error::internal(format!("ffmpeg writer task failed: {}", e)))??;

        if !output.status.success() {
            return Err(failure("ffmpeg", &output.stderr));
        }
        Ok(output.stdout)
    }
}
