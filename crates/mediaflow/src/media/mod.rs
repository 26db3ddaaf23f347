//! External media tooling: probing, transcoding, frame extraction and analysis

mod analyzer;
mod tool;

pub use analyzer::{Analyzer, CommandAnalyzer};
pub use tool::{Ffmpeg, MediaTool, ProbeInfo, StreamInfo, TranscodeParams};
