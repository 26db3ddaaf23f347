//! Remote media acquisition
//!
//! - `classify`: error text to [`crate::types::FailureKind`]
//! - `retry`: bounded retry with exponential backoff and the format fallback
//! - `remote`: the [`RemoteSource`] seam and its yt-dlp implementation

mod classify;
mod remote;
mod retry;

pub use classify::{
    extract_error_detail, extract_resource_id, ClassificationRule, ClassificationRules,
};
pub use remote::{
    DownloadProgress, FetchError, FormatSelector, RemoteFormat, RemoteInfo, RemoteSource, YtDlp,
};
pub use retry::{
    Acquisition, Attempted, DownloadPolicy, ProgressSink, DOWNLOAD_STAGE, FORMAT_FALLBACK_STAGE,
};
