//! mediaflow: media job orchestration
//!
//! A durable SQLite job store, a coordinator that wakes two polling workers (metadata and
//! processing) over buffered channels, a bounded and classified download retry policy, and
//! a relay that forwards worker progress to a status cache and to HTTP observers.

pub mod acquisition;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod messaging;
pub mod server;
pub mod settings;
pub mod storage;
pub mod types;
pub mod worker;

pub use cache::{StatusCache, StatusSnapshot};
pub use config::AppConfig;
pub use coordinator::{Coordinator, Supervisor, Tooling};
pub use error::{Error, Result};
pub use settings::{RuntimeSettings, SettingsUpdate, SharedSettings};
pub use storage::MediaStore;
pub use types::{
    FailureKind, JobError, JobKind, JobStatus, MediaItem, MediaType, MetadataStatus, Submission,
};
