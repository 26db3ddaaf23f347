//! Core types for the media job data model

pub mod media;

pub use media::{
    AnalysisResult, Chapter, Frame, JobError, JobKind, JobStatus, FailureKind, MediaItem,
    MediaPreviews, MediaType, MetadataResult, MetadataStatus, NewSubmission, Segment, Source,
    Submission, TimingStats,
};
