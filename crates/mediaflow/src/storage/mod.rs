//! Storage module for persistent job state
//!
//! Provides the SQLite-backed media job store.

mod database;

pub use database::{generate_short_id, JobOutput, MediaStore, ID_LENGTH};
