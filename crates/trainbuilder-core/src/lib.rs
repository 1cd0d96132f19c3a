//! Core domain types and traits for the train builder.
//!
//! This crate contains:
//! - Job records, identifiers and the pipeline state machine
//! - Train name normalization
//! - Container engine and stage processor traits

pub mod engine;
pub mod error;
pub mod job;
pub mod name;
pub mod processor;

pub use error::{Error, Result};
pub use job::{ARCHIVE_EXTENSION, Job, JobId, JobState};
pub use name::normalize;
