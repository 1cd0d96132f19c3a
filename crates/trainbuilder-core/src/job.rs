//! Train jobs and the pipeline state machine.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File extension of every train archive on disk.
pub const ARCHIVE_EXTENSION: &str = "tar";

/// Identifier of a job. Assigned monotonically by the job store, so it
/// doubles as the FIFO ordering key within a stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// States a train job traverses.
///
/// The six pipeline states form a strict forward sequence. `Failed` is the
/// only side exit and can only be entered from an in-flight state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    ArchiveSaved,
    AugmentInProgress,
    AugmentDone,
    PublishInProgress,
    PublishDone,
    Failed,
}

impl JobState {
    /// The pipeline sequence, in order.
    pub const PIPELINE: [JobState; 6] = [
        JobState::Submitted,
        JobState::ArchiveSaved,
        JobState::AugmentInProgress,
        JobState::AugmentDone,
        JobState::PublishInProgress,
        JobState::PublishDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::ArchiveSaved => "archive_saved",
            JobState::AugmentInProgress => "augment_in_progress",
            JobState::AugmentDone => "augment_done",
            JobState::PublishInProgress => "publish_in_progress",
            JobState::PublishDone => "publish_done",
            JobState::Failed => "failed",
        }
    }

    /// Position in the pipeline sequence. `None` for `Failed`.
    pub fn position(&self) -> Option<usize> {
        Self::PIPELINE.iter().position(|s| s == self)
    }

    /// The state that follows this one in the pipeline.
    pub fn next(&self) -> Option<JobState> {
        self.position()
            .and_then(|idx| Self::PIPELINE.get(idx + 1))
            .copied()
    }

    /// Whether a stage processor currently owns a job in this state.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobState::AugmentInProgress | JobState::PublishInProgress
        )
    }

    /// Whether `to` is a legal single step from this state.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        self.next() == Some(to) || (self.is_in_flight() && to == JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(JobState::Submitted),
            "archive_saved" => Ok(JobState::ArchiveSaved),
            "augment_in_progress" => Ok(JobState::AugmentInProgress),
            "augment_done" => Ok(JobState::AugmentDone),
            "publish_in_progress" => Ok(JobState::PublishInProgress),
            "publish_done" => Ok(JobState::PublishDone),
            "failed" => Ok(JobState::Failed),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown job state: {}",
                other
            ))),
        }
    }
}

/// A train archive job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Directory holding the job's archive.
    pub directory: PathBuf,
    /// Normalized train name, used as the registry repository.
    pub canonical_name: String,
    pub state: JobState,
    /// Detail of the last processor failure, if any.
    pub error: Option<String>,
    /// Failed processor attempts in the current or last stage.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly submitted job.
    pub fn submitted(id: JobId, directory: impl Into<PathBuf>, canonical_name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            directory: directory.into(),
            canonical_name,
            state: JobState::Submitted,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Location of the job's archive: `<directory>/<id>.tar`.
    pub fn archive_path(&self) -> PathBuf {
        archive_path(&self.directory, self.id)
    }
}

/// Derive the archive path for a job id inside `directory`.
pub fn archive_path(directory: &Path, id: JobId) -> PathBuf {
    directory.join(format!("{}.{}", id, ARCHIVE_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_next_walks_forward() {
        let mut trace = vec![JobState::Submitted];
        while let Some(next) = trace.last().and_then(|s| s.next()) {
            trace.push(next);
        }
        assert_eq!(trace, JobState::PIPELINE.to_vec());
    }

    #[test]
    fn test_no_skip_or_reversal_is_allowed() {
        for (i, from) in JobState::PIPELINE.iter().enumerate() {
            for (j, to) in JobState::PIPELINE.iter().enumerate() {
                assert_eq!(
                    from.can_transition_to(*to),
                    j == i + 1,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_failed_only_from_in_flight() {
        for state in JobState::PIPELINE {
            assert_eq!(
                state.can_transition_to(JobState::Failed),
                state.is_in_flight(),
                "{}",
                state
            );
        }
        assert!(JobState::Failed.next().is_none());
        assert!(!JobState::Failed.can_transition_to(JobState::Submitted));
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in JobState::PIPELINE.iter().chain([JobState::Failed].iter()) {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, *state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn test_archive_path_is_derived_from_id() {
        let job = Job::submitted(JobId::new(42), "/tmp/jobs", "train_x".to_string());
        assert_eq!(job.archive_path(), PathBuf::from("/tmp/jobs/42.tar"));
    }
}
