//! Train job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use trainbuilder_core::{Job, JobId, JobState, normalize};

use crate::{DbError, DbResult};

/// A train job row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub directory: String,
    pub canonical_name: String,
    pub state: String,
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> DbResult<Self> {
        let state = record
            .state
            .parse::<JobState>()
            .map_err(|e| DbError::Corrupt(format!("job {}: {}", record.id, e)))?;
        Ok(Job {
            id: JobId::new(record.id),
            directory: PathBuf::from(record.directory),
            canonical_name: record.canonical_name,
            state,
            error: record.error,
            attempts: u32::try_from(record.attempts).unwrap_or(0),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Persistent record of every submitted job and its pipeline state.
///
/// Every mutating call is durable before it returns and is guarded by the
/// state the caller last observed, so two callers can never move the same
/// job out of the same state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Normalize `raw_name` and persist a new job in `Submitted`.
    async fn create_job(&self, raw_name: &str, directory: &Path) -> DbResult<Job>;

    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// The oldest job (smallest id) in `state`.
    async fn find_first(&self, state: JobState) -> DbResult<Option<Job>>;

    /// Move `job` to `new_state`. Fails with `Conflict` if the stored state no
    /// longer matches `job.state`, and with `InvalidTransition` if the step is
    /// not a single forward move. On success `job` is refreshed.
    async fn advance(&self, job: &mut Job, new_state: JobState) -> DbResult<()>;

    /// Atomically select the oldest job in `from` and move it to `in_flight`.
    /// Resets the attempt counter and error detail of the claimed job.
    async fn claim(&self, from: JobState, in_flight: JobState) -> DbResult<Option<Job>>;

    /// Record a failed processor attempt without changing the state.
    async fn record_failed_attempt(&self, job: &mut Job, error: &str) -> DbResult<()>;

    /// Move an in-flight job to `Failed` with `error` as detail.
    async fn fail(&self, job: &mut Job, error: &str) -> DbResult<()>;

    /// All jobs in `state`, oldest first.
    async fn list_by_state(&self, state: JobState) -> DbResult<Vec<Job>>;

    /// Fail every job left in an in-flight state. Returns how many were moved.
    async fn recover_in_flight(&self, reason: &str) -> DbResult<u64>;

    /// Check that the store is reachable.
    async fn ping(&self) -> DbResult<()>;
}

pub(crate) fn check_transition(from: JobState, to: JobState) -> DbResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DbError::InvalidTransition { from, to })
    }
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update matched no row.
    async fn guard_failure(&self, job: &Job) -> DbError {
        match self.get(job.id).await {
            Ok(current) => DbError::Conflict(format!(
                "job {} is {}, expected {}",
                job.id, current.state, job.state
            )),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, raw_name: &str, directory: &Path) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO train_jobs (directory, canonical_name, state, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 0, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(directory.to_string_lossy().into_owned())
        .bind(normalize(raw_name))
        .bind(JobState::Submitted.as_str())
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM train_jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.try_into()
    }

    async fn find_first(&self, state: JobState) -> DbResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM train_jobs WHERE state = $1 ORDER BY id ASC LIMIT 1",
        )
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record.map(Job::try_from).transpose()
    }

    async fn advance(&self, job: &mut Job, new_state: JobState) -> DbResult<()> {
        check_transition(job.state, new_state)?;

        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE train_jobs SET state = $3, updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(job.id.get())
        .bind(job.state.as_str())
        .bind(new_state.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => {
                *job = record.try_into()?;
                Ok(())
            }
            None => Err(self.guard_failure(job).await),
        }
    }

    async fn claim(&self, from: JobState, in_flight: JobState) -> DbResult<Option<Job>> {
        check_transition(from, in_flight)?;

        // SKIP LOCKED keeps concurrent claimers from picking the same row
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE train_jobs
            SET state = $2, attempts = 0, error = NULL, updated_at = NOW()
            WHERE id = (
                SELECT id FROM train_jobs
                WHERE state = $1
                ORDER BY id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(from.as_str())
        .bind(in_flight.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record.map(Job::try_from).transpose()
    }

    async fn record_failed_attempt(&self, job: &mut Job, error: &str) -> DbResult<()> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE train_jobs SET attempts = attempts + 1, error = $3, updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(job.id.get())
        .bind(job.state.as_str())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => {
                *job = record.try_into()?;
                Ok(())
            }
            None => Err(self.guard_failure(job).await),
        }
    }

    async fn fail(&self, job: &mut Job, error: &str) -> DbResult<()> {
        check_transition(job.state, JobState::Failed)?;

        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE train_jobs SET state = $3, error = $4, updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(job.id.get())
        .bind(job.state.as_str())
        .bind(JobState::Failed.as_str())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => {
                *job = record.try_into()?;
                Ok(())
            }
            None => Err(self.guard_failure(job).await),
        }
    }

    async fn list_by_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM train_jobs WHERE state = $1 ORDER BY id ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn recover_in_flight(&self, reason: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE train_jobs SET state = $1, error = $2, updated_at = NOW()
            WHERE state = $3 OR state = $4
            "#,
        )
        .bind(JobState::Failed.as_str())
        .bind(reason)
        .bind(JobState::AugmentInProgress.as_str())
        .bind(JobState::PublishInProgress.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
