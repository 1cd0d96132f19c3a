//! In-process job store.
//!
//! Jobs live only as long as the process. Each operation runs inside one
//! critical section, which gives `claim` and the guarded updates the same
//! atomicity the PostgreSQL store gets from row locks.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::Mutex;
use trainbuilder_core::{Job, JobId, JobState, normalize};

use super::job::{JobStore, check_transition};
use crate::{DbError, DbResult};

#[derive(Debug, Default)]
struct Inner {
    last_id: i64,
    // Keyed by id, so iteration order is oldest first
    jobs: BTreeMap<JobId, Job>,
}

impl Inner {
    /// Look up the stored copy of `job`, requiring its state to still match.
    fn guarded(&mut self, job: &Job) -> DbResult<&mut Job> {
        let stored = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;
        if stored.state != job.state {
            return Err(DbError::Conflict(format!(
                "job {} is {}, expected {}",
                job.id, stored.state, job.state
            )));
        }
        Ok(stored)
    }
}

/// In-memory implementation of JobStore.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, raw_name: &str, directory: &Path) -> DbResult<Job> {
        let mut inner = self.inner.lock().await;
        inner.last_id += 1;
        let job = Job::submitted(JobId::new(inner.last_id), directory, normalize(raw_name));
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn find_first(&self, state: JobState) -> DbResult<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.values().find(|j| j.state == state).cloned())
    }

    async fn advance(&self, job: &mut Job, new_state: JobState) -> DbResult<()> {
        check_transition(job.state, new_state)?;

        let mut inner = self.inner.lock().await;
        let stored = inner.guarded(job)?;
        stored.state = new_state;
        stored.updated_at = Utc::now();
        *job = stored.clone();
        Ok(())
    }

    async fn claim(&self, from: JobState, in_flight: JobState) -> DbResult<Option<Job>> {
        check_transition(from, in_flight)?;

        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.jobs.values_mut().find(|j| j.state == from) else {
            return Ok(None);
        };
        stored.state = in_flight;
        stored.attempts = 0;
        stored.error = None;
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn record_failed_attempt(&self, job: &mut Job, error: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.guarded(job)?;
        stored.attempts += 1;
        stored.error = Some(error.to_string());
        stored.updated_at = Utc::now();
        *job = stored.clone();
        Ok(())
    }

    async fn fail(&self, job: &mut Job, error: &str) -> DbResult<()> {
        check_transition(job.state, JobState::Failed)?;

        let mut inner = self.inner.lock().await;
        let stored = inner.guarded(job)?;
        stored.state = JobState::Failed;
        stored.error = Some(error.to_string());
        stored.updated_at = Utc::now();
        *job = stored.clone();
        Ok(())
    }

    async fn list_by_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect())
    }

    async fn recover_in_flight(&self, reason: &str) -> DbResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut recovered = 0;
        for job in inner.jobs.values_mut().filter(|j| j.state.is_in_flight()) {
            job.state = JobState::Failed;
            job.error = Some(reason.to_string());
            job.updated_at = now;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}
