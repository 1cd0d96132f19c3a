//! Fakes shared by the crate's tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Mutex;
use trainbuilder_core::engine::{ContainerEngine, ImageHandle};
use trainbuilder_core::processor::StageProcessor;
use trainbuilder_core::{Error, Job, JobId, JobState, Result};
use trainbuilder_db::{DbError, DbResult, JobStore, MemoryJobStore};

/// Succeeds on every job and remembers what it saw.
pub struct RecordingProcessor {
    name: &'static str,
    seen: Mutex<Vec<(JobId, JobState)>>,
}

impl RecordingProcessor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<JobId> {
        self.seen.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn states(&self) -> Vec<JobState> {
        self.seen.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl StageProcessor for RecordingProcessor {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(&self, job: &Job) -> Result<()> {
        self.seen.lock().unwrap().push((job.id, job.state));
        Ok(())
    }
}

/// Fails the first `failures` calls, or every call for one job.
pub struct FlakyProcessor {
    name: &'static str,
    failures: u32,
    doomed: Option<JobId>,
    calls: Mutex<u32>,
}

impl FlakyProcessor {
    pub fn new(name: &'static str, failures: u32) -> Self {
        Self {
            name,
            failures,
            doomed: None,
            calls: Mutex::new(0),
        }
    }

    pub fn failing_for(name: &'static str, job: JobId) -> Self {
        Self {
            name,
            failures: 0,
            doomed: Some(job),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl StageProcessor for FlakyProcessor {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if self.doomed == Some(job.id) || attempt <= self.failures {
            return Err(Error::Internal(format!("simulated failure on attempt {}", attempt)));
        }
        Ok(())
    }
}

/// Engine call, as seen by [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build { reference: String, context: Bytes },
    Push(String),
    Remove(String),
}

/// Container engine that records calls instead of talking to a daemon.
#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    fail_push: bool,
    fail_remove: bool,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_push() -> Self {
        Self {
            fail_push: true,
            ..Self::default()
        }
    }

    pub fn failing_remove() -> Self {
        Self {
            fail_remove: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Push(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn builds(&self) -> Vec<(String, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Build { reference, context } => Some((reference, context)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerEngine for RecordingEngine {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn build(&self, context: Bytes, reference: &str) -> Result<ImageHandle> {
        self.calls.lock().unwrap().push(EngineCall::Build {
            reference: reference.to_string(),
            context,
        });
        Ok(ImageHandle {
            reference: reference.to_string(),
            image_id: Some("sha256:feed".to_string()),
        })
    }

    async fn push(&self, reference: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Push(reference.to_string()));
        if self.fail_push {
            return Err(Error::Engine("registry refused push".to_string()));
        }
        Ok(())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Remove(reference.to_string()));
        if self.fail_remove {
            return Err(Error::Engine("image in use".to_string()));
        }
        Ok(())
    }
}

/// In-memory store whose `advance` into one state fails a set number of times.
pub struct FlakyStore {
    inner: MemoryJobStore,
    target: JobState,
    failures: Mutex<u32>,
}

impl FlakyStore {
    pub fn failing_advance(target: JobState, failures: u32) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            target,
            failures: Mutex::new(failures),
        }
    }

    pub fn inner(&self) -> &MemoryJobStore {
        &self.inner
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, raw_name: &str, directory: &Path) -> DbResult<Job> {
        self.inner.create_job(raw_name, directory).await
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.inner.get(id).await
    }

    async fn find_first(&self, state: JobState) -> DbResult<Option<Job>> {
        self.inner.find_first(state).await
    }

    async fn advance(&self, job: &mut Job, new_state: JobState) -> DbResult<()> {
        if new_state == self.target {
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(DbError::Conflict("connection reset".to_string()));
            }
        }
        self.inner.advance(job, new_state).await
    }

    async fn claim(&self, from: JobState, in_flight: JobState) -> DbResult<Option<Job>> {
        self.inner.claim(from, in_flight).await
    }

    async fn record_failed_attempt(&self, job: &mut Job, error: &str) -> DbResult<()> {
        self.inner.record_failed_attempt(job, error).await
    }

    async fn fail(&self, job: &mut Job, error: &str) -> DbResult<()> {
        self.inner.fail(job, error).await
    }

    async fn list_by_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        self.inner.list_by_state(state).await
    }

    async fn recover_in_flight(&self, reason: &str) -> DbResult<u64> {
        self.inner.recover_in_flight(reason).await
    }

    async fn ping(&self) -> DbResult<()> {
        self.inner.ping().await
    }
}
