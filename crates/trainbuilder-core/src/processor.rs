//! Stage processor trait.

use async_trait::async_trait;

use crate::{Job, Result};

/// Work performed on a job while it sits in a stage's in-flight state.
///
/// A processor must not touch the job store; the scheduler owns every
/// state transition.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Process the job. An error leaves the transition decision to the caller.
    async fn process(&self, job: &Job) -> Result<()>;
}
