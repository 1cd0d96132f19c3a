//! Pipeline service.
//!
//! Owns everything a running train builder shares: the job store, the
//! container engine, resolved settings and the scheduler wake-up signal.
//! Intake and the scheduler both go through it.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use trainbuilder_config::Settings;
use trainbuilder_core::engine::ContainerEngine;
use trainbuilder_core::{Job, JobState, Result};
use trainbuilder_db::JobStore;

use crate::augment::DockerfileAugmenter;
use crate::publish::ImagePublisher;
use crate::scheduler::{RetryPolicy, StageRule, StageScheduler};

/// Error recorded on jobs that were in flight when the service stopped.
pub const RESTART_REASON: &str = "interrupted by restart";

pub struct PipelineService {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ContainerEngine>,
    settings: Settings,
    wake: Arc<Notify>,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn ContainerEngine>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            engine,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Signal that wakes the scheduler ahead of its next interval tick.
    pub fn notifier(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Create the jobs directory if needed.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.jobs_dir).await?;
        Ok(())
    }

    /// Move jobs left in flight by a previous run to `Failed`.
    ///
    /// Their archives may be half processed, so they are not resumed.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self.store.recover_in_flight(RESTART_REASON).await?;
        if recovered > 0 {
            warn!(count = recovered, "Failed jobs interrupted by restart");
        }
        Ok(recovered)
    }

    /// Accept a train archive.
    ///
    /// Creates the job, writes the bytes to the job's archive path and syncs
    /// them, then hands the job to the pipeline and wakes the scheduler.
    pub async fn submit(&self, raw_filename: &str, bytes: &[u8]) -> Result<Job> {
        let mut job = self
            .store
            .create_job(raw_filename, &self.settings.jobs_dir)
            .await?;
        let path = job.archive_path();

        if let Err(e) = write_synced(&path, bytes).await {
            error!(job_id = %job.id, path = %path.display(), error = %e, "Failed to save archive");
            let _ = tokio::fs::remove_file(&path).await;
            // The record stays in Submitted and never enters the pipeline
            let detail = format!("archive could not be saved: {}", e);
            if let Err(store_err) = self.store.record_failed_attempt(&mut job, &detail).await {
                warn!(job_id = %job.id, error = %store_err, "Failed to record save error");
            }
            return Err(e);
        }

        self.store.advance(&mut job, JobState::ArchiveSaved).await?;
        info!(
            job_id = %job.id,
            train = %job.canonical_name,
            bytes = bytes.len(),
            "Train archive saved"
        );

        self.wake.notify_one();
        Ok(job)
    }

    /// The default two-stage pipeline: augment, then publish.
    pub fn rules(&self) -> Result<Vec<StageRule>> {
        let augmenter = Arc::new(DockerfileAugmenter::new(&self.settings.dockerfile));
        let publisher = Arc::new(ImagePublisher::new(
            self.engine.clone(),
            self.settings.registry.clone(),
            self.settings.publish.tag_policy.clone(),
            self.settings.publish.remove_local_image,
        ));

        Ok(vec![
            StageRule::new(
                JobState::ArchiveSaved,
                JobState::AugmentInProgress,
                JobState::AugmentDone,
                augmenter,
            )?,
            StageRule::new(
                JobState::AugmentDone,
                JobState::PublishInProgress,
                JobState::PublishDone,
                publisher,
            )?,
        ])
    }

    /// Build the scheduler for this service's pipeline.
    pub fn scheduler(&self) -> Result<StageScheduler> {
        Ok(StageScheduler::new(self.store.clone(), self.rules()?)
            .with_retry(RetryPolicy::from(&self.settings.scheduler))
            .with_tick(self.settings.scheduler.tick)
            .with_wake(self.wake.clone()))
    }
}

async fn write_synced(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
