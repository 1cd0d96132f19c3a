//! Image publication.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};
use trainbuilder_config::TagPolicy;
use trainbuilder_core::engine::{ContainerEngine, image_reference};
use trainbuilder_core::processor::StageProcessor;
use trainbuilder_core::{Error, Job, Result};

/// Builds an image from a job's augmented archive and pushes it to the
/// registry.
pub struct ImagePublisher {
    engine: Arc<dyn ContainerEngine>,
    registry: String,
    tag_policy: TagPolicy,
    remove_local_image: bool,
}

impl ImagePublisher {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: impl Into<String>,
        tag_policy: TagPolicy,
        remove_local_image: bool,
    ) -> Self {
        Self {
            engine,
            registry: registry.into(),
            tag_policy,
            remove_local_image,
        }
    }

    /// Image reference a job is published under.
    ///
    /// With a fixed tag policy, jobs sharing a train name resolve to the same
    /// reference and the later push overwrites the earlier one.
    pub fn reference_for(&self, job: &Job) -> String {
        image_reference(
            &self.registry,
            &job.canonical_name,
            &self.tag_policy.tag_for(job.id.get()),
        )
    }
}

#[async_trait]
impl StageProcessor for ImagePublisher {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let reference = self.reference_for(job);
        let archive = job.archive_path();

        let context = tokio::fs::read(&archive).await.map_err(|e| {
            Error::Archive(format!(
                "cannot read build context {}: {}",
                archive.display(),
                e
            ))
        })?;

        info!(job_id = %job.id, image = %reference, "Publishing train image");
        let handle = self.engine.build(Bytes::from(context), &reference).await?;
        self.engine.push(&reference).await?;

        if self.remove_local_image {
            if let Err(e) = self.engine.remove(&reference).await {
                warn!(job_id = %job.id, image = %reference, error = %e, "Failed to remove local image");
            }
        }

        info!(
            job_id = %job.id,
            image = %reference,
            image_id = ?handle.image_id,
            "Push successful"
        );
        Ok(())
    }
}
