//! Container engine abstraction.
//!
//! The engine performs the actual image build, push and removal. The
//! pipeline only hands it a build context and an image reference.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Handle to an image produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    /// Full image reference, `<registry>/<repository>:<tag>`.
    pub reference: String,
    /// Engine-assigned image id, when the engine reports one.
    pub image_id: Option<String>,
}

/// Build the image reference `<registry>/<repository>:<tag>`.
pub fn image_reference(registry: &str, repository: &str, tag: &str) -> String {
    format!("{}/{}:{}", registry.trim_end_matches('/'), repository, tag)
}

/// Split an image reference into repository and tag.
///
/// The tag separator is the last `:` after the last `/`, so registry ports
/// (`host:5000/name`) are left alone.
pub fn split_reference(reference: &str) -> (&str, Option<&str>) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            Some(&reference[name_start + i + 1..]),
        ),
        None => (reference, None),
    }
}

/// Trait for container engines.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Name of this engine.
    fn name(&self) -> &'static str;

    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Build an image from a tar build context and tag it with `reference`.
    async fn build(&self, context: Bytes, reference: &str) -> Result<ImageHandle>;

    /// Push a previously built image to its registry.
    async fn push(&self, reference: &str) -> Result<()>;

    /// Remove a local image.
    async fn remove(&self, reference: &str) -> Result<()>;
}
