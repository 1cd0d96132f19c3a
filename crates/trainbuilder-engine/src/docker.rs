//! Docker engine implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PushImageOptions, RemoveImageOptions};
use bytes::Bytes;
use futures::StreamExt;
use std::path::Path;
use tracing::{debug, info};
use trainbuilder_core::engine::{ContainerEngine, ImageHandle, split_reference};
use trainbuilder_core::{Error, Result};

/// Request timeout for the daemon connection. Image builds stream over a
/// single request, so this bounds the longest build.
const REQUEST_TIMEOUT_SECS: u64 = 60 * 60;

/// Name of the build descriptor inside the build context.
const DOCKERFILE: &str = "Dockerfile";

/// Login for the registry images are pushed to.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Docker daemon reached over its unix socket.
pub struct DockerEngine {
    docker: Docker,
    auth: Option<RegistryAuth>,
}

impl DockerEngine {
    /// Connect to the Docker daemon listening on `socket`.
    pub fn connect(socket: &Path) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| Error::Engine(format!("failed to connect to {}: {}", socket.display(), e)))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker, auth: None }
    }

    /// Authenticate pushes with `auth`. Without it, pushes are anonymous.
    pub fn with_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.auth = auth;
        self
    }
}

/// Credentials for pushing `reference`, addressed to the registry host
/// that prefixes it. References without a host go to the default registry.
pub fn registry_credentials(auth: &RegistryAuth, reference: &str) -> DockerCredentials {
    let serveraddress = reference
        .split_once('/')
        .map(|(host, _)| host.to_string());
    DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress,
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::Engine(format!("Docker daemon unreachable: {}", e)))
    }

    async fn build(&self, context: Bytes, reference: &str) -> Result<ImageHandle> {
        let options = BuildImageOptions {
            dockerfile: DOCKERFILE.to_string(),
            t: reference.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!(image = %reference, context_bytes = context.len(), "Building image");
        let mut stream = self.docker.build_image(options, None, Some(context));
        let mut image_id = None;

        while let Some(result) = stream.next().await {
            let info = result
                .map_err(|e| Error::Engine(format!("build of {} failed: {}", reference, e)))?;

            if let Some(message) = info.error {
                return Err(Error::Engine(format!(
                    "build of {} failed: {}",
                    reference, message
                )));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %reference, "{}", line);
                }
            }
            if let Some(aux) = info.aux {
                image_id = aux.id.or(image_id);
            }
        }

        Ok(ImageHandle {
            reference: reference.to_string(),
            image_id,
        })
    }

    async fn push(&self, reference: &str) -> Result<()> {
        let (repository, tag) = split_reference(reference);
        let options = PushImageOptions {
            tag: tag.unwrap_or("latest").to_string(),
        };

        let credentials = self
            .auth
            .as_ref()
            .map(|auth| registry_credentials(auth, reference));

        info!(image = %reference, authenticated = credentials.is_some(), "Pushing image");
        let mut stream = self
            .docker
            .push_image(repository, Some(options), credentials);

        while let Some(result) = stream.next().await {
            let info = result
                .map_err(|e| Error::Engine(format!("push of {} failed: {}", reference, e)))?;

            if let Some(message) = info.error {
                return Err(Error::Engine(format!(
                    "push of {} failed: {}",
                    reference, message
                )));
            }
            if let Some(status) = info.status {
                debug!(image = %reference, status = %status, "Push progress");
            }
        }

        Ok(())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| Error::Engine(format!("failed to remove {}: {}", reference, e)))?;

        Ok(())
    }
}
