//! Service bootstrap.
//!
//! Every fatal startup condition maps to its own process exit code so that
//! supervisors can tell a missing Docker daemon from a bad configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use trainbuilder_config::{ConfigError, Settings};
use trainbuilder_core::engine::ContainerEngine;
use trainbuilder_db::{JobStore, MemoryJobStore, PgJobStore, create_pool, run_migrations};
use trainbuilder_engine::{DockerEngine, RegistryAuth};

pub const EXIT_DOCKER: u8 = 1;
pub const EXIT_REGISTRY: u8 = 2;
pub const EXIT_CONFIG: u8 = 3;
pub const EXIT_STORE: u8 = 4;
pub const EXIT_RUNTIME: u8 = 5;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("No Docker socket found at {}", .0.display())]
    DockerSocketMissing(PathBuf),

    #[error("Docker daemon at {} is unreachable: {message}", .socket.display())]
    DockerUnreachable { socket: PathBuf, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job store unavailable: {0}")]
    Store(String),
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::DockerSocketMissing(_) | StartupError::DockerUnreachable { .. } => {
                EXIT_DOCKER
            }
            StartupError::Config(ConfigError::MissingRegistry) => EXIT_REGISTRY,
            StartupError::Config(_) => EXIT_CONFIG,
            StartupError::Store(_) => EXIT_STORE,
        }
    }
}

/// Load settings from the optional config file and the environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, StartupError> {
    Ok(Settings::from_file_and_env(path)?)
}

/// Connect to the configured Docker daemon and make sure it answers.
pub async fn connect_engine(settings: &Settings) -> Result<Arc<dyn ContainerEngine>, StartupError> {
    let socket = settings.docker_socket.as_path();
    if !socket.exists() {
        return Err(StartupError::DockerSocketMissing(socket.to_path_buf()));
    }

    let unreachable = |e: trainbuilder_core::Error| StartupError::DockerUnreachable {
        socket: socket.to_path_buf(),
        message: e.to_string(),
    };
    let auth = registry_auth(settings);
    let authenticated = auth.is_some();
    let engine = DockerEngine::connect(socket)
        .map_err(unreachable)?
        .with_auth(auth);
    engine.ping().await.map_err(unreachable)?;

    info!(socket = %socket.display(), authenticated, "Connected to Docker daemon");
    Ok(Arc::new(engine))
}

/// Push credentials for the engine, if any are configured.
pub fn registry_auth(settings: &Settings) -> Option<RegistryAuth> {
    settings.credentials.as_ref().map(|c| RegistryAuth {
        username: c.username.clone(),
        password: c.password.clone(),
    })
}

/// Open the job store: PostgreSQL when a database URL is configured and
/// `in_memory` is not forced, the in-process store otherwise.
pub async fn open_store(
    settings: &Settings,
    in_memory: bool,
) -> Result<Arc<dyn JobStore>, StartupError> {
    let url = match &settings.database_url {
        Some(url) if !in_memory => url,
        _ => {
            info!("Using in-memory job store; jobs will not survive a restart");
            return Ok(Arc::new(MemoryJobStore::new()));
        }
    };

    info!("Connecting to database...");
    let pool = create_pool(url)
        .await
        .map_err(|e| StartupError::Store(e.to_string()))?;
    run_migrations(&pool)
        .await
        .map_err(|e| StartupError::Store(e.to_string()))?;
    info!("Database connected");

    Ok(Arc::new(PgJobStore::new(pool)))
}
