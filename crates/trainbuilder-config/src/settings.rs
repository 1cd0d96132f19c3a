//! Service settings.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

pub const ENV_REGISTRY: &str = "URI_DOCKER_REGISTRY";
pub const ENV_JOBS_DIR: &str = "TRAINBUILDER_JOBS_DIR";
pub const ENV_DOCKERFILE: &str = "TRAINBUILDER_DOCKERFILE";
pub const ENV_DOCKER_SOCKET: &str = "DOCKER_SOCKET";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_LISTEN: &str = "TRAINBUILDER_LISTEN";
pub const ENV_REGISTRY_USERNAME: &str = "TRAINBUILDER_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "TRAINBUILDER_REGISTRY_PASSWORD";

const DEFAULT_JOBS_DIR: &str = "/tmp/jobs";
const DEFAULT_DOCKERFILE: &str = "instance/Dockerfile";
const DEFAULT_DOCKER_SOCKET: &str = "/run/docker.sock";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_TAG: &str = "immediate";

// Docker tag grammar
static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap());

/// Fully resolved settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Registry address images are pushed to (e.g. `registry.local:5000`).
    pub registry: String,
    /// Login for the registry. `None` pushes anonymously.
    pub credentials: Option<RegistryCredentials>,
    /// Directory train archives are stored in.
    pub jobs_dir: PathBuf,
    /// Build descriptor inserted into every archive.
    pub dockerfile: PathBuf,
    /// Docker daemon unix socket.
    pub docker_socket: PathBuf,
    /// PostgreSQL URL. `None` selects the in-process job store.
    pub database_url: Option<String>,
    /// Intake listen address.
    pub listen: SocketAddr,
    pub scheduler: SchedulerSettings,
    pub publish: PublishSettings,
}

/// Registry login. The password is never printed or serialized.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Interval between scheduler sweeps.
    pub tick: Duration,
    /// Processor attempts per stage before a job is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub retry_backoff: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    pub tag_policy: TagPolicy,
    /// Remove the local image after a successful push.
    pub remove_local_image: bool,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            tag_policy: TagPolicy::Fixed(DEFAULT_TAG.to_string()),
            remove_local_image: true,
        }
    }
}

/// How published images are tagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagPolicy {
    /// Every image gets the same literal tag. Jobs sharing a train name
    /// overwrite each other's tag in the registry.
    Fixed(String),
    /// Tag `job-<id>`, unique per job.
    JobId,
}

impl TagPolicy {
    /// Resolve the tag for a job id.
    pub fn tag_for(&self, job_id: i64) -> String {
        match self {
            TagPolicy::Fixed(tag) => tag.clone(),
            TagPolicy::JobId => format!("job-{}", job_id),
        }
    }
}

/// Settings as read from a file, before defaults and env overrides.
#[derive(Debug, Clone, Default)]
struct PartialSettings {
    registry: Option<String>,
    registry_username: Option<String>,
    registry_password: Option<String>,
    jobs_dir: Option<String>,
    dockerfile: Option<String>,
    docker_socket: Option<String>,
    database_url: Option<String>,
    listen: Option<String>,
    tick_ms: Option<u64>,
    max_attempts: Option<u64>,
    retry_backoff_ms: Option<u64>,
    tag_policy: Option<String>,
    tag: Option<String>,
    remove_local_image: Option<bool>,
}

impl Settings {
    /// Resolve settings from optional KDL text and an environment lookup.
    ///
    /// Environment values win over file values.
    pub fn load<F>(kdl: Option<&str>, env: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut partial = match kdl {
            Some(text) => parse_settings(text)?,
            None => PartialSettings::default(),
        };

        let overrides = [
            (ENV_REGISTRY, &mut partial.registry),
            (ENV_REGISTRY_USERNAME, &mut partial.registry_username),
            (ENV_REGISTRY_PASSWORD, &mut partial.registry_password),
            (ENV_JOBS_DIR, &mut partial.jobs_dir),
            (ENV_DOCKERFILE, &mut partial.dockerfile),
            (ENV_DOCKER_SOCKET, &mut partial.docker_socket),
            (ENV_DATABASE_URL, &mut partial.database_url),
            (ENV_LISTEN, &mut partial.listen),
        ];
        for (key, slot) in overrides {
            if let Some(value) = env(key).filter(|v| !v.trim().is_empty()) {
                *slot = Some(value);
            }
        }

        resolve(partial)
    }

    /// Resolve settings from an optional file and the process environment.
    pub fn from_file_and_env(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        let text = match path {
            Some(p) => Some(std::fs::read_to_string(p)?),
            None => None,
        };
        Self::load(text.as_deref(), |key| std::env::var(key).ok())
    }
}

fn resolve(partial: PartialSettings) -> ConfigResult<Settings> {
    let registry = partial
        .registry
        .map(|r| r.trim().trim_end_matches('/').to_string())
        .filter(|r| !r.is_empty())
        .ok_or(ConfigError::MissingRegistry)?;

    let credentials = match (partial.registry_username, partial.registry_password) {
        (Some(username), Some(password)) => Some(RegistryCredentials { username, password }),
        (None, None) => None,
        (Some(_), None) => {
            return Err(ConfigError::InvalidValue {
                field: "registry-password".to_string(),
                message: "required when registry-username is set".to_string(),
            });
        }
        (None, Some(_)) => {
            return Err(ConfigError::InvalidValue {
                field: "registry-username".to_string(),
                message: "required when registry-password is set".to_string(),
            });
        }
    };

    let listen_str = partial.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen = listen_str
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidValue {
            field: "listen".to_string(),
            message: format!("{}: {}", listen_str, e),
        })?;

    let mut scheduler = SchedulerSettings::default();
    if let Some(ms) = partial.tick_ms {
        if ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.tick-ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        scheduler.tick = Duration::from_millis(ms);
    }
    if let Some(attempts) = partial.max_attempts {
        scheduler.max_attempts =
            u32::try_from(attempts)
                .ok()
                .filter(|a| *a >= 1)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "scheduler.max-attempts".to_string(),
                    message: format!("expected a value between 1 and {}", u32::MAX),
                })?;
    }
    if let Some(ms) = partial.retry_backoff_ms {
        scheduler.retry_backoff = Duration::from_millis(ms);
    }

    let mut publish = PublishSettings::default();
    let tag = partial.tag.unwrap_or_else(|| DEFAULT_TAG.to_string());
    publish.tag_policy = match partial.tag_policy.as_deref().unwrap_or("fixed") {
        "fixed" => {
            if !TAG_REGEX.is_match(&tag) {
                return Err(ConfigError::InvalidValue {
                    field: "publish.tag".to_string(),
                    message: format!("'{}' is not a valid image tag", tag),
                });
            }
            TagPolicy::Fixed(tag)
        }
        "job-id" => TagPolicy::JobId,
        other => {
            return Err(ConfigError::InvalidValue {
                field: "publish.tag-policy".to_string(),
                message: format!("unknown tag policy: {}", other),
            });
        }
    };
    if let Some(remove) = partial.remove_local_image {
        publish.remove_local_image = remove;
    }

    Ok(Settings {
        registry,
        credentials,
        jobs_dir: PathBuf::from(
            partial
                .jobs_dir
                .unwrap_or_else(|| DEFAULT_JOBS_DIR.to_string()),
        ),
        dockerfile: PathBuf::from(
            partial
                .dockerfile
                .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string()),
        ),
        docker_socket: PathBuf::from(
            partial
                .docker_socket
                .unwrap_or_else(|| DEFAULT_DOCKER_SOCKET.to_string()),
        ),
        database_url: partial.database_url.filter(|u| !u.trim().is_empty()),
        listen,
        scheduler,
        publish,
    })
}

/// Parse settings KDL text.
fn parse_settings(kdl: &str) -> ConfigResult<PartialSettings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut partial = PartialSettings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "registry" => partial.registry = Some(required_string(node, "registry")?),
            "registry-username" => {
                partial.registry_username = Some(required_string(node, "registry-username")?)
            }
            "registry-password" => {
                partial.registry_password = Some(required_string(node, "registry-password")?)
            }
            "jobs-dir" => partial.jobs_dir = Some(required_string(node, "jobs-dir")?),
            "dockerfile" => partial.dockerfile = Some(required_string(node, "dockerfile")?),
            "docker-socket" => {
                partial.docker_socket = Some(required_string(node, "docker-socket")?)
            }
            "database-url" => partial.database_url = Some(required_string(node, "database-url")?),
            "listen" => partial.listen = Some(required_string(node, "listen")?),
            "scheduler" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "tick-ms" => {
                                partial.tick_ms = Some(required_u64(child, "scheduler.tick-ms")?)
                            }
                            "max-attempts" => {
                                partial.max_attempts =
                                    Some(required_u64(child, "scheduler.max-attempts")?)
                            }
                            "retry-backoff-ms" => {
                                partial.retry_backoff_ms =
                                    Some(required_u64(child, "scheduler.retry-backoff-ms")?)
                            }
                            _ => {}
                        }
                    }
                }
            }
            "publish" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "tag-policy" => {
                                partial.tag_policy =
                                    Some(required_string(child, "publish.tag-policy")?)
                            }
                            "tag" => partial.tag = Some(required_string(child, "publish.tag")?),
                            "remove-local-image" => {
                                partial.remove_local_image = Some(
                                    get_first_bool_arg(child).ok_or_else(|| {
                                        ConfigError::InvalidValue {
                                            field: "publish.remove-local-image".to_string(),
                                            message: "expected #true or #false".to_string(),
                                        }
                                    })?,
                                )
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(partial)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn required_u64(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    })
}
