//! Container engine backends for the train builder.
//!
//! Provides the Docker engine used to build, push and remove train images.

pub mod docker;

pub use docker::{DockerEngine, RegistryAuth};
pub use trainbuilder_core::engine::{ContainerEngine, ImageHandle, image_reference};
