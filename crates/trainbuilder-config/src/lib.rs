//! KDL configuration parsing for the train builder.
//!
//! Settings come from an optional KDL file, overridden by environment
//! variables. The registry address is the only value without a default.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    PublishSettings, RegistryCredentials, SchedulerSettings, Settings, TagPolicy,
};
