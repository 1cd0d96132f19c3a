//! Stage scheduling and processing for the train builder.
//!
//! Drives train jobs through the pipeline: the Dockerfile augmenter, the
//! image publisher, and the tick-driven scheduler that claims one job per
//! stage at a time.

pub mod augment;
pub mod publish;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;

pub use augment::DockerfileAugmenter;
pub use publish::ImagePublisher;
pub use scheduler::{RetryPolicy, RuleReport, StageOutcome, StageRule, StageScheduler, TickReport};
pub use service::PipelineService;
