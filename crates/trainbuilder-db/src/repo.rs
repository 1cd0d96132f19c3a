//! Job store trait and implementations.

pub mod job;
pub mod memory;

pub use job::{JobRecord, JobStore, PgJobStore};
pub use memory::MemoryJobStore;
