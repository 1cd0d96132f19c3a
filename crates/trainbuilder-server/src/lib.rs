//! HTTP intake for the train builder.
//!
//! Accepts train archives over multipart upload and hands them to the
//! pipeline service. Also exposes health endpoints.

pub mod error;
pub mod routes;
pub mod startup;
pub mod state;

pub use state::AppState;
