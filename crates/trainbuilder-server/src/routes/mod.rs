//! API routes.

pub mod health;
pub mod trains;

use crate::AppState;
use axum::Router;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(trains::router())
        .merge(health::router())
        .with_state(state)
}
