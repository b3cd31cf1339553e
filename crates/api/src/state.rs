//! Shared application state for the Axum API server.

use herald_engine::service::TaskService;

/// Application state shared across all route handlers via Axum `State`.
///
/// Handlers only talk to the pipeline through `TaskService`, so the same
/// router runs against Postgres/Redis or the in-memory backends.
#[derive(Clone)]
pub struct AppState {
    pub service: TaskService,
}

impl AppState {
    pub fn new(service: TaskService) -> Self {
        Self { service }
    }
}
