//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_engine::planner::DispatchPlanner;
use herald_engine::store::DispatchStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DispatchStore>,
    pub planner: Arc<DispatchPlanner>,
}

impl AppState {
    pub fn new(store: Arc<dyn DispatchStore>, planner: Arc<DispatchPlanner>) -> Self {
        Self { store, planner }
    }
}
