//! HTTP surface of the dispatch pipeline.
//!
//! Endpoints:
//! - POST /api/messages/template: plan a templated batch send
//! - GET  /api/tasks/{id}: task progress and persisted items
//! - GET  /health

pub mod middleware;
pub mod routes;
pub mod state;
