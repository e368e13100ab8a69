//! Send routes.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_engine::planner::{SendReceipt, SendRequest};

use crate::middleware::account::RequestAccount;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/messages/template", post(send_template))
}

/// POST /api/messages/template: plan a templated batch send.
///
/// The receipt reflects publish-time acceptance; delivery results arrive
/// through the account's callback.
async fn send_template(
    State(state): State<AppState>,
    RequestAccount(account): RequestAccount,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendReceipt>, AppError> {
    let receipt = state.planner.plan(&account, request).await?;
    Ok(Json(receipt))
}
