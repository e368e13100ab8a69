//! Resolves the sending account of a request.
//!
//! Callers name their account with the `X-Account-Id` header. Verifying that
//! they may act as that account is left to whatever sits in front of this
//! service.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::Account;

use crate::state::AppState;

pub const ACCOUNT_HEADER: &str = "x-account-id";

/// The account a request acts for.
///
/// ```ignore
/// async fn handler(RequestAccount(account): RequestAccount) -> impl IntoResponse {
///     // account.app_id, account.callback_url, ...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequestAccount(pub Account);

fn parse_account_id(parts: &Parts) -> Result<Uuid, AppError> {
    let raw = parts
        .headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::validation("Missing X-Account-Id header"))?;

    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::validation("X-Account-Id must be a UUID"))
}

impl FromRequestParts<AppState> for RequestAccount {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let account_id = parse_account_id(parts);
        let store = state.store.clone();

        async move {
            let account_id = account_id?;
            let account = store
                .find_account(account_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Account {} not found", account_id)))?;
            Ok(RequestAccount(account))
        }
    }
}
