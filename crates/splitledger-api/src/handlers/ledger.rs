//! Ledger integrity

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use splitledger_ledger::ChainVerification;

use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /api/v1/ledger/verify`
///
/// Walks the whole chain; `409` names the first record that fails.
pub async fn verify_ledger(
    State(state): State<Arc<AppState>>,
) -> ApiResult<(StatusCode, Json<ChainVerification>)> {
    let verification = state.engine.ledger().verify().await?;
    let status = if verification.is_valid() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(verification)))
}
