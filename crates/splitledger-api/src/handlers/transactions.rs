//! Transaction lookups

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use splitledger_db::{AllocationStore, TransactionStore};
use splitledger_types::TransactionId;

use crate::dto::TransactionView;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// `GET /api/v1/transactions/:id`
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransactionView>> {
    let id = TransactionId::parse(&id)
        .map_err(|_| ApiError::InvalidParameter(format!("transaction id {id}")))?;

    let transaction = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("transaction {id}")))?;
    let allocation = state.store.find_allocation_by_transaction(&id).await?;

    Ok(Json(TransactionView {
        amount: transaction.amount().to_string(),
        transaction,
        allocation,
    }))
}
