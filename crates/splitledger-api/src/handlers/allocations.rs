//! Allocation lookups

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use splitledger_db::AllocationStore;
use splitledger_types::{AllocationId, AllocationStatus, ProfitAllocation};

use crate::dto::{AllocationList, ListAllocationsQuery};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// `GET /api/v1/allocations/:id`
pub async fn get_allocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProfitAllocation>> {
    let id = AllocationId::parse(&id)
        .map_err(|_| ApiError::InvalidParameter(format!("allocation id {id}")))?;

    state
        .store
        .get_allocation(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("allocation {id}")))
}

/// `GET /api/v1/allocations?status=failed&limit=100`
///
/// With the default `failed` filter this is the list of allocations that
/// exhausted their retries and need manual intervention.
pub async fn list_allocations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListAllocationsQuery>,
) -> ApiResult<Json<AllocationList>> {
    let status = match query.status.as_deref() {
        Some(raw) => raw
            .parse::<AllocationStatus>()
            .map_err(|_| ApiError::InvalidParameter(format!("status {raw}")))?,
        None => AllocationStatus::Failed,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let data = state.store.list_allocations_by_status(status, limit).await?;
    Ok(Json(AllocationList {
        count: data.len(),
        data,
    }))
}
