//! API Routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::state::AppState;

/// Processor webhook ingress
pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/payments", post(handlers::webhook::receive_payment_webhook))
}

/// Operator read endpoints
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .route("/allocations", get(handlers::allocations::list_allocations))
        .route("/allocations/:id", get(handlers::allocations::get_allocation))
        .route("/ledger/verify", get(handlers::ledger::verify_ledger))
}
