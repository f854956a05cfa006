//! Health Check Handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use splitledger_db::TransactionStore;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub store: ComponentStatus,
    pub webhook_secret: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    /// healthy / unhealthy
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentStatus {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: "healthy".to_string(),
            error: None,
        }
    }

    fn unhealthy(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: "unhealthy".to_string(),
            error: Some(error.into()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// Liveness: the process is serving requests
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}

/// Readiness: the store answers and webhooks can be verified
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let store = match state.store.ping().await {
        Ok(()) => ComponentStatus::healthy("store"),
        Err(e) => ComponentStatus::unhealthy("store", e.to_string()),
    };

    let webhook_secret = if state.verifier.has_secret() {
        ComponentStatus::healthy("webhook_secret")
    } else {
        ComponentStatus::unhealthy("webhook_secret", "signing secret not configured")
    };

    let ready = store.is_healthy() && webhook_secret.is_healthy();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            store,
            webhook_secret,
        }),
    )
}
