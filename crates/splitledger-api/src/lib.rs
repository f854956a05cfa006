//! SplitLedger HTTP API
//!
//! # Routes
//!
//! ```text
//! POST /webhooks/payments            - signed processor webhook (raw body)
//! GET  /health                       - liveness
//! GET  /ready                        - store reachable, secret configured
//! /api/v1/
//! ├── GET /transactions/:id
//! ├── GET /allocations?status=failed - manual intervention queue
//! ├── GET /allocations/:id
//! └── GET /ledger/verify             - 200 valid, 409 broken
//! ```

pub mod dto;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::Router;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Default processor signature header (Square)
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

/// API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Enable CORS for browser clients of the operator endpoints
    pub enable_cors: bool,
    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
    /// Enable response compression
    pub enable_compression: bool,
    /// Enable request tracing
    pub enable_tracing: bool,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable_cors: false,
            cors_origins: Vec::new(),
            enable_compression: true,
            enable_tracing: true,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// Create the main router with all middleware
pub fn create_router(state: Arc<AppState>, config: ApiConfig) -> Router {
    let mut router = Router::new()
        .nest("/webhooks", routes::webhook_routes())
        .nest("/api/v1", routes::api_v1_routes())
        .route("/health", axum::routing::get(handlers::health::health_check))
        .route("/ready", axum::routing::get(handlers::health::readiness_check))
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .with_state(state);

    let x_request_id = HeaderName::from_static("x-request-id");
    router = router
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id));

    if config.enable_tracing {
        router = router.layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");

                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        );
    }

    if config.enable_compression {
        router = router.layer(CompressionLayer::new());
    }

    if config.enable_cors {
        let cors = if config.cors_origins.iter().any(|o| o == "*") {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
                .allow_origin(
                    config
                        .cors_origins
                        .iter()
                        .filter_map(|o| o.parse().ok())
                        .collect::<Vec<_>>(),
                )
                .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
                .allow_headers(Any)
        };
        router = router.layer(cors);
    }

    router
}

/// Router without middleware, for tests
pub fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/webhooks", routes::webhook_routes())
        .nest("/api/v1", routes::api_v1_routes())
        .route("/health", axum::routing::get(handlers::health::health_check))
        .route("/ready", axum::routing::get(handlers::health::readiness_check))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert!(!config.enable_cors);
        assert!(config.enable_tracing);
        assert_eq!(config.max_body_size, 1024 * 1024);
    }
}
