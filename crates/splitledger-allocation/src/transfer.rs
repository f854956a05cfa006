//! Transfer sinks
//!
//! The payout side of an allocation is an opaque collaborator: it receives
//! one request per beneficiary share and answers with an external
//! reference. The correlation id is stable across attempts so a sink can
//! deduplicate a request it already executed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use splitledger_types::{AllocationId, Currency};

/// One payout instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub amount_minor: i64,
    pub currency: Currency,
    pub beneficiary_account: String,
    pub correlation_id: String,
}

impl TransferRequest {
    /// Correlation id for a share of an allocation
    pub fn correlation_id(allocation_id: &AllocationId, beneficiary: &str) -> String {
        format!("{}:{}", allocation_id, beneficiary)
    }
}

/// Sink acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// External transfer reference
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("payout endpoint rejected transfer with status {status}")]
    Rejected { status: u16 },

    #[error("payout endpoint unreachable: {0}")]
    Network(String),

    #[error("invalid payout response: {0}")]
    InvalidResponse(String),
}

impl TransferError {
    pub fn timeout(after: Duration) -> Self {
        TransferError::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }
}

/// Executes payouts
#[async_trait]
pub trait TransferSink: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError>;
}

// ============================================================================
// Logging sink
// ============================================================================

/// Development sink: logs each payout and hands back a generated reference.
///
/// Requests already seen (same correlation id) return the original reference.
#[derive(Clone, Default)]
pub struct LoggingTransferSink {
    executed: Arc<RwLock<Vec<(TransferRequest, String)>>>,
}

impl LoggingTransferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every distinct transfer executed so far
    pub async fn executed(&self) -> Vec<(TransferRequest, String)> {
        self.executed.read().await.clone()
    }
}

#[async_trait]
impl TransferSink for LoggingTransferSink {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let mut executed = self.executed.write().await;

        if let Some((_, reference)) = executed
            .iter()
            .find(|(r, _)| r.correlation_id == request.correlation_id)
        {
            debug!(correlation_id = %request.correlation_id, "Transfer already executed");
            return Ok(TransferReceipt {
                reference: reference.clone(),
            });
        }

        let reference = format!("tr_{}", Uuid::new_v4().simple());
        info!(
            beneficiary_account = %request.beneficiary_account,
            amount_minor = request.amount_minor,
            currency = %request.currency,
            correlation_id = %request.correlation_id,
            reference = %reference,
            "Transfer executed"
        );
        executed.push((request.clone(), reference.clone()));

        Ok(TransferReceipt { reference })
    }
}

// ============================================================================
// HTTP sink
// ============================================================================

/// POSTs each transfer as JSON to a payout endpoint.
///
/// A 2xx response must carry `{"reference": "..."}`; anything else fails the
/// attempt.
#[derive(Clone)]
pub struct HttpTransferSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransferSink {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TransferSink for HttpTransferSink {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", request.correlation_id.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Rejected {
                status: status.as_u16(),
            });
        }

        let receipt: TransferReceipt = response
            .json()
            .await
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))?;
        if receipt.reference.trim().is_empty() {
            return Err(TransferError::InvalidResponse("empty reference".to_string()));
        }
        Ok(receipt)
    }
}
