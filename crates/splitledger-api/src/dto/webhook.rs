//! Webhook acknowledgement bodies

use serde::{Deserialize, Serialize};

use splitledger_types::{AllocationId, AllocationStatus, ProfitAllocation};

/// How a webhook delivery was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Not a payment event
    Ignored,
    /// Payment not yet completed at the processor
    Pending,
    /// Seen before; no new transaction was recorded
    AlreadyProcessed,
    /// Recorded and allocated by this delivery
    Processed,
}

impl WebhookStatus {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Pending => "pending",
            Self::AlreadyProcessed => "already_processed",
            Self::Processed => "processed",
        }
    }
}

/// Acknowledgement sent to the processor.
///
/// Carries the allocation id and, once the allocation is a ledger entry,
/// its hash. Allocation state is only exposed on the operator endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl WebhookResponse {
    pub fn status(status: WebhookStatus) -> Self {
        Self {
            status,
            allocation_id: None,
            hash: None,
        }
    }

    pub fn with_allocation(status: WebhookStatus, allocation: &ProfitAllocation) -> Self {
        Self {
            status,
            allocation_id: Some(allocation.id),
            hash: match allocation.status {
                AllocationStatus::Completed => allocation.hash.clone(),
                _ => None,
            },
        }
    }
}
