//! Operator view bodies

use serde::{Deserialize, Serialize};

use splitledger_types::{ProfitAllocation, Transaction};

/// Transaction with its major-unit amount spelled out
#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: Transaction,
    /// Decimal amount in major units, e.g. "14.99"
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ProfitAllocation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListAllocationsQuery {
    /// Allocation status filter; defaults to `failed`
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationList {
    pub data: Vec<ProfitAllocation>,
    pub count: usize,
}
