//! Ledger events for downstream listeners
//!
//! Notification consumers (profile unlocks, receipt emails) subscribe to
//! these; SplitLedger itself never depends on who is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AllocationId, RevenueSource, TransactionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    /// A payment was recorded for the first time
    TransactionCreated {
        transaction_id: TransactionId,
        external_payment_id: String,
        amount_minor: i64,
        currency: String,
        source: RevenueSource,
        timestamp: DateTime<Utc>,
    },

    /// An allocation reached `COMPLETED` and became the ledger tail
    AllocationCompleted {
        allocation_id: AllocationId,
        transaction_id: TransactionId,
        hash: String,
        chain_position: u64,
        timestamp: DateTime<Utc>,
    },

    /// An allocation attempt failed
    AllocationFailed {
        allocation_id: AllocationId,
        transaction_id: TransactionId,
        attempt_count: u32,
        /// No further automatic retry will happen
        terminal: bool,
        error: String,
        timestamp: DateTime<Utc>,
    },
}
