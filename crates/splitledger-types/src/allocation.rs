//! Profit allocations and their state machine
//!
//! ```text
//! PENDING ──► PROCESSING ──► COMPLETED
//!                 │
//!                 ▼
//!               FAILED ──► RETRYING ──► PROCESSING
//!                 │
//!                 └── (attempts exhausted: terminal)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{timestamp_now, AllocationId, Currency, Result, SplitLedgerError, Transaction, TransactionId};

/// Default attempt ceiling before an allocation fails terminally
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Allocation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Failed, and will be picked up again by the retry scheduler
    Retrying,
}

impl AllocationStatus {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        use AllocationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Retrying)
                | (Retrying, Processing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = SplitLedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            _ => Err(SplitLedgerError::UnknownStatus(s.to_string())),
        }
    }
}

/// One beneficiary's portion of an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareAmount {
    pub beneficiary: String,
    pub account_ref: String,
    pub amount_minor: i64,
    /// External transfer reference, set once the payout succeeded
    pub transfer_ref: Option<String>,
}

impl ShareAmount {
    /// Whether this share still needs an external transfer
    pub fn needs_transfer(&self) -> bool {
        self.amount_minor > 0 && self.transfer_ref.is_none()
    }
}

/// Durable split of one transaction among the configured beneficiaries.
///
/// Once `COMPLETED` the record is the ledger chain entry and is never
/// modified again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitAllocation {
    pub id: AllocationId,
    pub transaction_id: TransactionId,
    pub amount_minor: i64,
    pub currency: Currency,
    pub shares: Vec<ShareAmount>,
    pub status: AllocationStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// SHA-256 over the canonical allocation payload and `previous_hash`
    pub hash: Option<String>,
    pub previous_hash: Option<String>,
    /// Zero-based index in the ledger chain, set on completion
    pub chain_position: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ProfitAllocation {
    /// Create a `PENDING` allocation for a transaction
    pub fn new(transaction: &Transaction, shares: Vec<ShareAmount>, max_attempts: u32) -> Self {
        Self {
            id: AllocationId::new(),
            transaction_id: transaction.id,
            amount_minor: transaction.amount_minor,
            currency: transaction.currency.clone(),
            shares,
            status: AllocationStatus::Pending,
            attempt_count: 0,
            max_attempts,
            last_attempt_at: None,
            error_message: None,
            hash: None,
            previous_hash: None,
            chain_position: None,
            created_at: timestamp_now(),
            executed_at: None,
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: AllocationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SplitLedgerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether another attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// `COMPLETED`, or `FAILED` with the attempt ceiling reached
    pub fn is_terminal(&self) -> bool {
        match self.status {
            AllocationStatus::Completed => true,
            AllocationStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Sum of all share amounts
    pub fn shares_total(&self) -> i64 {
        self.shares.iter().map(|s| s.amount_minor).sum()
    }

    /// Every non-zero share has an external transfer reference
    pub fn all_transfers_recorded(&self) -> bool {
        self.shares.iter().all(|s| !s.needs_transfer())
    }
}
