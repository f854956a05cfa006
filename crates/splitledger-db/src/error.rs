//! Database error types

use splitledger_types::{AllocationId, AllocationStatus, TransactionId};
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A transaction for this external payment id already exists
    #[error("Duplicate transaction for external payment {external_payment_id}")]
    DuplicateTransaction { external_payment_id: String },

    /// The transaction already has an allocation
    #[error("Duplicate allocation for transaction {transaction_id}")]
    DuplicateAllocation { transaction_id: TransactionId },

    /// The ledger tail moved since it was read
    #[error("Ledger tail changed: expected {expected}, found {actual}")]
    ChainConflict { expected: String, actual: String },

    /// The stored allocation is not in the state the caller read
    #[error("Allocation {allocation_id} is {actual}, expected {expected}")]
    StatusConflict {
        allocation_id: AllocationId,
        expected: AllocationStatus,
        actual: AllocationStatus,
    },

    /// The stored allocation belongs to a different attempt than the caller's copy
    #[error("Allocation {allocation_id} is on attempt {actual}, expected {expected}")]
    AttemptConflict {
        allocation_id: AllocationId,
        expected: u32,
        actual: u32,
    },

    /// Completed allocations are ledger entries and never change
    #[error("Allocation {allocation_id} is completed and immutable")]
    ImmutableRecord { allocation_id: AllocationId },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl DbError {
    /// Conflicts that a caller may resolve by re-reading and retrying
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ChainConflict { .. } | Self::StatusConflict { .. } | Self::AttemptConflict { .. }
        )
    }
}

impl From<deadpool_redis::PoolError> for DbError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        DbError::Redis(e.to_string())
    }
}

impl From<redis::RedisError> for DbError {
    fn from(e: redis::RedisError) -> Self {
        DbError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<splitledger_types::SplitLedgerError> for DbError {
    fn from(e: splitledger_types::SplitLedgerError) -> Self {
        DbError::InvalidData(e.to_string())
    }
}

/// Result type for storage operations
pub type DbResult<T> = Result<T, DbError>;
