//! Error types for SplitLedger domain values

use thiserror::Error;

use crate::AllocationStatus;

/// Result type for domain operations
pub type Result<T> = std::result::Result<T, SplitLedgerError>;

/// Domain validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitLedgerError {
    // ========================================================================
    // Amount Errors
    // ========================================================================

    #[error("Invalid currency code: {code}")]
    InvalidCurrency { code: String },

    #[error("Amount {amount} has more precision than {currency} allows")]
    PrecisionLoss { amount: String, currency: String },

    #[error("Amount overflow during arithmetic operation")]
    AmountOverflow,

    #[error("Invalid amount: {message}")]
    InvalidAmount { message: String },

    // ========================================================================
    // Split Configuration Errors
    // ========================================================================

    #[error("Split percentages must sum to 100, got {total}")]
    SplitTotal { total: String },

    #[error("Invalid split configuration: {0}")]
    InvalidSplit(String),

    // ========================================================================
    // Allocation Errors
    // ========================================================================

    #[error("Illegal allocation transition {from} -> {to}")]
    InvalidTransition {
        from: AllocationStatus,
        to: AllocationStatus,
    },

    #[error("Unknown allocation status: {0}")]
    UnknownStatus(String),

    // ========================================================================
    // Payment Event Errors
    // ========================================================================

    #[error("Invalid payment event: {0}")]
    InvalidPayment(String),

    #[error("Unknown revenue source: {0}")]
    UnknownRevenueSource(String),
}
