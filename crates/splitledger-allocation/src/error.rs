//! Allocation errors

use thiserror::Error;

use splitledger_db::DbError;
use splitledger_ledger::LedgerError;
use splitledger_types::SplitLedgerError;

use crate::TransferError;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Domain(#[from] SplitLedgerError),

    #[error("Storage error: {0}")]
    Store(#[from] DbError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid engine configuration: {0}")]
    Config(String),
}

pub type AllocationResult<T> = std::result::Result<T, AllocationError>;
