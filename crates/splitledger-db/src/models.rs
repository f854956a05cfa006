//! Database models - mapped from PostgreSQL tables

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use splitledger_types::{
    AllocationId, AllocationStatus, Currency, ProfitAllocation, ShareAmount, Transaction,
    TransactionId,
};

use crate::{DbError, DbResult};

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct DbTransaction {
    pub id: Uuid,
    pub external_payment_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub source: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbTransaction> for Transaction {
    type Error = DbError;

    fn try_from(row: DbTransaction) -> DbResult<Self> {
        let metadata: BTreeMap<String, String> = serde_json::from_value(row.metadata)?;
        Ok(Transaction {
            id: TransactionId::from_uuid(row.id),
            external_payment_id: row.external_payment_id,
            amount_minor: row.amount_minor,
            currency: Currency::new(row.currency.trim())?,
            source: row.source.parse()?,
            description: row.description,
            metadata,
            created_at: row.created_at,
        })
    }
}

// ============================================================================
// Allocations
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct DbAllocation {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub shares: serde_json::Value,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub hash: Option<String>,
    pub previous_hash: Option<String>,
    pub chain_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbAllocation> for ProfitAllocation {
    type Error = DbError;

    fn try_from(row: DbAllocation) -> DbResult<Self> {
        let shares: Vec<ShareAmount> = serde_json::from_value(row.shares)?;
        let status: AllocationStatus = row.status.parse()?;
        Ok(ProfitAllocation {
            id: AllocationId::from_uuid(row.id),
            transaction_id: TransactionId::from_uuid(row.transaction_id),
            amount_minor: row.amount_minor,
            currency: Currency::new(row.currency.trim())?,
            shares,
            status,
            attempt_count: non_negative(row.attempt_count, "attempt_count")?,
            max_attempts: non_negative(row.max_attempts, "max_attempts")?,
            last_attempt_at: row.last_attempt_at,
            error_message: row.error_message,
            hash: row.hash,
            previous_hash: row.previous_hash,
            chain_position: row
                .chain_position
                .map(|p| u64::try_from(p).map_err(|_| DbError::InvalidData(format!("chain_position {p}"))))
                .transpose()?,
            created_at: row.created_at,
            executed_at: row.executed_at,
        })
    }
}

fn non_negative(value: i32, column: &str) -> DbResult<u32> {
    u32::try_from(value).map_err(|_| DbError::InvalidData(format!("{column} = {value}")))
}

/// Column list shared by every allocation query
pub(crate) const ALLOCATION_COLUMNS: &str = "id, transaction_id, amount_minor, currency, shares, \
     status, attempt_count, max_attempts, last_attempt_at, error_message, hash, previous_hash, \
     chain_position, created_at, executed_at";

/// Column list shared by every transaction query
pub(crate) const TRANSACTION_COLUMNS: &str =
    "id, external_payment_id, amount_minor, currency, source, description, metadata, created_at";

#[cfg(test)]
mod tests {
    use super::*;
    use splitledger_types::timestamp_now;

    fn row() -> DbAllocation {
        DbAllocation {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            amount_minor: 1499,
            currency: "USD".to_string(),
            shares: serde_json::json!([
                {"beneficiary": "ops", "account_ref": "acct_ops", "amount_minor": 1499, "transfer_ref": "tr_1"}
            ]),
            status: "completed".to_string(),
            attempt_count: 1,
            max_attempts: 3,
            last_attempt_at: Some(timestamp_now()),
            error_message: None,
            hash: Some("abc".to_string()),
            previous_hash: Some("GENESIS".to_string()),
            chain_position: Some(0),
            created_at: timestamp_now(),
            executed_at: Some(timestamp_now()),
        }
    }

    #[test]
    fn test_allocation_row_conversion() {
        let allocation = ProfitAllocation::try_from(row()).unwrap();
        assert_eq!(allocation.status, AllocationStatus::Completed);
        assert_eq!(allocation.shares[0].transfer_ref.as_deref(), Some("tr_1"));
        assert_eq!(allocation.chain_position, Some(0));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut bad = row();
        bad.status = "done".to_string();
        assert!(matches!(
            ProfitAllocation::try_from(bad),
            Err(DbError::InvalidData(_))
        ));
    }

    #[test]
    fn test_negative_counter_rejected() {
        let mut bad = row();
        bad.attempt_count = -1;
        assert!(ProfitAllocation::try_from(bad).is_err());
    }

    #[test]
    fn test_transaction_row_conversion() {
        let row = DbTransaction {
            id: Uuid::new_v4(),
            external_payment_id: "pay_1".to_string(),
            amount_minor: 1499,
            currency: "usd".to_string(),
            source: "subscription".to_string(),
            description: "Premium".to_string(),
            metadata: serde_json::json!({"order_id": "ord_1"}),
            created_at: timestamp_now(),
        };
        let transaction = Transaction::try_from(row).unwrap();
        assert_eq!(transaction.currency.code(), "USD");
        assert_eq!(transaction.metadata.get("order_id").map(String::as_str), Some("ord_1"));
    }
}
