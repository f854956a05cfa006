//! PostgreSQL store
//!
//! Uniqueness comes from the `transactions_external_payment_id_key` and
//! `profit_allocations_transaction_id_key` constraints. The ledger tail is
//! the single row of `ledger_tail`; completing an allocation moves it with
//! `UPDATE ... WHERE hash = $expected` inside the same SQL transaction that
//! writes the completed record.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

use splitledger_types::{
    AllocationId, AllocationStatus, NewTransaction, ProfitAllocation, Transaction, TransactionId,
};

use crate::models::{DbAllocation, DbTransaction, ALLOCATION_COLUMNS, TRANSACTION_COLUMNS};
use crate::{AllocationStore, DatabaseConfig, DbError, DbResult, TransactionStore};

/// PostgreSQL-backed transaction and allocation store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and optionally run migrations
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        info!("Connecting to PostgreSQL: {}", config.postgres_url_masked());

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.postgres_url)
            .await
            .map_err(|e| DbError::Connection(format!("PostgreSQL: {}", e)))?;

        info!("Connected to PostgreSQL");

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Run embedded migrations
    pub async fn migrate(&self) -> DbResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        info!("Migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stored_version(&self, id: &AllocationId) -> DbResult<Option<(AllocationStatus, u32)>> {
        let row: Option<(String, i32)> =
            sqlx::query_as("SELECT status, attempt_count FROM profit_allocations WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(status, attempt_count)| -> DbResult<(AllocationStatus, u32)> {
            let status: AllocationStatus = status.parse()?;
            let attempt_count = u32::try_from(attempt_count)
                .map_err(|_| DbError::InvalidData(format!("attempt_count {attempt_count}")))?;
            Ok((status, attempt_count))
        })
        .transpose()
    }

    /// Translate a zero-row conditional update into the matching error
    async fn version_mismatch(
        &self,
        id: &AllocationId,
        expected: AllocationStatus,
        expected_attempt: u32,
    ) -> DbError {
        match self.stored_version(id).await {
            Ok(Some((AllocationStatus::Completed, _))) => {
                DbError::ImmutableRecord { allocation_id: *id }
            }
            Ok(Some((actual, _))) if actual != expected => DbError::StatusConflict {
                allocation_id: *id,
                expected,
                actual,
            },
            Ok(Some((_, actual))) => DbError::AttemptConflict {
                allocation_id: *id,
                expected: expected_attempt,
                actual,
            },
            Ok(None) => DbError::NotFound(format!("allocation {}", id)),
            Err(e) => e,
        }
    }
}

fn shares_json(allocation: &ProfitAllocation) -> DbResult<serde_json::Value> {
    Ok(serde_json::to_value(&allocation.shares)?)
}

fn to_i32(value: u32, column: &str) -> DbResult<i32> {
    i32::try_from(value).map_err(|_| DbError::InvalidData(format!("{column} = {value}")))
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn create(&self, input: NewTransaction) -> DbResult<Transaction> {
        let transaction = input.into_transaction();
        let metadata = serde_json::to_value(&transaction.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, external_payment_id, amount_minor, currency, source, description, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(transaction.id.as_uuid())
        .bind(&transaction.external_payment_id)
        .bind(transaction.amount_minor)
        .bind(transaction.currency.code())
        .bind(transaction.source.as_str())
        .bind(&transaction.description)
        .bind(metadata)
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.constraint() == Some("transactions_external_payment_id_key") {
                    return DbError::DuplicateTransaction {
                        external_payment_id: transaction.external_payment_id.clone(),
                    };
                }
            }
            DbError::Query(e)
        })?;

        debug!(
            transaction_id = %transaction.id,
            external_payment_id = %transaction.external_payment_id,
            "Transaction inserted"
        );
        Ok(transaction)
    }

    async fn get(&self, id: &TransactionId) -> DbResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, DbTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn find_by_external_id(&self, external_payment_id: &str) -> DbResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, DbTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE external_payment_id = $1"
        ))
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn find_latest_allocation_hash(&self) -> DbResult<String> {
        let hash: Option<String> = sqlx::query_scalar("SELECT hash FROM ledger_tail WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        hash.ok_or_else(|| DbError::InvalidData("ledger_tail row missing".to_string()))
    }

    async fn count_transactions(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AllocationStore for PgStore {
    async fn create_allocation(&self, allocation: &ProfitAllocation) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profit_allocations
                (id, transaction_id, amount_minor, currency, shares, status, attempt_count,
                 max_attempts, last_attempt_at, error_message, hash, previous_hash,
                 chain_position, created_at, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL, $13, $14)
            "#,
        )
        .bind(allocation.id.as_uuid())
        .bind(allocation.transaction_id.as_uuid())
        .bind(allocation.amount_minor)
        .bind(allocation.currency.code())
        .bind(shares_json(allocation)?)
        .bind(allocation.status.as_str())
        .bind(to_i32(allocation.attempt_count, "attempt_count")?)
        .bind(to_i32(allocation.max_attempts, "max_attempts")?)
        .bind(allocation.last_attempt_at)
        .bind(&allocation.error_message)
        .bind(&allocation.hash)
        .bind(&allocation.previous_hash)
        .bind(allocation.created_at)
        .bind(allocation.executed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.constraint() == Some("profit_allocations_transaction_id_key") {
                    return DbError::DuplicateAllocation {
                        transaction_id: allocation.transaction_id,
                    };
                }
            }
            DbError::Query(e)
        })?;

        Ok(())
    }

    async fn get_allocation(&self, id: &AllocationId) -> DbResult<Option<ProfitAllocation>> {
        let row = sqlx::query_as::<_, DbAllocation>(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM profit_allocations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProfitAllocation::try_from).transpose()
    }

    async fn find_allocation_by_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> DbResult<Option<ProfitAllocation>> {
        let row = sqlx::query_as::<_, DbAllocation>(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM profit_allocations WHERE transaction_id = $1"
        ))
        .bind(transaction_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProfitAllocation::try_from).transpose()
    }

    async fn update_allocation(
        &self,
        allocation: &ProfitAllocation,
        expected_status: AllocationStatus,
        expected_attempt: u32,
    ) -> DbResult<()> {
        if allocation.status == AllocationStatus::Completed {
            return Err(DbError::InvalidData(
                "completion must go through complete_allocation".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE profit_allocations
            SET shares = $3, status = $4, attempt_count = $5, last_attempt_at = $6,
                error_message = $7, hash = $8, previous_hash = $9
            WHERE id = $1 AND status = $2 AND attempt_count = $10 AND status <> 'completed'
            "#,
        )
        .bind(allocation.id.as_uuid())
        .bind(expected_status.as_str())
        .bind(shares_json(allocation)?)
        .bind(allocation.status.as_str())
        .bind(to_i32(allocation.attempt_count, "attempt_count")?)
        .bind(allocation.last_attempt_at)
        .bind(&allocation.error_message)
        .bind(&allocation.hash)
        .bind(&allocation.previous_hash)
        .bind(to_i32(expected_attempt, "attempt_count")?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .version_mismatch(&allocation.id, expected_status, expected_attempt)
                .await);
        }
        Ok(())
    }

    async fn complete_allocation(
        &self,
        allocation: &ProfitAllocation,
        expected_tail: &str,
    ) -> DbResult<u64> {
        let hash = match (&allocation.hash, allocation.status) {
            (Some(hash), AllocationStatus::Completed) => hash,
            _ => {
                return Err(DbError::InvalidData(format!(
                    "allocation {} is not a hashed completed record",
                    allocation.id
                )))
            }
        };

        let mut tx = self.pool.begin().await?;

        // Row lock on the tail serializes concurrent completions
        let position: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE ledger_tail SET hash = $1, length = length + 1
            WHERE id = 1 AND hash = $2
            RETURNING length - 1
            "#,
        )
        .bind(hash)
        .bind(expected_tail)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(position) = position else {
            tx.rollback().await?;
            let actual = self.find_latest_allocation_hash().await?;
            return Err(DbError::ChainConflict {
                expected: expected_tail.to_string(),
                actual,
            });
        };

        let result = sqlx::query(
            r#"
            UPDATE profit_allocations
            SET shares = $2, last_attempt_at = $4, status = 'completed',
                error_message = NULL, hash = $5, previous_hash = $6, chain_position = $7,
                executed_at = $8
            WHERE id = $1 AND status = 'processing' AND attempt_count = $3
            "#,
        )
        .bind(allocation.id.as_uuid())
        .bind(shares_json(allocation)?)
        .bind(to_i32(allocation.attempt_count, "attempt_count")?)
        .bind(allocation.last_attempt_at)
        .bind(hash)
        .bind(&allocation.previous_hash)
        .bind(position)
        .bind(allocation.executed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self
                .version_mismatch(
                    &allocation.id,
                    AllocationStatus::Processing,
                    allocation.attempt_count,
                )
                .await);
        }

        tx.commit().await?;

        u64::try_from(position).map_err(|_| DbError::InvalidData(format!("chain position {position}")))
    }

    async fn list_allocations_by_status(
        &self,
        status: AllocationStatus,
        limit: usize,
    ) -> DbResult<Vec<ProfitAllocation>> {
        let rows = sqlx::query_as::<_, DbAllocation>(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM profit_allocations \
             WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProfitAllocation::try_from).collect()
    }

    async fn list_chain(&self) -> DbResult<Vec<ProfitAllocation>> {
        let rows = sqlx::query_as::<_, DbAllocation>(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM profit_allocations \
             WHERE status = 'completed' ORDER BY chain_position ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProfitAllocation::try_from).collect()
    }
}
