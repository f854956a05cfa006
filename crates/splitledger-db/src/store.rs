//! Storage traits
//!
//! Both backends (in-memory and PostgreSQL) implement the same two traits,
//! so the allocation engine and the HTTP layer never know which one they
//! talk to. Uniqueness and the ledger tail compare-and-set are enforced
//! here, at the storage layer, not by application locks.

use async_trait::async_trait;
use splitledger_types::{
    AllocationId, AllocationStatus, NewTransaction, ProfitAllocation, Transaction, TransactionId,
};

use crate::DbResult;

/// Durable record of confirmed payments
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new transaction.
    ///
    /// Atomic with respect to `external_payment_id`: of two concurrent
    /// creates for the same id exactly one succeeds and the other fails
    /// with [`DbError::DuplicateTransaction`](crate::DbError::DuplicateTransaction).
    async fn create(&self, input: NewTransaction) -> DbResult<Transaction>;

    async fn get(&self, id: &TransactionId) -> DbResult<Option<Transaction>>;

    async fn find_by_external_id(&self, external_payment_id: &str) -> DbResult<Option<Transaction>>;

    /// Hash of the ledger tail, or the genesis sentinel for an empty chain
    async fn find_latest_allocation_hash(&self) -> DbResult<String>;

    async fn count_transactions(&self) -> DbResult<u64>;

    /// Backend liveness check
    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Allocation records and the ledger chain they form
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Insert a new allocation; one per transaction
    async fn create_allocation(&self, allocation: &ProfitAllocation) -> DbResult<()>;

    async fn get_allocation(&self, id: &AllocationId) -> DbResult<Option<ProfitAllocation>>;

    async fn find_allocation_by_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> DbResult<Option<ProfitAllocation>>;

    /// Persist a non-completing transition.
    ///
    /// Succeeds only if the stored status still equals `expected_status` and
    /// the stored attempt count still equals `expected_attempt`, so a copy
    /// left over from an earlier attempt can never overwrite a later one.
    /// Completed records are never modified.
    async fn update_allocation(
        &self,
        allocation: &ProfitAllocation,
        expected_status: AllocationStatus,
        expected_attempt: u32,
    ) -> DbResult<()>;

    /// Persist a `COMPLETED` allocation and make it the ledger tail.
    ///
    /// The stored record must be `PROCESSING` on the same attempt as
    /// `allocation`, and the tail must still equal `expected_tail`; otherwise
    /// nothing is written and a conflict error is returned. Returns the
    /// allocation's chain position.
    async fn complete_allocation(
        &self,
        allocation: &ProfitAllocation,
        expected_tail: &str,
    ) -> DbResult<u64>;

    /// Allocations in a given state, oldest first
    async fn list_allocations_by_status(
        &self,
        status: AllocationStatus,
        limit: usize,
    ) -> DbResult<Vec<ProfitAllocation>>;

    /// Every completed allocation in chain order, genesis first
    async fn list_chain(&self) -> DbResult<Vec<ProfitAllocation>>;
}

/// Convenience bound for components that need both stores
pub trait LedgerStore: TransactionStore + AllocationStore {}

impl<T: TransactionStore + AllocationStore + ?Sized> LedgerStore for T {}
