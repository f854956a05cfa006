//! In-memory store
//!
//! Thread-safe, single-process implementation of both storage traits.
//! Every operation takes the one write lock for its whole critical section,
//! which gives the same uniqueness and tail compare-and-set guarantees as
//! the PostgreSQL constraints.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use splitledger_types::{
    AllocationId, AllocationStatus, NewTransaction, ProfitAllocation, Transaction, TransactionId,
    GENESIS_HASH,
};
use tokio::sync::RwLock;

use crate::{AllocationStore, DbError, DbResult, TransactionStore};

struct Inner {
    transactions: HashMap<TransactionId, Transaction>,
    /// external_payment_id -> transaction (unique index)
    by_external: HashMap<String, TransactionId>,
    allocations: HashMap<AllocationId, ProfitAllocation>,
    /// transaction -> allocation (unique index)
    by_transaction: HashMap<TransactionId, AllocationId>,
    /// Allocations in the order they completed
    chain: Vec<AllocationId>,
    /// Hash of the newest completed allocation, moved only by compare-and-set
    tail: String,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            transactions: HashMap::new(),
            by_external: HashMap::new(),
            allocations: HashMap::new(),
            by_transaction: HashMap::new(),
            chain: Vec::new(),
            tail: GENESIS_HASH.to_string(),
        }
    }
}

/// In-memory transaction and allocation store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored allocation without any checks.
    ///
    /// Only for tests that need to simulate storage tampering.
    #[doc(hidden)]
    pub async fn tamper_allocation(&self, allocation: ProfitAllocation) {
        let mut inner = self.inner.write().await;
        inner.allocations.insert(allocation.id, allocation);
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn create(&self, input: NewTransaction) -> DbResult<Transaction> {
        let mut inner = self.inner.write().await;

        if inner.by_external.contains_key(&input.external_payment_id) {
            return Err(DbError::DuplicateTransaction {
                external_payment_id: input.external_payment_id,
            });
        }

        let transaction = input.into_transaction();
        inner
            .by_external
            .insert(transaction.external_payment_id.clone(), transaction.id);
        inner.transactions.insert(transaction.id, transaction.clone());

        Ok(transaction)
    }

    async fn get(&self, id: &TransactionId) -> DbResult<Option<Transaction>> {
        Ok(self.inner.read().await.transactions.get(id).cloned())
    }

    async fn find_by_external_id(&self, external_payment_id: &str) -> DbResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_external
            .get(external_payment_id)
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn find_latest_allocation_hash(&self) -> DbResult<String> {
        Ok(self.inner.read().await.tail.clone())
    }

    async fn count_transactions(&self) -> DbResult<u64> {
        Ok(self.inner.read().await.transactions.len() as u64)
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn create_allocation(&self, allocation: &ProfitAllocation) -> DbResult<()> {
        let mut inner = self.inner.write().await;

        if !inner.transactions.contains_key(&allocation.transaction_id) {
            return Err(DbError::NotFound(format!(
                "transaction {}",
                allocation.transaction_id
            )));
        }
        if inner.by_transaction.contains_key(&allocation.transaction_id) {
            return Err(DbError::DuplicateAllocation {
                transaction_id: allocation.transaction_id,
            });
        }

        inner
            .by_transaction
            .insert(allocation.transaction_id, allocation.id);
        inner.allocations.insert(allocation.id, allocation.clone());
        Ok(())
    }

    async fn get_allocation(&self, id: &AllocationId) -> DbResult<Option<ProfitAllocation>> {
        Ok(self.inner.read().await.allocations.get(id).cloned())
    }

    async fn find_allocation_by_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> DbResult<Option<ProfitAllocation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_transaction
            .get(transaction_id)
            .and_then(|id| inner.allocations.get(id))
            .cloned())
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

        let mut inner = self.inner.write().await;
        let stored = inner
            .allocations
            .get_mut(&allocation.id)
            .ok_or_else(|| DbError::NotFound(format!("allocation {}", allocation.id)))?;

        if stored.status == AllocationStatus::Completed {
            return Err(DbError::ImmutableRecord {
                allocation_id: allocation.id,
            });
        }
        if stored.status != expected_status {
            return Err(DbError::StatusConflict {
                allocation_id: allocation.id,
                expected: expected_status,
                actual: stored.status,
            });
        }
        if stored.attempt_count != expected_attempt {
            return Err(DbError::AttemptConflict {
                allocation_id: allocation.id,
                expected: expected_attempt,
                actual: stored.attempt_count,
            });
        }

        *stored = allocation.clone();
        Ok(())
    }

    async fn complete_allocation(
        &self,
        allocation: &ProfitAllocation,
        expected_tail: &str,
    ) -> DbResult<u64> {
        let hash = match (&allocation.hash, allocation.status) {
            (Some(hash), AllocationStatus::Completed) => hash.clone(),
            _ => {
                return Err(DbError::InvalidData(format!(
                    "allocation {} is not a hashed completed record",
                    allocation.id
                )))
            }
        };

        let mut inner = self.inner.write().await;

        if inner.tail != expected_tail {
            return Err(DbError::ChainConflict {
                expected: expected_tail.to_string(),
                actual: inner.tail.clone(),
            });
        }

        let position = inner.chain.len() as u64;
        let stored = inner
            .allocations
            .get_mut(&allocation.id)
            .ok_or_else(|| DbError::NotFound(format!("allocation {}", allocation.id)))?;

        match stored.status {
            AllocationStatus::Processing => {}
            AllocationStatus::Completed => {
                return Err(DbError::ImmutableRecord {
                    allocation_id: allocation.id,
                })
            }
            actual => {
                return Err(DbError::StatusConflict {
                    allocation_id: allocation.id,
                    expected: AllocationStatus::Processing,
                    actual,
                })
            }
        }
        if stored.attempt_count != allocation.attempt_count {
            return Err(DbError::AttemptConflict {
                allocation_id: allocation.id,
                expected: allocation.attempt_count,
                actual: stored.attempt_count,
            });
        }

        let mut completed = allocation.clone();
        completed.chain_position = Some(position);
        *stored = completed;
        inner.chain.push(allocation.id);
        inner.tail = hash;

        Ok(position)
    }

    async fn list_allocations_by_status(
        &self,
        status: AllocationStatus,
        limit: usize,
    ) -> DbResult<Vec<ProfitAllocation>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<ProfitAllocation> = inner
            .allocations
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_chain(&self) -> DbResult<Vec<ProfitAllocation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .chain
            .iter()
            .filter_map(|id| inner.allocations.get(id))
            .filter(|a| a.status == AllocationStatus::Completed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitledger_types::{Currency, RevenueSource, ShareAmount};
    use std::collections::BTreeMap;

    fn new_transaction(external_id: &str) -> NewTransaction {
        NewTransaction {
            external_payment_id: external_id.to_string(),
            amount_minor: 1000,
            currency: Currency::usd(),
            source: RevenueSource::Subscription,
            description: "test".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn allocation_for(transaction: &Transaction) -> ProfitAllocation {
        ProfitAllocation::new(
            transaction,
            vec![ShareAmount {
                beneficiary: "ops".to_string(),
                account_ref: "acct_ops".to_string(),
                amount_minor: transaction.amount_minor,
                transfer_ref: None,
            }],
            3,
        )
    }

    fn completed(mut allocation: ProfitAllocation, previous: &str, hash: &str) -> ProfitAllocation {
        allocation.status = AllocationStatus::Completed;
        allocation.previous_hash = Some(previous.to_string());
        allocation.hash = Some(hash.to_string());
        allocation
    }

    async fn processing(store: &MemoryStore, external_id: &str) -> ProfitAllocation {
        let transaction = store.create(new_transaction(external_id)).await.unwrap();
        let mut allocation = allocation_for(&transaction);
        store.create_allocation(&allocation).await.unwrap();
        allocation.status = AllocationStatus::Processing;
        allocation.attempt_count = 1;
        store
            .update_allocation(&allocation, AllocationStatus::Pending, 0)
            .await
            .unwrap();
        allocation
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = MemoryStore::new();
        let created = store.create(new_transaction("pay_1")).await.unwrap();

        let by_id = store.get(&created.id).await.unwrap().unwrap();
        let by_external = store.find_by_external_id("pay_1").await.unwrap().unwrap();
        assert_eq!(by_id, created);
        assert_eq!(by_external, created);
        assert_eq!(store.count_transactions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_external_id_rejected() {
        let store = MemoryStore::new();
        store.create(new_transaction("pay_1")).await.unwrap();
        let result = store.create(new_transaction("pay_1")).await;
        assert!(matches!(result, Err(DbError::DuplicateTransaction { .. })));
        assert_eq!(store.count_transactions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_single_winner() {
        let store = MemoryStore::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(new_transaction("pay_race")).await })
            })
            .collect();

        let mut wins = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(DbError::DuplicateTransaction { .. }) => duplicates += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(duplicates, 7);
    }

    #[tokio::test]
    async fn test_one_allocation_per_transaction() {
        let store = MemoryStore::new();
        let transaction = store.create(new_transaction("pay_1")).await.unwrap();
        store.create_allocation(&allocation_for(&transaction)).await.unwrap();
        let result = store.create_allocation(&allocation_for(&transaction)).await;
        assert!(matches!(result, Err(DbError::DuplicateAllocation { .. })));
    }

    #[tokio::test]
    async fn test_update_requires_expected_status() {
        let store = MemoryStore::new();
        let allocation = processing(&store, "pay_1").await;

        let mut stale = allocation.clone();
        stale.status = AllocationStatus::Failed;
        let result = store
            .update_allocation(&stale, AllocationStatus::Pending, 1)
            .await;
        assert!(matches!(result, Err(DbError::StatusConflict { .. })));
    }

    #[tokio::test]
    async fn test_update_rejects_copy_from_earlier_attempt() {
        let store = MemoryStore::new();
        let first_attempt = processing(&store, "pay_1").await;

        // Attempt 1 is failed and retried, then attempt 2 claims the record
        let mut current = first_attempt.clone();
        current.status = AllocationStatus::Failed;
        store
            .update_allocation(&current, AllocationStatus::Processing, 1)
            .await
            .unwrap();
        current.status = AllocationStatus::Retrying;
        store
            .update_allocation(&current, AllocationStatus::Failed, 1)
            .await
            .unwrap();
        current.status = AllocationStatus::Processing;
        current.attempt_count = 2;
        store
            .update_allocation(&current, AllocationStatus::Retrying, 1)
            .await
            .unwrap();

        // Same status as the stored record, older attempt
        let mut stale = first_attempt.clone();
        stale.shares[0].transfer_ref = Some("tr_stale".to_string());
        let result = store
            .update_allocation(&stale, AllocationStatus::Processing, 1)
            .await;
        assert!(matches!(
            result,
            Err(DbError::AttemptConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        let result = store
            .complete_allocation(&completed(stale, GENESIS_HASH, "h1"), GENESIS_HASH)
            .await;
        assert!(matches!(result, Err(DbError::AttemptConflict { .. })));

        let stored = store.get_allocation(&current.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.shares[0].transfer_ref, None);
        assert_eq!(store.find_latest_allocation_hash().await.unwrap(), GENESIS_HASH);
    }

    #[tokio::test]
    async fn test_complete_moves_tail() {
        let store = MemoryStore::new();
        assert_eq!(store.find_latest_allocation_hash().await.unwrap(), GENESIS_HASH);

        let first = processing(&store, "pay_1").await;
        let position = store
            .complete_allocation(&completed(first, GENESIS_HASH, "h1"), GENESIS_HASH)
            .await
            .unwrap();
        assert_eq!(position, 0);
        assert_eq!(store.find_latest_allocation_hash().await.unwrap(), "h1");

        let second = processing(&store, "pay_2").await;
        let position = store
            .complete_allocation(&completed(second, "h1", "h2"), "h1")
            .await
            .unwrap();
        assert_eq!(position, 1);

        let chain = store.list_chain().await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].previous_hash.as_deref(), Some("h1"));
        assert_eq!(chain[1].chain_position, Some(1));
    }

    #[tokio::test]
    async fn test_complete_rejects_stale_tail() {
        let store = MemoryStore::new();
        let first = processing(&store, "pay_1").await;
        let second = processing(&store, "pay_2").await;

        store
            .complete_allocation(&completed(first, GENESIS_HASH, "h1"), GENESIS_HASH)
            .await
            .unwrap();

        let result = store
            .complete_allocation(&completed(second.clone(), GENESIS_HASH, "h2"), GENESIS_HASH)
            .await;
        assert!(matches!(result, Err(DbError::ChainConflict { .. })));

        let stored = store.get_allocation(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AllocationStatus::Processing);
    }

    #[tokio::test]
    async fn test_completed_record_is_immutable() {
        let store = MemoryStore::new();
        let allocation = processing(&store, "pay_1").await;
        let done = completed(allocation, GENESIS_HASH, "h1");
        store.complete_allocation(&done, GENESIS_HASH).await.unwrap();

        let mut edit = done.clone();
        edit.status = AllocationStatus::Failed;
        let result = store
            .update_allocation(&edit, AllocationStatus::Completed, 1)
            .await;
        assert!(matches!(result, Err(DbError::ImmutableRecord { .. })));

        let result = store.complete_allocation(&done, "h1").await;
        assert!(matches!(result, Err(DbError::ImmutableRecord { .. })));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = MemoryStore::new();
        processing(&store, "pay_1").await;
        processing(&store, "pay_2").await;
        let transaction = store.create(new_transaction("pay_3")).await.unwrap();
        store.create_allocation(&allocation_for(&transaction)).await.unwrap();

        let in_flight = store
            .list_allocations_by_status(AllocationStatus::Processing, 10)
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 2);

        let limited = store
            .list_allocations_by_status(AllocationStatus::Processing, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_chain_lists_completed_records_only() {
        let store = MemoryStore::new();
        let first = processing(&store, "pay_1").await;
        let second = processing(&store, "pay_2").await;
        store
            .complete_allocation(&completed(first, GENESIS_HASH, "h1"), GENESIS_HASH)
            .await
            .unwrap();
        let done = completed(second, "h1", "h2");
        store.complete_allocation(&done, "h1").await.unwrap();

        let mut reverted = done.clone();
        reverted.status = AllocationStatus::Processing;
        store.tamper_allocation(reverted).await;

        let chain = store.list_chain().await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(store.find_latest_allocation_hash().await.unwrap(), "h2");
    }
}
