//! Allocation engine
//!
//! Drives one allocation through `PENDING → PROCESSING → COMPLETED`, or
//! through `FAILED` to `RETRYING` (or terminal `FAILED`) when an attempt
//! fails. Every transition is persisted with a compare-and-set on the
//! stored status and attempt count, so two workers can never run the same
//! attempt and a worker that stalled can never write over a later attempt.

use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use splitledger_db::{AllocationStore, DbError, LedgerStore};
use splitledger_ledger::LedgerChain;
use splitledger_types::{
    timestamp_now, AllocationId, AllocationStatus, LedgerEvent, ProfitAllocation, SplitConfig,
    Transaction, DEFAULT_MAX_ATTEMPTS,
};

use crate::{compute_split, AllocationError, AllocationResult, TransferError, TransferRequest, TransferSink};

/// Default upper bound on a single transfer call
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum `PROCESSING` records examined per stale-recovery pass
const RECOVERY_BATCH: usize = 500;

/// Error message recorded for attempts cut short by a crash or restart
pub const INTERRUPTED_ATTEMPT: &str = "attempt interrupted";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub split: SplitConfig,
    /// Attempts before an allocation fails terminally
    pub max_attempts: u32,
    pub transfer_timeout: Duration,
}

impl EngineConfig {
    pub fn new(split: SplitConfig) -> Self {
        Self {
            split,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }
}

/// Allocation state machine over a [`LedgerStore`] and a [`TransferSink`]
pub struct AllocationEngine {
    store: Arc<dyn LedgerStore>,
    ledger: LedgerChain,
    sink: Arc<dyn TransferSink>,
    config: EngineConfig,
    events: broadcast::Sender<LedgerEvent>,
}

impl AllocationEngine {
    /// Create an engine; rejects an invalid split or a zero attempt ceiling
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn TransferSink>,
        config: EngineConfig,
    ) -> AllocationResult<Self> {
        config.split.validate()?;
        if config.max_attempts == 0 {
            return Err(AllocationError::Config("max_attempts must be at least 1".to_string()));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            ledger: LedgerChain::new(store.clone()),
            store,
            sink,
            config,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &LedgerChain {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Receive ledger events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Publish an event; having no listeners is not an error
    pub fn emit(&self, event: LedgerEvent) {
        let _ = self.events.send(event);
    }

    /// Allocate a recorded transaction.
    ///
    /// Creates the allocation on first call and runs one attempt. Calling it
    /// again for a completed (or terminally failed) allocation returns the
    /// stored record untouched.
    pub async fn run(&self, transaction: &Transaction) -> AllocationResult<ProfitAllocation> {
        let allocation = match self
            .store
            .find_allocation_by_transaction(&transaction.id)
            .await?
        {
            Some(existing) => existing,
            None => self.create(transaction).await?,
        };
        self.drive(allocation).await
    }

    /// Run the next attempt of a stored allocation, if it needs one
    pub async fn resume(&self, id: &AllocationId) -> AllocationResult<ProfitAllocation> {
        let allocation = self.reload(id).await?;
        self.drive(allocation).await
    }

    /// Fail `PROCESSING` attempts idle for longer than `threshold`.
    ///
    /// Such attempts were cut short (crash, restart); they go to `FAILED`
    /// and on to `RETRYING` or terminal exactly like a failed transfer.
    /// Returns the number of allocations recovered.
    pub async fn recover_stale(&self, threshold: chrono::Duration) -> AllocationResult<usize> {
        let cutoff = Utc::now() - threshold;
        let mut recovered = 0;

        for allocation in self
            .store
            .list_allocations_by_status(AllocationStatus::Processing, RECOVERY_BATCH)
            .await?
        {
            let last_activity = allocation.last_attempt_at.unwrap_or(allocation.created_at);
            if last_activity > cutoff {
                continue;
            }

            warn!(
                allocation_id = %allocation.id,
                attempt = allocation.attempt_count,
                last_attempt_at = %last_activity,
                "Recovering interrupted allocation attempt"
            );
            let after = self.fail(allocation, INTERRUPTED_ATTEMPT.to_string()).await?;
            if after.status != AllocationStatus::Processing {
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn create(&self, transaction: &Transaction) -> AllocationResult<ProfitAllocation> {
        let shares = compute_split(transaction.amount_minor, &self.config.split)?;
        let allocation = ProfitAllocation::new(transaction, shares, self.config.max_attempts);

        match self.store.create_allocation(&allocation).await {
            Ok(()) => {
                debug!(
                    allocation_id = %allocation.id,
                    transaction_id = %transaction.id,
                    "Allocation created"
                );
                Ok(allocation)
            }
            Err(DbError::DuplicateAllocation { .. }) => self
                .store
                .find_allocation_by_transaction(&transaction.id)
                .await?
                .ok_or_else(|| {
                    AllocationError::NotFound(format!("allocation for transaction {}", transaction.id))
                }),
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self, id: &AllocationId) -> AllocationResult<ProfitAllocation> {
        self.store
            .get_allocation(id)
            .await?
            .ok_or_else(|| AllocationError::NotFound(format!("allocation {}", id)))
    }

    async fn drive(&self, allocation: ProfitAllocation) -> AllocationResult<ProfitAllocation> {
        match allocation.status {
            AllocationStatus::Pending | AllocationStatus::Retrying => self.attempt(allocation).await,
            // Interrupted between FAILED and RETRYING
            AllocationStatus::Failed if allocation.can_retry() => {
                let mut allocation = allocation;
                allocation.transition(AllocationStatus::Retrying)?;
                match self
                    .store
                    .update_allocation(
                        &allocation,
                        AllocationStatus::Failed,
                        allocation.attempt_count,
                    )
                    .await
                {
                    Ok(()) => self.attempt(allocation).await,
                    Err(e) if e.is_conflict() => self.reload(&allocation.id).await,
                    Err(e) => Err(e.into()),
                }
            }
            status => {
                debug!(allocation_id = %allocation.id, %status, "Allocation needs no attempt");
                Ok(allocation)
            }
        }
    }

    async fn attempt(&self, mut allocation: ProfitAllocation) -> AllocationResult<ProfitAllocation> {
        let claimed_from = allocation.status;
        let claimed_attempt = allocation.attempt_count;
        allocation.transition(AllocationStatus::Processing)?;
        allocation.attempt_count += 1;
        allocation.last_attempt_at = Some(timestamp_now());
        allocation.error_message = None;

        match self
            .store
            .update_allocation(&allocation, claimed_from, claimed_attempt)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(allocation_id = %allocation.id, "Allocation claimed by another worker");
                return self.reload(&allocation.id).await;
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            allocation_id = %allocation.id,
            transaction_id = %allocation.transaction_id,
            attempt = allocation.attempt_count,
            max_attempts = allocation.max_attempts,
            "Allocation attempt started"
        );

        let outcome = match self.execute_transfers(&mut allocation).await {
            Ok(()) => self.ledger.append(&allocation).await.map_err(AllocationError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(appended) => {
                counter!("splitledger_allocations_completed_total").increment(1);
                info!(
                    allocation_id = %allocation.id,
                    hash = %appended.hash,
                    chain_position = appended.chain_position,
                    "Allocation completed"
                );
                self.emit(LedgerEvent::AllocationCompleted {
                    allocation_id: allocation.id,
                    transaction_id: allocation.transaction_id,
                    hash: appended.hash.clone(),
                    chain_position: appended.chain_position,
                    timestamp: timestamp_now(),
                });
                Ok(appended.allocation)
            }
            Err(e) => self.fail(allocation, e.to_string()).await,
        }
    }

    /// Pay out every share that still needs it, persisting each reference
    async fn execute_transfers(&self, allocation: &mut ProfitAllocation) -> AllocationResult<()> {
        for index in 0..allocation.shares.len() {
            if !allocation.shares[index].needs_transfer() {
                continue;
            }

            let share = &allocation.shares[index];
            let request = TransferRequest {
                amount_minor: share.amount_minor,
                currency: allocation.currency.clone(),
                beneficiary_account: share.account_ref.clone(),
                correlation_id: TransferRequest::correlation_id(&allocation.id, &share.beneficiary),
            };

            let started = Instant::now();
            let result =
                tokio::time::timeout(self.config.transfer_timeout, self.sink.transfer(&request)).await;
            histogram!("splitledger_transfer_seconds").record(started.elapsed().as_secs_f64());

            let receipt = match result {
                Ok(Ok(receipt)) => receipt,
                Ok(Err(e)) => {
                    warn!(
                        allocation_id = %allocation.id,
                        beneficiary = %allocation.shares[index].beneficiary,
                        error = %e,
                        "Transfer failed"
                    );
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(
                        allocation_id = %allocation.id,
                        beneficiary = %allocation.shares[index].beneficiary,
                        "Transfer timed out"
                    );
                    return Err(TransferError::timeout(self.config.transfer_timeout).into());
                }
            };

            allocation.shares[index].transfer_ref = Some(receipt.reference);
            self.store
                .update_allocation(
                    allocation,
                    AllocationStatus::Processing,
                    allocation.attempt_count,
                )
                .await?;
        }
        Ok(())
    }

    /// Record a failed attempt and decide between retry and terminal failure
    async fn fail(
        &self,
        mut allocation: ProfitAllocation,
        reason: String,
    ) -> AllocationResult<ProfitAllocation> {
        allocation.transition(AllocationStatus::Failed)?;
        allocation.error_message = Some(reason.clone());
        allocation.hash = None;
        allocation.previous_hash = None;

        match self
            .store
            .update_allocation(
                &allocation,
                AllocationStatus::Processing,
                allocation.attempt_count,
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() || matches!(e, DbError::ImmutableRecord { .. }) => {
                return self.reload(&allocation.id).await
            }
            Err(e) => return Err(e.into()),
        }
        counter!("splitledger_allocations_failed_total").increment(1);

        let terminal = !allocation.can_retry();
        if terminal {
            counter!("splitledger_allocations_terminal_failed_total").increment(1);
            error!(
                allocation_id = %allocation.id,
                transaction_id = %allocation.transaction_id,
                attempts = allocation.attempt_count,
                error = %reason,
                "Allocation failed terminally; manual intervention required"
            );
        } else {
            allocation.transition(AllocationStatus::Retrying)?;
            match self
                .store
                .update_allocation(
                    &allocation,
                    AllocationStatus::Failed,
                    allocation.attempt_count,
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => return self.reload(&allocation.id).await,
                Err(e) => return Err(e.into()),
            }
            warn!(
                allocation_id = %allocation.id,
                attempt = allocation.attempt_count,
                max_attempts = allocation.max_attempts,
                error = %reason,
                "Allocation attempt failed; scheduled for retry"
            );
        }

        self.emit(LedgerEvent::AllocationFailed {
            allocation_id: allocation.id,
            transaction_id: allocation.transaction_id,
            attempt_count: allocation.attempt_count,
            terminal,
            error: reason,
            timestamp: timestamp_now(),
        });

        Ok(allocation)
    }
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("config", &self.config)
            .finish()
    }
}
