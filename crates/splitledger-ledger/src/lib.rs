//! SplitLedger Ledger - Hash-chained allocation records
//!
//! Every completed allocation carries the hash of its predecessor, so the
//! completed allocations form a single chain back to the genesis sentinel.
//! Editing any stored record breaks its own hash or its successor's link,
//! and [`verify_chain`] names the first record that fails. Dropping records
//! from the end is caught by [`LedgerChain::verify`], which also compares
//! the verified tail with the stored one.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use splitledger_db::{AllocationStore, DbError, LedgerStore, TransactionStore};
use splitledger_types::{
    timestamp_now, AllocationId, AllocationStatus, ProfitAllocation, SplitLedgerError, GENESIS_HASH,
};

/// Default number of tail reads before `append` gives up under contention
pub const DEFAULT_MAX_APPEND_ATTEMPTS: u32 = 16;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Store(#[from] DbError),

    #[error("Hash serialization failed: {0}")]
    Serialization(String),

    /// The allocation cannot become a ledger entry yet
    #[error("Allocation {allocation_id} cannot be appended: {reason}")]
    NotAppendable {
        allocation_id: AllocationId,
        reason: String,
    },

    #[error(transparent)]
    Domain(#[from] SplitLedgerError),

    /// The tail kept moving; the allocation stays `PROCESSING`
    #[error("Ledger tail contended for {attempts} attempts")]
    TailContention { attempts: u32 },
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

// ============================================================================
// Canonical hashing
// ============================================================================

#[derive(Serialize)]
struct CanonicalShare<'a> {
    beneficiary: &'a str,
    account_ref: &'a str,
    amount_minor: i64,
    transfer_ref: Option<&'a str>,
}

/// Fixed-order view of the hashed fields
#[derive(Serialize)]
struct CanonicalAllocation<'a> {
    allocation_id: String,
    transaction_id: String,
    amount_minor: i64,
    currency: &'a str,
    shares: Vec<CanonicalShare<'a>>,
    previous_hash: &'a str,
    created_at: String,
    executed_at: Option<String>,
}

/// Canonical bytes for an allocation linked to `previous_hash`.
///
/// Covers every stored field of a completed record except the status
/// bookkeeping (`status`, attempts, error message, chain position).
pub fn canonical_payload(allocation: &ProfitAllocation, previous_hash: &str) -> LedgerResult<Vec<u8>> {
    let canonical = CanonicalAllocation {
        allocation_id: allocation.id.as_uuid().to_string(),
        transaction_id: allocation.transaction_id.as_uuid().to_string(),
        amount_minor: allocation.amount_minor,
        currency: allocation.currency.code(),
        shares: allocation
            .shares
            .iter()
            .map(|s| CanonicalShare {
                beneficiary: &s.beneficiary,
                account_ref: &s.account_ref,
                amount_minor: s.amount_minor,
                transfer_ref: s.transfer_ref.as_deref(),
            })
            .collect(),
        previous_hash,
        created_at: allocation
            .created_at
            .to_rfc3339_opts(SecondsFormat::Micros, true),
        executed_at: allocation
            .executed_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
    };
    Ok(serde_json::to_vec(&canonical)?)
}

/// Hex SHA-256 of the canonical payload
pub fn compute_hash(allocation: &ProfitAllocation, previous_hash: &str) -> LedgerResult<String> {
    let payload = canonical_payload(allocation, previous_hash)?;
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// Verification
// ============================================================================

/// Why a chain entry failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreak {
    /// Stored hash differs from the recomputed one
    HashMismatch,
    /// `previous_hash` does not point at the preceding entry
    BrokenLink,
    /// A chain entry is not `COMPLETED`
    NotCompleted,
}

/// Result of walking the chain from genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChainVerification {
    Valid {
        length: usize,
        tail: String,
    },
    Broken {
        position: usize,
        allocation_id: AllocationId,
        reason: ChainBreak,
    },
    /// Every listed record verifies, but the chain stops short of the
    /// stored tail: completed records were removed or reverted
    Truncated {
        length: usize,
        tail: String,
        stored_tail: String,
    },
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Verify completed allocations in chain order, genesis first.
///
/// Reports the first failing record; never repairs anything.
pub fn verify_chain(records: &[ProfitAllocation]) -> ChainVerification {
    let mut expected_previous = GENESIS_HASH.to_string();

    for (position, record) in records.iter().enumerate() {
        let broken = |reason| ChainVerification::Broken {
            position,
            allocation_id: record.id,
            reason,
        };

        if record.status != AllocationStatus::Completed {
            return broken(ChainBreak::NotCompleted);
        }
        if record.previous_hash.as_deref() != Some(expected_previous.as_str()) {
            return broken(ChainBreak::BrokenLink);
        }

        let recomputed = match compute_hash(record, &expected_previous) {
            Ok(hash) => hash,
            Err(_) => return broken(ChainBreak::HashMismatch),
        };
        match record.hash.as_deref() {
            Some(stored) if stored == recomputed => expected_previous = recomputed,
            _ => return broken(ChainBreak::HashMismatch),
        }
    }

    ChainVerification::Valid {
        length: records.len(),
        tail: expected_previous,
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Outcome of a successful append
#[derive(Debug, Clone)]
pub struct Appended {
    pub hash: String,
    pub chain_position: u64,
    /// The stored `COMPLETED` record
    pub allocation: ProfitAllocation,
}

/// Append and verify operations over a [`LedgerStore`]
#[derive(Clone)]
pub struct LedgerChain {
    store: Arc<dyn LedgerStore>,
    max_attempts: u32,
}

impl LedgerChain {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_APPEND_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Complete a `PROCESSING` allocation and make it the ledger tail.
    ///
    /// The hash is computed here, over the finished record and the tail
    /// read just before the compare-and-set, so chain order is completion
    /// order. On any error the stored allocation is left `PROCESSING`.
    pub async fn append(&self, allocation: &ProfitAllocation) -> LedgerResult<Appended> {
        if allocation.status != AllocationStatus::Processing {
            return Err(LedgerError::NotAppendable {
                allocation_id: allocation.id,
                reason: format!("status is {}", allocation.status),
            });
        }
        if !allocation.all_transfers_recorded() {
            return Err(LedgerError::NotAppendable {
                allocation_id: allocation.id,
                reason: "transfers outstanding".to_string(),
            });
        }

        let executed_at = timestamp_now();

        for attempt in 1..=self.max_attempts {
            let tail = self.store.find_latest_allocation_hash().await?;

            let mut candidate = allocation.clone();
            candidate.transition(AllocationStatus::Completed)?;
            candidate.error_message = None;
            candidate.executed_at = Some(executed_at);
            let hash = compute_hash(&candidate, &tail)?;
            candidate.hash = Some(hash.clone());
            candidate.previous_hash = Some(tail.clone());

            match self.store.complete_allocation(&candidate, &tail).await {
                Ok(position) => {
                    candidate.chain_position = Some(position);
                    return Ok(Appended {
                        hash,
                        chain_position: position,
                        allocation: candidate,
                    });
                }
                Err(DbError::ChainConflict { actual, .. }) => {
                    debug!(allocation_id = %allocation.id, attempt, tail = %actual, "Ledger tail moved");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            allocation_id = %allocation.id,
            attempts = self.max_attempts,
            "Ledger append gave up under tail contention"
        );
        Err(LedgerError::TailContention {
            attempts: self.max_attempts,
        })
    }

    /// Load the stored chain and verify it against the stored tail
    pub async fn verify(&self) -> LedgerResult<ChainVerification> {
        for _ in 0..self.max_attempts {
            let stored_tail = self.store.find_latest_allocation_hash().await?;
            let records = self.store.list_chain().await?;
            // An append landed between the two reads
            if self.store.find_latest_allocation_hash().await? != stored_tail {
                continue;
            }

            let verification = match verify_chain(&records) {
                ChainVerification::Valid { length, tail } if tail != stored_tail => {
                    ChainVerification::Truncated {
                        length,
                        tail,
                        stored_tail,
                    }
                }
                other => other,
            };

            match &verification {
                ChainVerification::Broken {
                    position,
                    allocation_id,
                    reason,
                } => error!(
                    position,
                    allocation_id = %allocation_id,
                    reason = ?reason,
                    "Ledger chain integrity check failed"
                ),
                ChainVerification::Truncated {
                    length,
                    tail,
                    stored_tail,
                } => error!(
                    length,
                    tail = %tail,
                    stored_tail = %stored_tail,
                    "Ledger chain ends before the stored tail"
                ),
                ChainVerification::Valid { .. } => {}
            }
            return Ok(verification);
        }

        Err(LedgerError::TailContention {
            attempts: self.max_attempts,
        })
    }
}
