//! SplitLedger Types - Canonical domain types for payment allocation
//!
//! This crate contains the foundational types shared by every SplitLedger
//! crate, with zero dependencies on other splitledger crates:
//!
//! - Identity types (TransactionId, AllocationId)
//! - Currency and minor-unit conversions
//! - Inbound processor events (PaymentEvent)
//! - Durable records (Transaction, ProfitAllocation)
//! - Split configuration and ledger events
//!
//! # Lifecycle
//!
//! ```text
//! PaymentEvent → Transaction → ProfitAllocation(PENDING) → ... → COMPLETED (ledger tail)
//! ```

pub mod identity;
pub mod currency;
pub mod payment;
pub mod transaction;
pub mod allocation;
pub mod split;
pub mod event;
pub mod error;

pub use identity::*;
pub use currency::*;
pub use payment::*;
pub use transaction::*;
pub use allocation::*;
pub use split::*;
pub use event::*;
pub use error::*;

use chrono::{DateTime, SubsecRound, Utc};

/// `previous_hash` of the first record in the ledger chain
pub const GENESIS_HASH: &str = "GENESIS";

/// Current time truncated to microseconds.
///
/// Hashed timestamps must survive a round trip through PostgreSQL
/// `TIMESTAMPTZ`, which stores microsecond precision.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_timestamp_is_microsecond_precision() {
        let ts = timestamp_now();
        assert_eq!(ts.nanosecond() % 1_000, 0);
    }
}
