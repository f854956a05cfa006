//! SplitLedger Allocation - Turning recorded payments into paid-out splits
//!
//! - [`compute_split`]: exact integer split of a minor-unit amount
//! - [`AllocationEngine`]: the allocation state machine, one attempt at a time
//! - [`TransferSink`]: the external payout collaborator
//! - [`RetryScheduler`]: background worker resuming retrying and stale work
//!
//! # Attempt flow
//!
//! ```text
//! claim (CAS → PROCESSING, attempt + 1) → transfers (each under timeout,
//! reference persisted) → ledger append (hash, tail CAS) → COMPLETED
//!                         └── any failure → FAILED → RETRYING | terminal
//! ```

pub mod engine;
pub mod error;
pub mod scheduler;
pub mod split;
pub mod transfer;

pub use engine::{AllocationEngine, EngineConfig};
pub use error::{AllocationError, AllocationResult};
pub use scheduler::{RetryScheduler, SchedulerConfig, TickReport};
pub use split::compute_split;
pub use transfer::{
    HttpTransferSink, LoggingTransferSink, TransferError, TransferReceipt, TransferRequest,
    TransferSink,
};
