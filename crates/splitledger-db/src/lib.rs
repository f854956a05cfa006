//! SplitLedger Database Layer
//!
//! Persistence for transactions, allocations and the idempotency window.
//!
//! # Backends
//!
//! - **PostgreSQL** (`PgStore`): durable transaction/allocation store; the
//!   ledger tail lives in a single-row table updated by compare-and-set
//! - **In-memory** (`MemoryStore`): same guarantees behind one write lock,
//!   used by tests and development runs
//! - **Redis** (`RedisIdempotencyStore`): shared idempotency window with
//!   native key expiry; `MemoryIdempotencyStore` is the in-process fallback
//!
//! Uniqueness (one transaction per external payment id, one allocation per
//! transaction) and the tail compare-and-set are enforced by storage, never
//! by application locks.

pub mod config;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use config::DatabaseConfig;
pub use error::{DbError, DbResult};
pub use idempotency::{
    IdempotencyGuard, IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{AllocationStore, LedgerStore, TransactionStore};
