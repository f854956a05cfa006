//! Request and response bodies

pub mod ledger;
pub mod webhook;

pub use ledger::*;
pub use webhook::*;
