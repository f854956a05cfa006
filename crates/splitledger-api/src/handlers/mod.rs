//! Request handlers

pub mod allocations;
pub mod health;
pub mod ledger;
pub mod transactions;
pub mod webhook;
