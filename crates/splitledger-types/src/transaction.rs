//! Recorded payment transactions
//!
//! A transaction is written once per external payment id and never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{timestamp_now, Currency, RevenueSource, TransactionId};

/// Durable record of a confirmed payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Processor payment id (unique)
    pub external_payment_id: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub source: RevenueSource,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Amount in major units
    pub fn amount(&self) -> Decimal {
        self.currency.to_major(self.amount_minor)
    }
}

/// Input for creating a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub external_payment_id: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub source: RevenueSource,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
}

impl NewTransaction {
    /// Assign an id and creation time
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            id: TransactionId::new(),
            external_payment_id: self.external_payment_id,
            amount_minor: self.amount_minor,
            currency: self.currency,
            source: self.source,
            description: self.description,
            metadata: self.metadata,
            created_at: timestamp_now(),
        }
    }
}
