//! Inbound payment processor events
//!
//! The envelope follows the Square/Stripe webhook shape:
//!
//! ```text
//! { "type": "payment.updated", "event_id": "...",
//!   "data": { "object": { "payment": { "id", "amount_money", "status", ... } } } }
//! ```
//!
//! Events are never persisted verbatim; only the fields needed to build a
//! [`NewTransaction`] are extracted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Currency, NewTransaction, Result, SplitLedgerError};

/// Processor event envelope as received
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Processor event type, e.g. `payment.updated`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Processor-assigned event id
    #[serde(default)]
    pub event_id: Option<String>,
    /// Merchant the event belongs to
    #[serde(default)]
    pub merchant_id: Option<String>,
    pub data: PaymentEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventData {
    #[serde(default, rename = "type")]
    pub object_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    pub object: PaymentEventObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventObject {
    #[serde(default)]
    pub payment: Option<Payment>,
}

/// The processor's payment object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// External payment id, unique per processor
    pub id: String,
    pub amount_money: Money,
    /// Processor status, `COMPLETED` once funds are captured
    pub status: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Merchant-side reference, used to classify the revenue source
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Amount in minor units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

impl PaymentEvent {
    /// Whether this event type carries a payment
    pub fn is_payment_event(&self) -> bool {
        self.event_type.starts_with("payment.")
    }

    /// The nested payment object, if any
    pub fn payment(&self) -> Option<&Payment> {
        self.data.object.payment.as_ref()
    }

    /// Extract the transaction input from a completed payment event
    pub fn to_new_transaction(&self) -> Result<NewTransaction> {
        let payment = self
            .payment()
            .ok_or_else(|| SplitLedgerError::InvalidPayment("event has no payment object".to_string()))?;

        if payment.id.trim().is_empty() {
            return Err(SplitLedgerError::InvalidPayment("payment id is empty".to_string()));
        }
        if payment.amount_money.amount <= 0 {
            return Err(SplitLedgerError::InvalidAmount {
                message: format!("payment amount must be positive, got {}", payment.amount_money.amount),
            });
        }

        let currency = Currency::new(&payment.amount_money.currency)?;
        let source = payment.source();

        let mut metadata = BTreeMap::new();
        metadata.insert("processor_event_type".to_string(), self.event_type.clone());
        if let Some(event_id) = &self.event_id {
            metadata.insert("processor_event_id".to_string(), event_id.clone());
        }
        if let Some(merchant_id) = &self.merchant_id {
            metadata.insert("merchant_id".to_string(), merchant_id.clone());
        }
        if let Some(order_id) = &payment.order_id {
            metadata.insert("order_id".to_string(), order_id.clone());
        }
        if let Some(customer_id) = &payment.customer_id {
            metadata.insert("customer_id".to_string(), customer_id.clone());
        }
        if let Some(reference_id) = &payment.reference_id {
            metadata.insert("reference_id".to_string(), reference_id.clone());
        }

        let description = payment
            .note
            .clone()
            .unwrap_or_else(|| format!("{} payment {}", source, payment.id));

        Ok(NewTransaction {
            external_payment_id: payment.id.clone(),
            amount_minor: payment.amount_money.amount,
            currency,
            source,
            description,
            metadata,
        })
    }
}

impl Payment {
    /// Whether the processor reports the payment as captured
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("COMPLETED")
    }

    /// Revenue channel derived from the merchant reference
    pub fn source(&self) -> RevenueSource {
        self.reference_id
            .as_deref()
            .map(RevenueSource::from_reference)
            .unwrap_or(RevenueSource::Other)
    }
}

/// Product or channel that generated the revenue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueSource {
    Subscription,
    ProfileUnlock,
    Boost,
    Marketplace,
    Other,
}

impl RevenueSource {
    /// Classify a merchant reference id by its prefix
    pub fn from_reference(reference: &str) -> Self {
        let reference = reference.to_ascii_lowercase();
        if reference.starts_with("sub_") || reference.starts_with("subscription") {
            Self::Subscription
        } else if reference.starts_with("unlock_") {
            Self::ProfileUnlock
        } else if reference.starts_with("boost_") {
            Self::Boost
        } else if reference.starts_with("order_") || reference.starts_with("shop_") {
            Self::Marketplace
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::ProfileUnlock => "profile_unlock",
            Self::Boost => "boost",
            Self::Marketplace => "marketplace",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for RevenueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevenueSource {
    type Err = SplitLedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "profile_unlock" => Ok(Self::ProfileUnlock),
            "boost" => Ok(Self::Boost),
            "marketplace" => Ok(Self::Marketplace),
            "other" => Ok(Self::Other),
            other => Err(SplitLedgerError::UnknownRevenueSource(other.to_string())),
        }
    }
}
