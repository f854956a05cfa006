//! Currency codes and minor-unit conversion
//!
//! Processors report amounts in minor units (cents). All allocation math
//! happens on those integers; `Decimal` is only used to present major units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, SplitLedgerError};

/// ISO 4217 currency code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse a three-letter code, normalising to upper case
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SplitLedgerError::InvalidCurrency { code });
        }
        Ok(Self(code))
    }

    /// US dollar
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    /// The ISO 4217 code
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal places in the minor unit
    pub fn exponent(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" | "XAF" | "XOF" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
            _ => 2,
        }
    }

    /// Convert a minor-unit amount to major units
    pub fn to_major(&self, minor: i64) -> Decimal {
        Decimal::new(minor, self.exponent())
    }

    /// Convert a major-unit amount to minor units.
    ///
    /// Fails rather than rounds when the amount carries more precision
    /// than the currency allows.
    pub fn to_minor(&self, major: Decimal) -> Result<i64> {
        let scaled = major
            .checked_mul(Decimal::from(10i64.pow(self.exponent())))
            .ok_or(SplitLedgerError::AmountOverflow)?;
        if !scaled.fract().is_zero() {
            return Err(SplitLedgerError::PrecisionLoss {
                amount: major.to_string(),
                currency: self.0.clone(),
            });
        }
        scaled.to_i64().ok_or(SplitLedgerError::AmountOverflow)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Currency {
    type Error = SplitLedgerError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}
