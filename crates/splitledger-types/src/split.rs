//! Beneficiary split configuration
//!
//! Percentages are fixed configuration. A configuration that does not sum
//! to exactly 100 is rejected at startup, never at runtime.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{Result, SplitLedgerError};

/// One beneficiary and its fixed percentage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeneficiaryShare {
    pub name: String,
    /// Percentage of the transaction amount, 0 to 100
    pub percent: Decimal,
    /// Payout account reference handed to the transfer sink
    pub account_ref: String,
}

/// The full split: ordered shares plus the share receiving rounding residue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub shares: Vec<BeneficiaryShare>,
    /// Name of the share that absorbs truncation remainders
    pub primary: String,
}

impl SplitConfig {
    /// Check every structural invariant of the split
    pub fn validate(&self) -> Result<()> {
        if self.shares.is_empty() {
            return Err(SplitLedgerError::InvalidSplit("no beneficiaries configured".to_string()));
        }

        let mut seen = HashSet::new();
        for share in &self.shares {
            if share.name.trim().is_empty() {
                return Err(SplitLedgerError::InvalidSplit("beneficiary name is empty".to_string()));
            }
            if !seen.insert(share.name.as_str()) {
                return Err(SplitLedgerError::InvalidSplit(format!(
                    "duplicate beneficiary {}",
                    share.name
                )));
            }
            if share.percent < Decimal::ZERO || share.percent > Decimal::ONE_HUNDRED {
                return Err(SplitLedgerError::InvalidSplit(format!(
                    "percent for {} out of range: {}",
                    share.name, share.percent
                )));
            }
        }

        let total: Decimal = self.shares.iter().map(|s| s.percent).sum();
        if total != Decimal::ONE_HUNDRED {
            return Err(SplitLedgerError::SplitTotal {
                total: total.to_string(),
            });
        }

        if !seen.contains(self.primary.as_str()) {
            return Err(SplitLedgerError::InvalidSplit(format!(
                "primary share {} is not a configured beneficiary",
                self.primary
            )));
        }

        Ok(())
    }

    /// Index of the primary share
    pub fn primary_index(&self) -> Option<usize> {
        self.shares.iter().position(|s| s.name == self.primary)
    }
}
