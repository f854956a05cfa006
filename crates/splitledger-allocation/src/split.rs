//! Split computation
//!
//! Each share is `trunc(amount * percent / 100)` in minor units; whatever
//! truncation leaves over goes to the primary share, so the shares always
//! sum to the transaction amount exactly.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use splitledger_types::{Result, ShareAmount, SplitConfig, SplitLedgerError};

/// Split `amount_minor` according to `config`, in configuration order
pub fn compute_split(amount_minor: i64, config: &SplitConfig) -> Result<Vec<ShareAmount>> {
    config.validate()?;
    if amount_minor <= 0 {
        return Err(SplitLedgerError::InvalidAmount {
            message: format!("allocation amount must be positive, got {amount_minor}"),
        });
    }

    let primary = config.primary_index().ok_or_else(|| {
        SplitLedgerError::InvalidSplit(format!("primary share {} missing", config.primary))
    })?;

    let amount = Decimal::from(amount_minor);
    let mut shares = Vec::with_capacity(config.shares.len());
    let mut assigned: i64 = 0;

    for share in &config.shares {
        let portion = amount
            .checked_mul(share.percent)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .ok_or(SplitLedgerError::AmountOverflow)?
            .trunc()
            .to_i64()
            .ok_or(SplitLedgerError::AmountOverflow)?;

        assigned = assigned
            .checked_add(portion)
            .ok_or(SplitLedgerError::AmountOverflow)?;
        shares.push(ShareAmount {
            beneficiary: share.name.clone(),
            account_ref: share.account_ref.clone(),
            amount_minor: portion,
            transfer_ref: None,
        });
    }

    let residual = amount_minor - assigned;
    shares[primary].amount_minor += residual;

    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use splitledger_types::BeneficiaryShare;

    fn config(percents: &[(&str, Decimal)], primary: &str) -> SplitConfig {
        SplitConfig {
            shares: percents
                .iter()
                .map(|(name, percent)| BeneficiaryShare {
                    name: name.to_string(),
                    percent: *percent,
                    account_ref: format!("acct_{name}"),
                })
                .collect(),
            primary: primary.to_string(),
        }
    }

    fn amounts(shares: &[ShareAmount]) -> Vec<i64> {
        shares.iter().map(|s| s.amount_minor).collect()
    }

    #[test]
    fn test_whole_amount_to_single_beneficiary() {
        let cfg = config(&[("ops", dec!(100)), ("reserve", dec!(0)), ("founder", dec!(0))], "ops");
        assert_eq!(amounts(&compute_split(1499, &cfg).unwrap()), vec![1499, 0, 0]);
    }

    #[test]
    fn test_residual_goes_to_primary() {
        let cfg = config(&[("ops", dec!(70)), ("reserve", dec!(20)), ("founder", dec!(10))], "ops");
        // 1049.3 / 299.8 / 149.9 truncated, 2 left over
        assert_eq!(amounts(&compute_split(1499, &cfg).unwrap()), vec![1051, 299, 149]);
    }

    #[test]
    fn test_residual_to_non_first_primary() {
        let cfg = config(
            &[("a", dec!(33.33)), ("b", dec!(33.33)), ("c", dec!(33.34))],
            "c",
        );
        let shares = compute_split(100, &cfg).unwrap();
        assert_eq!(amounts(&shares), vec![33, 33, 34]);
    }

    #[test]
    fn test_one_minor_unit() {
        let cfg = config(&[("ops", dec!(70)), ("reserve", dec!(20)), ("founder", dec!(10))], "ops");
        assert_eq!(amounts(&compute_split(1, &cfg).unwrap()), vec![1, 0, 0]);
    }

    #[test]
    fn test_conservation_across_amounts() {
        let cfg = config(
            &[("ops", dec!(61.5)), ("reserve", dec!(25.25)), ("founder", dec!(13.25))],
            "reserve",
        );
        for amount in (1..2_000).chain([999_999, 1_000_000_007, i64::MAX / 1_000]) {
            let shares = compute_split(amount, &cfg).unwrap();
            assert_eq!(shares.iter().map(|s| s.amount_minor).sum::<i64>(), amount);
            assert!(shares.iter().all(|s| s.amount_minor >= 0));
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = config(&[("ops", dec!(70)), ("reserve", dec!(20))], "ops");
        assert!(matches!(
            compute_split(1000, &cfg),
            Err(SplitLedgerError::SplitTotal { .. })
        ));
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let cfg = config(&[("ops", dec!(100))], "ops");
        assert!(compute_split(0, &cfg).is_err());
        assert!(compute_split(-5, &cfg).is_err());
    }

    #[test]
    fn test_account_refs_carried() {
        let cfg = config(&[("ops", dec!(100))], "ops");
        let shares = compute_split(10, &cfg).unwrap();
        assert_eq!(shares[0].account_ref, "acct_ops");
        assert!(shares[0].transfer_ref.is_none());
    }
}
