//! Brute-forceable feerate window.
//!
//! The commitment and HTLC transactions were all built at one
//! feerate, but it is never transmitted with the signatures, so it
//! has to be rediscovered by trial signature verification.  The
//! window starts as wide as the commitment transaction allows and
//! narrows every time a fee is confirmed against a signature.

use bitcoin::Transaction;
use log::debug;

use crate::error::{Error, Result};

/// Commitment transaction base weight (BOLT #3)
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// Commitment transaction weight per untrimmed HTLC output (BOLT #3)
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;
/// HTLC-timeout transaction weight (BOLT #3)
pub const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;

/// Fee of an HTLC-timeout transaction at `feerate_per_kw`
pub fn htlc_timeout_fee(feerate_per_kw: u32) -> u64 {
    feerate_per_kw as u64 * HTLC_TIMEOUT_TX_WEIGHT / 1000
}

/// Inclusive `[min, max]` feerate bounds in sat per kiloweight
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeerateRange {
    pub min: u32,
    pub max: u32,
}

impl FeerateRange {
    /// Seed the range from a commitment transaction.  We do not know
    /// how many trimmed HTLCs went entirely to fees, so the minimum is
    /// zero, and the maximum assumes every non-main output was an
    /// untrimmed HTLC.
    pub fn from_commitment(funding_satoshi: u64, commit_tx: &Transaction) -> Result<FeerateRange> {
        let spent: u64 = commit_tx.output.iter().map(|out| out.value.to_sat()).sum();
        let fee = funding_satoshi.checked_sub(spent).ok_or_else(|| {
            Error::InternalError(format!(
                "commitment outputs {} exceed funding {}",
                spent, funding_satoshi
            ))
        })?;

        let max_untrimmed_htlcs = commit_tx.output.len().saturating_sub(2) as u64;
        let max = (fee + 999) * 1000
            / (COMMITMENT_TX_BASE_WEIGHT + COMMITMENT_TX_WEIGHT_PER_HTLC * max_untrimmed_htlcs);
        let range = FeerateRange { min: 0, max: max.min(u32::MAX as u64) as u32 };
        debug!("initial feerate {} to {}", range.min, range.max);
        Ok(range)
    }

    /// Narrow the range after confirming that a transaction of weight
    /// `multiplier` paid `fee`.  The window may only shrink; an empty
    /// window means the counterparty's signatures are inconsistent.
    pub fn narrow(&mut self, fee: u64, multiplier: u64) -> Result<()> {
        let max = ((fee + 999) * 1000 / multiplier).min(u32::MAX as u64) as u32;
        let min = if fee < 999 {
            0
        } else {
            ((fee - 999) * 1000 / multiplier).min(u32::MAX as u64) as u32
        };
        debug!("fee {} gives feerate min/max {}/{}", fee, min, max);

        if max < self.max {
            self.max = max;
        }
        if min > self.min {
            self.min = min;
        }
        debug!("feerate now {} to {}", self.min, self.max);

        if self.min > self.max {
            return Err(Error::InternalError(format!(
                "feerate range emptied: {} > {}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}
