//! Taking a consistent snapshot of the three ledgers.
//!
//! The vault balance ledger and the wrap request ledger follow the native chain, the unwrap
//! request ledger follows the other chain. They are fed by independent pipelines, so at any
//! time each of them is synced up to a different point. A rate may only be computed at a native
//! height for which the three ledgers are known to be complete up to the same point in time,
//! otherwise a wrap could be accounted before the vault inflow backing it (or the other way
//! around) and the rate would be transiently wrong.

use crate::{
    database::{balance::BalanceChangeLedger, requests::RequestLedger, DatabaseError},
    rate::{ConversionError, ConversionRateCalculator},
};

use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum RateError {
    Database(DatabaseError),
    Conversion(ConversionError),
}

impl fmt::Display for RateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Database(e) => write!(f, "{}", e),
            Self::Conversion(e) => write!(f, "Computing conversion rate: {}", e),
        }
    }
}

impl std::error::Error for RateError {}

impl From<DatabaseError> for RateError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

impl From<ConversionError> for RateError {
    fn from(e: ConversionError) -> Self {
        Self::Conversion(e)
    }
}

/// Why no rate can be computed at a given height (yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotSyncedReason {
    /// The vault balance is not known up to this height
    BalanceBehind { requested: i64, available: i64 },
    /// The wrap requests are not known up to this height
    WrapRequestsBehind { requested: i64, available: i64 },
    /// We can't tell when this height was made
    NoTimestamp { height: i64 },
    /// The unwrap requests are not known up to this point in time
    UnwrapRequestsBehind { timestamp: i64 },
    /// The ledgers are synced but their balances can't make up a rate
    InconsistentBalances(ConversionError),
}

impl fmt::Display for NotSyncedReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BalanceBehind {
                requested,
                available,
            } => write!(
                f,
                "balance changes synced up to {}, not {}",
                available, requested
            ),
            Self::WrapRequestsBehind {
                requested,
                available,
            } => write!(
                f,
                "wrap requests synced up to {}, not {}",
                available, requested
            ),
            Self::NoTimestamp { height } => write!(f, "no block time known for height {}", height),
            Self::UnwrapRequestsBehind { timestamp } => {
                write!(f, "unwrap requests not synced up to time {}", timestamp)
            }
            Self::InconsistentBalances(e) => write!(f, "inconsistent balances: {}", e),
        }
    }
}

/// A calculator, along with the native height it was computed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchoredCalculator {
    pub height: i64,
    pub calculator: ConversionRateCalculator,
    pub unwrap_mode: bool,
}

impl AnchoredCalculator {
    /// Convert a request amount into its payout amount.
    pub fn convert(&self, amount: u64) -> Result<u64, ConversionError> {
        (self.calculator.to_conversion_function(self.unwrap_mode))(amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateSnapshot {
    Ready(AnchoredCalculator),
    NotSynced(NotSyncedReason),
}

impl RateSnapshot {
    pub fn ready(self) -> Option<AnchoredCalculator> {
        match self {
            Self::Ready(calc) => Some(calc),
            Self::NotSynced(_) => None,
        }
    }
}

pub struct ConversionRateCalculatorFactory<'a> {
    balance_changes: &'a BalanceChangeLedger,
    /// The requests made on the native chain
    wrap_requests: &'a RequestLedger,
    /// The requests made on the other chain
    unwrap_requests: &'a RequestLedger,
    currency: String,
    unwrap_mode: bool,
}

impl<'a> ConversionRateCalculatorFactory<'a> {
    pub fn new(
        balance_changes: &'a BalanceChangeLedger,
        wrap_requests: &'a RequestLedger,
        unwrap_requests: &'a RequestLedger,
        currency: impl Into<String>,
        unwrap_mode: bool,
    ) -> Self {
        Self {
            balance_changes,
            wrap_requests,
            unwrap_requests,
            currency: currency.into(),
            unwrap_mode,
        }
    }

    /// Compute a calculator at this native height, if all ledgers are synced up to it. Only
    /// storage failures are errors. A drained vault gets the bootstrap rate.
    pub fn try_create_calculator(&self, height: i64) -> Result<RateSnapshot, RateError> {
        if !self.balance_changes.is_synced_at_height(height)? {
            return Ok(RateSnapshot::NotSynced(NotSyncedReason::BalanceBehind {
                requested: height,
                available: self.balance_changes.watermark()?,
            }));
        }

        let available = self.wrap_requests.watermark()?;
        if height > available {
            return Ok(RateSnapshot::NotSynced(
                NotSyncedReason::WrapRequestsBehind {
                    requested: height,
                    available,
                },
            ));
        }

        let timestamp = match self.wrap_requests.lookup_closest_block_timestamp(height)? {
            Some(sample) => sample.timestamp,
            None => return Ok(RateSnapshot::NotSynced(NotSyncedReason::NoTimestamp { height })),
        };

        if !self.unwrap_requests.is_synced_at_timestamp(timestamp)? {
            return Ok(RateSnapshot::NotSynced(
                NotSyncedReason::UnwrapRequestsBehind { timestamp },
            ));
        }

        let native_balance = self.balance_changes.balance_at(height, &self.currency)?;
        let wrapped_balance = self.wrap_requests.cumulative_net_amount_at(timestamp)?;
        let unwrapped_balance = self.unwrap_requests.cumulative_net_amount_at(timestamp)?;
        let calculator = match ConversionRateCalculator::from_balances(
            native_balance,
            wrapped_balance,
            unwrapped_balance,
        ) {
            Ok(calculator) => calculator,
            Err(e) if native_balance == 0 => {
                log::warn!(
                    "Vault drained at height {} ({}), using the bootstrap rate",
                    height,
                    e
                );
                ConversionRateCalculator::new(0, 0, 0)?
            }
            Err(e) => {
                log::error!(
                    "No conversion rate at height {}: {} (native {}, wrapped {}, unwrapped {})",
                    height,
                    e,
                    native_balance,
                    wrapped_balance,
                    unwrapped_balance
                );
                return Ok(RateSnapshot::NotSynced(
                    NotSyncedReason::InconsistentBalances(e),
                ));
            }
        };
        log::debug!(
            "Conversion rate at height {} (time {}): {} (native {}, wrapped {}, unwrapped {})",
            height,
            timestamp,
            calculator.conversion_rate(),
            native_balance,
            wrapped_balance,
            unwrapped_balance
        );

        Ok(RateSnapshot::Ready(AnchoredCalculator {
            height,
            calculator,
            unwrap_mode: self.unwrap_mode,
        }))
    }

    /// The greatest native height at which a calculator can be created, if any.
    pub fn best_height(&self) -> Result<Option<i64>, RateError> {
        let max_height = self
            .balance_changes
            .watermark()?
            .min(self.wrap_requests.watermark()?);

        // How far in time did we see the other chain
        let unwrap_watermark = self.unwrap_requests.watermark()?;
        let unwrap_timestamp = match self
            .unwrap_requests
            .lookup_closest_block_timestamp(unwrap_watermark)?
        {
            Some(sample) => sample.timestamp,
            None => return Ok(None),
        };

        // The last native sample made by then. Every height up to the next sample has it as
        // its closest one.
        let sampled = match self
            .wrap_requests
            .lookup_block_height_until(unwrap_timestamp, max_height)?
        {
            Some(height) => height,
            None => return Ok(None),
        };
        let height = match self.wrap_requests.lookup_next_sampled_height(sampled)? {
            Some(next) => (next - 1).min(max_height),
            None => max_height,
        };

        Ok(Some(height))
    }

    /// A calculator at the greatest height all ledgers agree on. Falls back to the bootstrap
    /// rate at height 0 if there is none.
    pub fn create_best_calculator(&self) -> Result<AnchoredCalculator, RateError> {
        let reason = match self.best_height()? {
            Some(height) => match self.try_create_calculator(height)? {
                RateSnapshot::Ready(calc) => return Ok(calc),
                RateSnapshot::NotSynced(reason) => {
                    format!("nothing at height {}: {}", height, reason)
                }
            },
            None => "no height synced on all ledgers".to_string(),
        };
        log::warn!("No conversion rate ({}), using the bootstrap rate", reason);

        Ok(AnchoredCalculator {
            height: 0,
            calculator: ConversionRateCalculator::new(0, 0, 0)?,
            unwrap_mode: self.unwrap_mode,
        })
    }
}
