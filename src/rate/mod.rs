pub mod factory;

use std::{convert::TryFrom, fmt};

use num_rational::Ratio;

/// How many wrapped units one native unit is worth, as an exact fraction.
pub type ConversionRate = Ratio<u128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionError {
    /// More wrapped supply was returned than was ever issued
    SupplyUnderflow { wrapped: u64, unwrapped: u64 },
    /// There is no circulating wrapped supply to convert into native units
    ZeroRate,
    /// The converted amount does not fit
    Overflow,
    /// A ledger reported a negative balance
    NegativeBalance(i64),
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SupplyUnderflow { wrapped, unwrapped } => write!(
                f,
                "Unwrapped balance ({}) is larger than the wrapped balance ({})",
                unwrapped, wrapped
            ),
            Self::ZeroRate => write!(f, "Conversion rate is zero"),
            Self::Overflow => write!(f, "Converted amount overflows"),
            Self::NegativeBalance(b) => write!(f, "Negative balance: {}", b),
        }
    }
}

impl std::error::Error for ConversionError {}

/// Converts amounts between the native asset and its wrapped representation, given a snapshot
/// of the vault balance and of the wrapped supply.
///
/// Conversions always round up, so that rounding never leaves the bridge under-collateralized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionRateCalculator {
    native_balance: u64,
    wrapped_balance: u64,
    unwrapped_balance: u64,
    rate: ConversionRate,
}

impl ConversionRateCalculator {
    /// A bridge with an empty vault has a 1:1 rate.
    pub fn new(
        native_balance: u64,
        wrapped_balance: u64,
        unwrapped_balance: u64,
    ) -> Result<Self, ConversionError> {
        let (native_balance, wrapped_balance) = if native_balance == 0 {
            (1, 1)
        } else {
            (native_balance, wrapped_balance)
        };
        let effective_wrapped = wrapped_balance.checked_sub(unwrapped_balance).ok_or(
            ConversionError::SupplyUnderflow {
                wrapped: wrapped_balance,
                unwrapped: unwrapped_balance,
            },
        )?;

        Ok(Self {
            native_balance,
            wrapped_balance,
            unwrapped_balance,
            rate: Ratio::new(effective_wrapped.into(), native_balance.into()),
        })
    }

    /// Same as [ConversionRateCalculator::new], from ledger balances.
    pub fn from_balances(
        native_balance: i64,
        wrapped_balance: i64,
        unwrapped_balance: i64,
    ) -> Result<Self, ConversionError> {
        let non_negative = |balance: i64| {
            u64::try_from(balance).map_err(|_| ConversionError::NegativeBalance(balance))
        };
        Self::new(
            non_negative(native_balance)?,
            non_negative(wrapped_balance)?,
            non_negative(unwrapped_balance)?,
        )
    }

    pub fn native_balance(&self) -> u64 {
        self.native_balance
    }

    pub fn wrapped_balance(&self) -> u64 {
        self.wrapped_balance
    }

    pub fn unwrapped_balance(&self) -> u64 {
        self.unwrapped_balance
    }

    /// The wrapped supply still in circulation.
    pub fn effective_wrapped_balance(&self) -> u64 {
        self.wrapped_balance - self.unwrapped_balance
    }

    pub fn conversion_rate(&self) -> ConversionRate {
        self.rate
    }

    /// ceil(amount * numer / denom)
    fn scale_up(amount: u64, numer: u128, denom: u128) -> Result<u64, ConversionError> {
        if denom == 0 {
            return Err(ConversionError::ZeroRate);
        }
        let product = u128::from(amount)
            .checked_mul(numer)
            .ok_or(ConversionError::Overflow)?;
        let scaled = Ratio::new(product, denom).ceil().to_integer();

        u64::try_from(scaled).map_err(|_| ConversionError::Overflow)
    }

    /// How many wrapped units these native units are worth.
    pub fn to_wrapped_amount(&self, native_amount: u64) -> Result<u64, ConversionError> {
        Self::scale_up(native_amount, *self.rate.numer(), *self.rate.denom())
    }

    /// How many native units these wrapped units are worth.
    pub fn to_native_amount(&self, wrapped_amount: u64) -> Result<u64, ConversionError> {
        Self::scale_up(wrapped_amount, *self.rate.denom(), *self.rate.numer())
    }

    /// Unwraps pay out native units, wraps pay out wrapped units.
    pub fn to_conversion_function(
        &self,
        unwrap_mode: bool,
    ) -> impl Fn(u64) -> Result<u64, ConversionError> + '_ {
        move |amount| {
            if unwrap_mode {
                self.to_native_amount(amount)
            } else {
                self.to_wrapped_amount(amount)
            }
        }
    }
}
