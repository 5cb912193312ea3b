//! What the ledgers need to know about a chain, without talking to it.
//!
//! The request ledger is direction-agnostic: it is given one facade for the chain requests are
//! made on and one for the chain payouts are made on, and is wired `(native, wrapped)` for wraps
//! and `(wrapped, native)` for unwraps.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError(pub String);

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid address: {}", self.0)
    }
}

impl std::error::Error for AddressError {}

pub trait AddressFacade {
    /// Parse a raw address into its canonical form.
    fn make_address(&self, raw: &str) -> Result<String, AddressError>;

    /// The canonical form of this address, if it is valid on this chain.
    fn is_valid_address(&self, raw: &str) -> Option<String> {
        self.make_address(raw).ok()
    }
}

pub trait TimeFacade {
    /// Convert a chain timestamp into unix seconds.
    fn to_real_time(&self, raw_timestamp: i64) -> i64;
}

pub trait ChainFacade: AddressFacade + TimeFacade {}

impl<T: AddressFacade + TimeFacade> ChainFacade for T {}

/// For chains whose block timestamps are unix seconds and whose addresses are opaque, trimmed,
/// whitespace-free strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFacade;

impl AddressFacade for IdentityFacade {
    fn make_address(&self, raw: &str) -> Result<String, AddressError> {
        let address = raw.trim();
        if address.is_empty() || address.chars().any(char::is_whitespace) {
            return Err(AddressError(raw.to_string()));
        }

        Ok(address.to_string())
    }
}

impl TimeFacade for IdentityFacade {
    fn to_real_time(&self, raw_timestamp: i64) -> i64 {
        raw_timestamp
    }
}
