pub mod config;
pub mod database;
pub mod facade;
pub mod ledger;
pub mod rate;

pub const VERSION: &str = "0.1.0";

pub use crate::{
    config::Config,
    database::{
        balance::BalanceChangeLedger, requests::RequestLedger, watermark::SyncWatermark,
        DatabaseError,
    },
    ledger::{BridgeLedger, LedgerHandles, LedgerStatus},
    rate::{
        factory::{ConversionRateCalculatorFactory, RateError, RateSnapshot},
        ConversionError, ConversionRate, ConversionRateCalculator,
    },
};
use crate::config::ConfigError;

use std::{error, fmt, io};

#[derive(Debug)]
pub enum StartupError {
    Config(ConfigError),
    Io(io::Error),
    Db(DatabaseError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "{}", e),
            Self::Db(e) => write!(f, "Database error when starting the ledger: '{}'", e),
        }
    }
}

impl error::Error for StartupError {}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<DatabaseError> for StartupError {
    fn from(e: DatabaseError) -> Self {
        Self::Db(e)
    }
}

impl From<io::Error> for StartupError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
