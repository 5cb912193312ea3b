use crate::{
    config::{config_folder_path, Config, ConfigError},
    database::{balance::BalanceChangeLedger, requests::RequestLedger, DatabaseError},
    facade::{ChainFacade, IdentityFacade},
    rate::factory::{ConversionRateCalculatorFactory, RateError},
    StartupError,
};

use std::{fs, path::PathBuf};

use serde::Serialize;

/// Our global state
#[derive(Debug, Clone)]
pub struct BridgeLedger {
    /// We store all our data in one place, that's here.
    pub data_dir: PathBuf,
    /// The native currency the vault balance is tracked in
    pub currency: String,
    pub batch_size: usize,
}

impl BridgeLedger {
    /// Creates our global state by consuming the static configuration
    pub fn from_config(config: Config) -> Result<BridgeLedger, StartupError> {
        let data_dir = match config.data_dir {
            Some(data_dir) => data_dir,
            None => config_folder_path().ok_or(ConfigError::DatadirNotFound)?,
        };
        if !data_dir.as_path().exists() {
            log::info!("Creating data directory at {:?}", data_dir);
            fs::create_dir_all(&data_dir)?;
        }

        Ok(BridgeLedger {
            data_dir,
            currency: config.currency,
            batch_size: config.batch_size,
        })
    }

    fn file_from_datadir(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    pub fn balance_db_file(&self) -> PathBuf {
        self.file_from_datadir("balance_changes.sqlite3")
    }

    pub fn wrap_db_file(&self) -> PathBuf {
        self.file_from_datadir("wrap_requests.sqlite3")
    }

    pub fn unwrap_db_file(&self) -> PathBuf {
        self.file_from_datadir("unwrap_requests.sqlite3")
    }

    /// Open the three stores for writing, creating them if needed. Both chains' timestamps are
    /// unix seconds and their addresses opaque strings.
    pub fn open(&self) -> Result<LedgerHandles, DatabaseError> {
        self.open_with_facades(IdentityFacade, IdentityFacade)
    }

    /// Open the three stores for writing. Wraps are made on the native chain and paid out on
    /// the wrapped one, unwraps the other way around.
    pub fn open_with_facades<N, W>(
        &self,
        native: N,
        wrapped: W,
    ) -> Result<LedgerHandles, DatabaseError>
    where
        N: ChainFacade + Clone + Send + 'static,
        W: ChainFacade + Clone + Send + 'static,
    {
        Ok(LedgerHandles {
            balance: BalanceChangeLedger::open(&self.balance_db_file())?,
            wrap: RequestLedger::open(
                &self.wrap_db_file(),
                Box::new(native.clone()),
                Box::new(wrapped.clone()),
            )?,
            unwrap: RequestLedger::open(
                &self.unwrap_db_file(),
                Box::new(wrapped),
                Box::new(native),
            )?,
        })
    }

    /// Open the three existing stores for reading, with identity chains.
    pub fn open_read_only(&self) -> Result<LedgerHandles, DatabaseError> {
        self.open_read_only_with_facades(IdentityFacade, IdentityFacade)
    }

    /// Open the three existing stores for reading. The facades are used the same way as by
    /// [BridgeLedger::open_with_facades].
    pub fn open_read_only_with_facades<N, W>(
        &self,
        native: N,
        wrapped: W,
    ) -> Result<LedgerHandles, DatabaseError>
    where
        N: ChainFacade + Clone + Send + 'static,
        W: ChainFacade + Clone + Send + 'static,
    {
        Ok(LedgerHandles {
            balance: BalanceChangeLedger::open_read_only(&self.balance_db_file())?,
            wrap: RequestLedger::open_read_only(
                &self.wrap_db_file(),
                Box::new(native.clone()),
                Box::new(wrapped.clone()),
            )?,
            unwrap: RequestLedger::open_read_only(
                &self.unwrap_db_file(),
                Box::new(wrapped),
                Box::new(native),
            )?,
        })
    }
}

/// The three stores of a bridge
pub struct LedgerHandles {
    pub balance: BalanceChangeLedger,
    pub wrap: RequestLedger,
    pub unwrap: RequestLedger,
}

/// What an operator wants to know at a glance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStatus {
    pub balance_watermark: i64,
    pub wrap_watermark: i64,
    pub unwrap_watermark: i64,
    pub unconfirmed_wrap_payouts: Vec<String>,
    pub unconfirmed_unwrap_payouts: Vec<String>,
    pub rate_height: i64,
    /// "numerator/denominator"
    pub conversion_rate: String,
}

impl LedgerHandles {
    /// A calculator factory for payouts of wraps, or of unwraps if `unwrap_mode` is set.
    pub fn rate_factory(
        &self,
        currency: &str,
        unwrap_mode: bool,
    ) -> ConversionRateCalculatorFactory<'_> {
        ConversionRateCalculatorFactory::new(
            &self.balance,
            &self.wrap,
            &self.unwrap,
            currency,
            unwrap_mode,
        )
    }

    /// Roll the three stores back to their watermarks, after a reorg. Returns the number of
    /// dropped transfers and requests.
    pub fn reset_all(&mut self) -> Result<usize, DatabaseError> {
        let balance = self.balance.reset()?;
        let wrap = self.wrap.reset()?;
        let unwrap = self.unwrap.reset()?;
        log::info!(
            "Reset {} balance change(s), {} wrap request(s) and {} unwrap request(s)",
            balance,
            wrap,
            unwrap
        );

        Ok(balance + wrap + unwrap)
    }

    pub fn status(&self, currency: &str) -> Result<LedgerStatus, RateError> {
        let best = self.rate_factory(currency, false).create_best_calculator()?;
        let rate = best.calculator.conversion_rate();

        Ok(LedgerStatus {
            balance_watermark: self.balance.watermark()?,
            wrap_watermark: self.wrap.watermark()?,
            unwrap_watermark: self.unwrap.watermark()?,
            unconfirmed_wrap_payouts: self.wrap.unconfirmed_payout_transaction_hashes()?,
            unconfirmed_unwrap_payouts: self.unwrap.unconfirmed_payout_transaction_hashes()?,
            rate_height: best.height,
            conversion_rate: format!("{}/{}", rate.numer(), rate.denom()),
        })
    }
}
