use std::{convert::TryFrom, fmt, str::FromStr};

use serde::Serialize;

/// The vault balance store.
pub const BALANCE_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS version (
    version INTEGER NOT NULL
);

/* The highest height whose data is durably ingested. A single row. */
CREATE TABLE IF NOT EXISTS sync_watermark (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 0),
    height INTEGER NOT NULL
);

/* Signed balance deltas of the vault. A positive amount is an inflow, a
 * negative one an outflow. Rows are never updated.
 */
CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY NOT NULL,
    height INTEGER NOT NULL,
    currency TEXT NOT NULL,
    amount INTEGER NOT NULL,
    transaction_hash TEXT UNIQUE NOT NULL
);

CREATE INDEX IF NOT EXISTS transfers_currency_height ON transfers (currency, height);
";

/// A request store, one per bridge direction.
pub const REQUEST_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_watermark (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 0),
    height INTEGER NOT NULL
);

/* The requests we heard about on the source chain. A subindex of -1 means the
 * request is the whole transaction.
 * Failed requests are never revived: a transient failure marks the row as
 * retried and inserts a fresh one with the same key. Hence the key is only
 * unique among live rows.
 */
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY NOT NULL,
    height INTEGER NOT NULL,
    transaction_hash TEXT NOT NULL,
    subindex INTEGER NOT NULL,
    sender_address TEXT NOT NULL,
    amount INTEGER NOT NULL,
    destination_address TEXT NOT NULL,
    payout_status INTEGER NOT NULL,
    payout_transaction_hash TEXT UNIQUE,
    is_retried INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS requests_live_key
    ON requests (transaction_hash, subindex) WHERE is_retried = 0;
CREATE INDEX IF NOT EXISTS requests_height ON requests (height);
CREATE INDEX IF NOT EXISTS requests_status ON requests (payout_status);

/* Diagnostics for requests that failed. Errors raised before a request was
 * valid have no request_id.
 */
CREATE TABLE IF NOT EXISTS wrap_errors (
    id INTEGER PRIMARY KEY NOT NULL,
    height INTEGER NOT NULL,
    transaction_hash TEXT NOT NULL,
    subindex INTEGER NOT NULL,
    message TEXT NOT NULL,
    request_id INTEGER,
    FOREIGN KEY (request_id) REFERENCES requests (id)
        ON UPDATE RESTRICT
        ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS wrap_errors_standalone_key
    ON wrap_errors (transaction_hash, subindex) WHERE request_id IS NULL;
CREATE INDEX IF NOT EXISTS wrap_errors_request ON wrap_errors (request_id);

/* Payouts on the destination chain. A height of 0 means submitted but not
 * confirmed, -1 means voided.
 */
CREATE TABLE IF NOT EXISTS payout_transactions (
    id INTEGER PRIMARY KEY NOT NULL,
    transaction_hash TEXT UNIQUE NOT NULL,
    net_amount INTEGER NOT NULL,
    total_fee INTEGER NOT NULL,
    conversion_rate TEXT NOT NULL,
    height INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS payout_transactions_height ON payout_transactions (height);

/* Sparse height -> wall-clock correlation for the source chain. */
CREATE TABLE IF NOT EXISTS block_times (
    height INTEGER PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS block_times_timestamp ON block_times (timestamp);

/* Same for the payout chain. Seeded without timestamp on payout confirmation. */
CREATE TABLE IF NOT EXISTS payout_block_times (
    height INTEGER PRIMARY KEY NOT NULL,
    timestamp INTEGER
);
";

/// A row of the "transfers" table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbTransfer {
    pub id: i64,
    pub height: i64,
    pub currency: String,
    pub amount: i64,
    pub transaction_hash: String,
}

/// The lifecycle of a request's payout, as stored in the "requests" table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Unprocessed = 0,
    Sent = 1,
    Completed = 2,
    Failed = 3,
}

impl TryFrom<u32> for PayoutStatus {
    type Error = ();

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(Self::Unprocessed),
            1 => Ok(Self::Sent),
            2 => Ok(Self::Completed),
            3 => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl FromStr for PayoutStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unprocessed" => Ok(Self::Unprocessed),
            "sent" => Ok(Self::Sent),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            n => n.parse::<u32>().map_err(|_| ()).and_then(Self::try_from),
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unprocessed => write!(f, "unprocessed"),
            Self::Sent => write!(f, "sent"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Identifies a request on its source chain. A subindex of -1 means standalone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestKey {
    pub height: i64,
    pub transaction_hash: String,
    pub subindex: i64,
}

impl RequestKey {
    pub fn new(height: i64, transaction_hash: impl Into<String>, subindex: i64) -> Self {
        Self {
            height,
            transaction_hash: transaction_hash.into(),
            subindex,
        }
    }

    pub fn standalone(height: i64, transaction_hash: impl Into<String>) -> Self {
        Self::new(height, transaction_hash, -1)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} at height {}",
            self.transaction_hash, self.subindex, self.height
        )
    }
}

/// A request as handed over by the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapRequest {
    pub key: RequestKey,
    pub sender_address: String,
    pub amount: i64,
    pub destination_address: String,
}

/// A row of the "requests" table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbWrapRequest {
    pub id: i64,
    pub key: RequestKey,
    pub sender_address: String,
    pub amount: i64,
    pub destination_address: String,
    pub payout_status: PayoutStatus,
    pub payout_transaction_hash: Option<String>,
    pub is_retried: bool,
}

/// A row of the "wrap_errors" table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbWrapError {
    pub id: i64,
    pub key: RequestKey,
    pub message: String,
    pub request_id: Option<i64>,
}

/// What the payout scheduler submitted for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutDetails {
    pub transaction_hash: String,
    pub net_amount: i64,
    pub total_fee: i64,
    pub conversion_rate: crate::rate::ConversionRate,
}

/// A row of the "payout_transactions" table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbPayoutTransaction {
    pub id: i64,
    pub transaction_hash: String,
    pub net_amount: i64,
    pub total_fee: i64,
    /// The exact rate, as a reduced fraction ("5/6")
    pub conversion_rate: String,
    pub height: i64,
}

impl DbPayoutTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }

    pub fn is_voided(&self) -> bool {
        self.height == -1
    }
}

/// A row of the "block_times" or "payout_block_times" tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockTimeSample {
    pub height: i64,
    pub timestamp: i64,
}
