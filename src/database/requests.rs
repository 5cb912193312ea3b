use crate::{
    database::{
        create_tables, db_error, db_exec, db_query, db_query_scalar, distinct_hashes, open_db,
        open_db_read_only, placeholders,
        schema::{
            BlockTimeSample, DbPayoutTransaction, DbWrapError, DbWrapRequest, PayoutDetails,
            PayoutStatus, RequestKey, WrapRequest, REQUEST_SCHEMA,
        },
        watermark::{SyncWatermark, STORE_WATERMARK},
        DatabaseError,
    },
    facade::ChainFacade,
};

use std::{convert::TryFrom, path::Path, str::FromStr};

use rusqlite::{
    params, params_from_iter,
    types::{FromSqlError, Value},
    Connection, OptionalExtension, Row, Transaction,
};
use serde::Serialize;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

const REQUEST_COLUMNS: &str = "r.id, r.height, r.transaction_hash, r.subindex, \
    r.sender_address, r.amount, r.destination_address, r.payout_status, \
    r.payout_transaction_hash, r.is_retried";

// The timestamp of the closest sample at or below a request's height.
const REQUEST_TIMESTAMP: &str = "(SELECT bt.timestamp FROM block_times bt \
    WHERE bt.height <= r.height ORDER BY bt.height DESC LIMIT 1)";

fn request_from_row(row: &Row, offset: usize) -> rusqlite::Result<DbWrapRequest> {
    let status: u32 = row.get(offset + 7)?;
    let payout_status =
        PayoutStatus::try_from(status).map_err(|_| FromSqlError::OutOfRange(status.into()))?;

    Ok(DbWrapRequest {
        id: row.get(offset)?,
        key: RequestKey {
            height: row.get(offset + 1)?,
            transaction_hash: row.get(offset + 2)?,
            subindex: row.get(offset + 3)?,
        },
        sender_address: row.get(offset + 4)?,
        amount: row.get(offset + 5)?,
        destination_address: row.get(offset + 6)?,
        payout_status,
        payout_transaction_hash: row.get(offset + 8)?,
        is_retried: row.get(offset + 9)?,
    })
}

fn error_from_row(row: &Row) -> rusqlite::Result<DbWrapError> {
    Ok(DbWrapError {
        id: row.get(0)?,
        key: RequestKey {
            height: row.get(1)?,
            transaction_hash: row.get(2)?,
            subindex: row.get(3)?,
        },
        message: row.get(4)?,
        request_id: row.get(5)?,
    })
}

// The payout columns of a LEFT JOIN, all NULL if there is no payout.
fn payout_from_row(row: &Row, offset: usize) -> rusqlite::Result<Option<DbPayoutTransaction>> {
    let id: i64 = match row.get(offset)? {
        Some(id) => id,
        None => return Ok(None),
    };

    Ok(Some(DbPayoutTransaction {
        id,
        transaction_hash: row.get(offset + 1)?,
        net_amount: row.get(offset + 2)?,
        total_fee: row.get(offset + 3)?,
        conversion_rate: row.get(offset + 4)?,
        height: row.get(offset + 5)?,
    }))
}

fn live_request_dbtx(
    db_tx: &Transaction,
    key: &RequestKey,
) -> Result<Option<DbWrapRequest>, DatabaseError> {
    db_tx
        .query_row(
            &format!(
                "SELECT {} FROM requests r WHERE r.height = (?1) AND r.transaction_hash = (?2) \
                 AND r.subindex = (?3) AND r.is_retried = 0",
                REQUEST_COLUMNS
            ),
            params![key.height, key.transaction_hash, key.subindex],
            |row| request_from_row(row, 0),
        )
        .optional()
        .map_err(|e| db_error(&format!("Fetching request {}", key), e))
}

fn insert_request_dbtx(db_tx: &Transaction, request: &WrapRequest) -> Result<i64, DatabaseError> {
    db_tx
        .execute(
            "INSERT INTO requests (height, transaction_hash, subindex, sender_address, amount, \
             destination_address, payout_status, payout_transaction_hash, is_retried) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0)",
            params![
                request.key.height,
                request.key.transaction_hash,
                request.key.subindex,
                request.sender_address,
                request.amount,
                request.destination_address,
                PayoutStatus::Unprocessed as u32,
            ],
        )
        .map_err(|e| db_error(&format!("Inserting request {}", request.key), e))?;

    Ok(db_tx.last_insert_rowid())
}

// Move a live request to 'failed', keeping track of why.
fn fail_request_dbtx(
    db_tx: &Transaction,
    key: &RequestKey,
    message: &str,
    is_retried: bool,
) -> Result<DbWrapRequest, DatabaseError> {
    let request = live_request_dbtx(db_tx, key)?
        .ok_or_else(|| DatabaseError::UnknownRequest(format!("No live request {}", key)))?;
    if !matches!(
        request.payout_status,
        PayoutStatus::Unprocessed | PayoutStatus::Sent
    ) {
        return Err(DatabaseError::UnknownRequest(format!(
            "Request {} can't fail, it is '{}'",
            key, request.payout_status
        )));
    }

    db_tx
        .execute(
            "UPDATE requests SET payout_status = (?1), is_retried = (?2) WHERE id = (?3)",
            params![PayoutStatus::Failed as u32, is_retried, request.id],
        )
        .map_err(|e| db_error("Updating request to 'failed'", e))?;
    db_tx
        .execute(
            "INSERT INTO wrap_errors (height, transaction_hash, subindex, message, request_id) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.height,
                key.transaction_hash,
                key.subindex,
                message,
                request.id
            ],
        )
        .map_err(|e| db_error("Inserting error", e))?;
    if let Some(ref payout_hash) = request.payout_transaction_hash {
        db_tx
            .execute(
                "UPDATE payout_transactions SET height = -1 WHERE transaction_hash = (?1)",
                params![payout_hash],
            )
            .map_err(|e| db_error("Voiding payout transaction", e))?;
    }

    Ok(request)
}

/// How to order paginated reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Ascending
    }
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Filters for the paginated reads. Raw client input: anything that does not parse is ignored.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    /// Matches either the sender or the destination address
    pub address: Option<String>,
    /// Matches either the request or the payout transaction hash
    pub hash: Option<String>,
    pub status: Option<String>,
    pub order: SortOrder,
    pub offset: u32,
    /// 0 for the default page size
    pub limit: u32,
}

impl RequestFilter {
    fn limit(&self) -> u32 {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }
}

/// A request along with what we know of its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestView {
    pub request: DbWrapRequest,
    pub block_timestamp: Option<i64>,
    pub payout: Option<DbPayoutTransaction>,
    pub payout_block_timestamp: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorView {
    pub error: DbWrapError,
    pub block_timestamp: Option<i64>,
    /// The status of the request this error is about, if it ever was a valid one
    pub payout_status: Option<PayoutStatus>,
}

fn normalize_hash(raw: &str) -> Option<String> {
    let hash = raw.trim();
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    Some(hash.to_string())
}

#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Conditions {
    fn push(&mut self, clause: &str, params: Vec<Value>) {
        self.clauses.push(clause.to_string());
        self.params.extend(params);
    }

    fn as_sql(&self) -> String {
        if self.clauses.is_empty() {
            return String::new();
        }
        format!("WHERE {}", self.clauses.join(" AND "))
    }
}

/// The ledger of the requests made on one chain and their payouts on the other one. There is
/// one per bridge direction.
pub struct RequestLedger {
    conn: Connection,
    watermark: SyncWatermark,
    /// The chain requests are made on
    source: Box<dyn ChainFacade + Send>,
    /// The chain payouts are made on
    payout: Box<dyn ChainFacade + Send>,
}

impl RequestLedger {
    /// Open the store at this path for writing, creating it if needed.
    pub fn open(
        db_path: &Path,
        source: Box<dyn ChainFacade + Send>,
        payout: Box<dyn ChainFacade + Send>,
    ) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: open_db(db_path, REQUEST_SCHEMA)?,
            watermark: STORE_WATERMARK,
            source,
            payout,
        })
    }

    /// Open an existing store for reading.
    pub fn open_read_only(
        db_path: &Path,
        source: Box<dyn ChainFacade + Send>,
        payout: Box<dyn ChainFacade + Send>,
    ) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: open_db_read_only(db_path)?,
            watermark: STORE_WATERMARK,
            source,
            payout,
        })
    }

    pub fn create_tables(&mut self) -> Result<(), DatabaseError> {
        create_tables(&mut self.conn, REQUEST_SCHEMA)
    }

    pub fn watermark(&self) -> Result<i64, DatabaseError> {
        self.watermark.get(&self.conn)
    }

    pub fn set_watermark(&self, height: i64) -> Result<(), DatabaseError> {
        self.watermark.set(&self.conn, height)
    }

    /// Record a new, unprocessed, request.
    pub fn add_request(&mut self, request: &WrapRequest) -> Result<i64, DatabaseError> {
        let id = db_exec(&mut self.conn, |tx| insert_request_dbtx(tx, request))?;
        log::debug!("Recorded request {} for {}", request.key, request.amount);

        Ok(id)
    }

    /// Record a request that failed before it could be considered valid.
    pub fn add_error(&self, key: &RequestKey, message: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO wrap_errors (height, transaction_hash, subindex, message, request_id) \
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![key.height, key.transaction_hash, key.subindex, message],
            )
            .map_err(|e| db_error(&format!("Inserting error for {}", key), e))?;
        log::debug!("Recorded error for {}: {}", key, message);

        Ok(())
    }

    /// An unprocessed request got its payout submitted.
    pub fn mark_payout_sent(
        &mut self,
        key: &RequestKey,
        details: &PayoutDetails,
    ) -> Result<(), DatabaseError> {
        db_exec(&mut self.conn, |tx| {
            let request = live_request_dbtx(tx, key)?
                .ok_or_else(|| DatabaseError::UnknownRequest(format!("No live request {}", key)))?;
            if request.payout_status != PayoutStatus::Unprocessed {
                return Err(DatabaseError::UnknownRequest(format!(
                    "Request {} can't be paid out, it is '{}'",
                    key, request.payout_status
                )));
            }

            tx.execute(
                "INSERT INTO payout_transactions (transaction_hash, net_amount, total_fee, \
                 conversion_rate, height) VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    details.transaction_hash,
                    details.net_amount,
                    details.total_fee,
                    details.conversion_rate.to_string()
                ],
            )
            .map_err(|e| {
                db_error(
                    &format!("Inserting payout transaction '{}'", details.transaction_hash),
                    e,
                )
            })?;
            tx.execute(
                "UPDATE requests SET payout_status = (?1), payout_transaction_hash = (?2) \
                 WHERE id = (?3)",
                params![
                    PayoutStatus::Sent as u32,
                    details.transaction_hash,
                    request.id
                ],
            )
            .map_err(|e| db_error("Updating request to 'sent'", e))?;

            Ok(())
        })?;
        log::debug!(
            "Payout '{}' sent for request {}",
            details.transaction_hash,
            key
        );

        Ok(())
    }

    /// The request failed for good.
    pub fn mark_payout_failed(
        &mut self,
        key: &RequestKey,
        message: &str,
    ) -> Result<(), DatabaseError> {
        db_exec(&mut self.conn, |tx| {
            fail_request_dbtx(tx, key, message, false).map(|_| ())
        })?;
        log::debug!("Request {} failed: {}", key, message);

        Ok(())
    }

    /// The request failed but may succeed if attempted again. The failed row is kept as is and a
    /// fresh unprocessed copy of the request is inserted, whose id is returned.
    pub fn mark_payout_failed_transient(
        &mut self,
        key: &RequestKey,
        message: &str,
    ) -> Result<i64, DatabaseError> {
        let id = db_exec(&mut self.conn, |tx| {
            let failed = fail_request_dbtx(tx, key, message, true)?;
            insert_request_dbtx(
                tx,
                &WrapRequest {
                    key: failed.key,
                    sender_address: failed.sender_address,
                    amount: failed.amount,
                    destination_address: failed.destination_address,
                },
            )
        })?;
        log::debug!(
            "Request {} failed ({}), will be retried as #{}",
            key,
            message,
            id
        );

        Ok(id)
    }

    /// A payout got confirmed at this height. Returns the number of completed requests.
    pub fn mark_payout_completed(
        &mut self,
        payout_hash: &str,
        height: i64,
    ) -> Result<usize, DatabaseError> {
        let completed = db_exec(&mut self.conn, |tx| {
            let updated = tx
                .execute(
                    "UPDATE payout_transactions SET height = (?1) WHERE transaction_hash = (?2)",
                    params![height, payout_hash],
                )
                .map_err(|e| db_error("Confirming payout transaction", e))?;
            if updated == 0 {
                return Err(DatabaseError::UnknownRequest(format!(
                    "No payout transaction '{}'",
                    payout_hash
                )));
            }

            let completed = tx
                .execute(
                    "UPDATE requests SET payout_status = (?1) \
                     WHERE payout_transaction_hash = (?2) AND payout_status = (?3)",
                    params![
                        PayoutStatus::Completed as u32,
                        payout_hash,
                        PayoutStatus::Sent as u32
                    ],
                )
                .map_err(|e| db_error("Updating request to 'completed'", e))?;
            // The timestamp is filled once we see the block
            tx.execute(
                "INSERT OR IGNORE INTO payout_block_times (height, timestamp) VALUES (?1, NULL)",
                params![height],
            )
            .map_err(|e| db_error("Inserting payout block", e))?;

            Ok(completed)
        })?;
        log::debug!(
            "Payout '{}' confirmed at height {}, {} request(s) completed",
            payout_hash,
            height,
            completed
        );

        Ok(completed)
    }

    fn query_requests(
        &self,
        condition: &str,
        params: Vec<Value>,
    ) -> Result<Vec<DbWrapRequest>, DatabaseError> {
        db_query(
            &self.conn,
            &format!(
                "SELECT {} FROM requests r {} ORDER BY r.height, r.id",
                REQUEST_COLUMNS, condition
            ),
            params_from_iter(params),
            |row| request_from_row(row, 0),
        )
    }

    /// All requests, retried ones included, in height order.
    pub fn requests(&self) -> Result<Vec<DbWrapRequest>, DatabaseError> {
        self.query_requests("", vec![])
    }

    pub fn requests_by_status(
        &self,
        status: PayoutStatus,
    ) -> Result<Vec<DbWrapRequest>, DatabaseError> {
        self.query_requests(
            "WHERE r.payout_status = ?",
            vec![Value::Integer(status as i64)],
        )
    }

    /// All the recorded errors, in height order.
    pub fn errors(&self) -> Result<Vec<DbWrapError>, DatabaseError> {
        db_query(
            &self.conn,
            "SELECT id, height, transaction_hash, subindex, message, request_id \
             FROM wrap_errors ORDER BY height, id",
            [],
            error_from_row,
        )
    }

    /// The payouts submitted but neither confirmed nor voided yet.
    pub fn unconfirmed_payout_transaction_hashes(&self) -> Result<Vec<String>, DatabaseError> {
        db_query(
            &self.conn,
            "SELECT transaction_hash FROM payout_transactions WHERE height = 0 ORDER BY id",
            [],
            |row| row.get(0),
        )
    }

    /// The payout of the live request with this key, if any.
    pub fn payout_transaction_hash_for_request(
        &self,
        key: &RequestKey,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = db_query(
            &self.conn,
            "SELECT payout_transaction_hash FROM requests WHERE height = (?1) \
             AND transaction_hash = (?2) AND subindex = (?3) AND is_retried = 0",
            params![key.height, key.transaction_hash, key.subindex],
            |row| row.get::<_, Option<String>>(0),
        )?;

        Ok(rows.pop().flatten())
    }

    pub fn payout_transaction(
        &self,
        payout_hash: &str,
    ) -> Result<Option<DbPayoutTransaction>, DatabaseError> {
        let mut rows = db_query(
            &self.conn,
            "SELECT id, transaction_hash, net_amount, total_fee, conversion_rate, height \
             FROM payout_transactions WHERE transaction_hash = (?1)",
            params![payout_hash],
            |row| payout_from_row(row, 0),
        )?;

        Ok(rows.pop().flatten())
    }

    /// Record when a block of the request chain was made.
    pub fn set_block_timestamp(
        &self,
        height: i64,
        raw_timestamp: i64,
    ) -> Result<(), DatabaseError> {
        let timestamp = self.source.to_real_time(raw_timestamp);
        self.conn
            .execute(
                "INSERT INTO block_times (height, timestamp) VALUES (?1, ?2) \
                 ON CONFLICT (height) DO UPDATE SET timestamp = excluded.timestamp",
                params![height, timestamp],
            )
            .map_err(|e| db_error("Inserting block time", e))?;

        Ok(())
    }

    /// Record when a block of the payout chain was made.
    pub fn set_payout_block_timestamp(
        &self,
        height: i64,
        raw_timestamp: i64,
    ) -> Result<(), DatabaseError> {
        let timestamp = self.payout.to_real_time(raw_timestamp);
        self.conn
            .execute(
                "INSERT INTO payout_block_times (height, timestamp) VALUES (?1, ?2) \
                 ON CONFLICT (height) DO UPDATE SET timestamp = excluded.timestamp",
                params![height, timestamp],
            )
            .map_err(|e| db_error("Inserting payout block time", e))?;

        Ok(())
    }

    /// The timestamp of this exact height, if it was sampled.
    pub fn lookup_block_timestamp(&self, height: i64) -> Result<Option<i64>, DatabaseError> {
        db_query_scalar(
            &self.conn,
            "SELECT timestamp FROM block_times WHERE height = (?1)",
            params![height],
        )
    }

    /// The sample of the closest height at or below this one.
    pub fn lookup_closest_block_timestamp(
        &self,
        height: i64,
    ) -> Result<Option<BlockTimeSample>, DatabaseError> {
        let mut rows = db_query(
            &self.conn,
            "SELECT height, timestamp FROM block_times WHERE height <= (?1) \
             ORDER BY height DESC LIMIT 1",
            params![height],
            |row| {
                Ok(BlockTimeSample {
                    height: row.get(0)?,
                    timestamp: row.get(1)?,
                })
            },
        )?;

        Ok(rows.pop())
    }

    /// The greatest sampled height whose timestamp is at or before this one.
    pub fn lookup_block_height(&self, timestamp: i64) -> Result<Option<i64>, DatabaseError> {
        db_query_scalar(
            &self.conn,
            "SELECT MAX(height) FROM block_times WHERE timestamp <= (?1)",
            params![timestamp],
        )
    }

    /// Same as [RequestLedger::lookup_block_height], among the heights up to `max_height`.
    pub fn lookup_block_height_until(
        &self,
        timestamp: i64,
        max_height: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        db_query_scalar(
            &self.conn,
            "SELECT MAX(height) FROM block_times WHERE timestamp <= (?1) AND height <= (?2)",
            params![timestamp, max_height],
        )
    }

    /// The first sampled height above this one.
    pub fn lookup_next_sampled_height(&self, height: i64) -> Result<Option<i64>, DatabaseError> {
        db_query_scalar(
            &self.conn,
            "SELECT MIN(height) FROM block_times WHERE height > (?1)",
            params![height],
        )
    }

    /// The timestamp of this payout chain height, if we know it already.
    pub fn lookup_payout_block_timestamp(
        &self,
        height: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        db_query_scalar(
            &self.conn,
            "SELECT timestamp FROM payout_block_times WHERE height = (?1)",
            params![height],
        )
    }

    /// Whether we ingested everything up to this point in time.
    pub fn is_synced_at_timestamp(&self, timestamp: i64) -> Result<bool, DatabaseError> {
        let watermark = self.watermark()?;
        Ok(self
            .lookup_closest_block_timestamp(watermark)?
            .map(|sample| timestamp <= sample.timestamp)
            .unwrap_or(false))
    }

    // Payouts of live requests made at or before a point in time.
    fn payouts_at_query(select: &str) -> String {
        format!(
            "SELECT {} FROM requests r \
             INNER JOIN payout_transactions p ON p.transaction_hash = r.payout_transaction_hash \
             WHERE r.is_retried = 0 AND r.payout_status IN ({}, {}) AND {} <= (?1)",
            select,
            PayoutStatus::Sent as u32,
            PayoutStatus::Completed as u32,
            REQUEST_TIMESTAMP
        )
    }

    /// The sum of the net amounts paid out for the requests made until this point in time.
    pub fn cumulative_net_amount_at(&self, timestamp: i64) -> Result<i64, DatabaseError> {
        db_query_scalar(
            &self.conn,
            &Self::payouts_at_query("SUM(p.net_amount)"),
            params![timestamp],
        )
        .map(|sum| sum.unwrap_or(0))
    }

    /// The sum of the fees paid for the requests made until this point in time.
    pub fn cumulative_fees_paid_at(&self, timestamp: i64) -> Result<i64, DatabaseError> {
        db_query_scalar(
            &self.conn,
            &Self::payouts_at_query("SUM(p.total_fee)"),
            params![timestamp],
        )
        .map(|sum| sum.unwrap_or(0))
    }

    pub fn payout_transaction_hashes_at(
        &self,
        timestamp: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        db_query(
            &self.conn,
            &format!(
                "{} ORDER BY p.id",
                Self::payouts_at_query("DISTINCT p.transaction_hash")
            ),
            params![timestamp],
            |row| row.get(0),
        )
    }

    /// The sum of the requested (gross) amounts paid out by these payouts.
    pub fn sum_payout_transaction_amounts(
        &self,
        payout_hashes: &[String],
        batch_size: usize,
    ) -> Result<i64, DatabaseError> {
        let mut sum = 0;
        for chunk in distinct_hashes(payout_hashes).chunks(batch_size.max(1)) {
            let query = format!(
                "SELECT SUM(amount) FROM requests WHERE is_retried = 0 \
                 AND payout_transaction_hash IN ({})",
                placeholders(chunk.len())
            );
            sum += db_query_scalar(&self.conn, &query, params_from_iter(chunk.iter()))?
                .unwrap_or(0);
        }

        Ok(sum)
    }

    fn filter_conditions(&self, filter: &RequestFilter, errors: bool) -> Conditions {
        let mut conditions = Conditions::default();

        if let Some(ref raw) = filter.address {
            let sender = self.source.is_valid_address(raw);
            let destination = self.payout.is_valid_address(raw);
            match (sender, destination) {
                (Some(s), Some(d)) => conditions.push(
                    "(r.sender_address = ? OR r.destination_address = ?)",
                    vec![Value::Text(s), Value::Text(d)],
                ),
                (Some(s), None) => {
                    conditions.push("r.sender_address = ?", vec![Value::Text(s)])
                }
                (None, Some(d)) => {
                    conditions.push("r.destination_address = ?", vec![Value::Text(d)])
                }
                (None, None) => log::warn!("Ignoring invalid address filter '{}'", raw),
            }
        }

        if let Some(ref raw) = filter.hash {
            match normalize_hash(raw) {
                Some(hash) if errors => conditions.push(
                    "(e.transaction_hash = ? OR r.payout_transaction_hash = ?)",
                    vec![Value::Text(hash.clone()), Value::Text(hash)],
                ),
                Some(hash) => conditions.push(
                    "(r.transaction_hash = ? OR r.payout_transaction_hash = ?)",
                    vec![Value::Text(hash.clone()), Value::Text(hash)],
                ),
                None => log::warn!("Ignoring invalid hash filter '{}'", raw),
            }
        }

        if let Some(ref raw) = filter.status {
            match PayoutStatus::from_str(raw) {
                Ok(status) => conditions.push(
                    "r.payout_status = ?",
                    vec![Value::Integer(status as i64)],
                ),
                Err(()) => log::warn!("Ignoring invalid status filter '{}'", raw),
            }
        }

        conditions
    }

    /// A page of requests, along with their block, payout and error information.
    pub fn find_requests(&self, filter: &RequestFilter) -> Result<Vec<RequestView>, DatabaseError> {
        let mut conditions = self.filter_conditions(filter, false);
        let query = format!(
            "SELECT {columns}, {timestamp}, \
             p.id, p.transaction_hash, p.net_amount, p.total_fee, p.conversion_rate, p.height, \
             pbt.timestamp, \
             (SELECT e.message FROM wrap_errors e WHERE e.request_id = r.id \
              ORDER BY e.id DESC LIMIT 1) \
             FROM requests r \
             LEFT JOIN payout_transactions p ON p.transaction_hash = r.payout_transaction_hash \
             LEFT JOIN payout_block_times pbt ON pbt.height = p.height AND p.height > 0 \
             {conditions} ORDER BY r.height {order}, r.id {order} LIMIT ? OFFSET ?",
            columns = REQUEST_COLUMNS,
            timestamp = REQUEST_TIMESTAMP,
            conditions = conditions.as_sql(),
            order = filter.order.as_sql(),
        );
        conditions.params.push(Value::Integer(filter.limit().into()));
        conditions.params.push(Value::Integer(filter.offset.into()));

        db_query(
            &self.conn,
            &query,
            params_from_iter(conditions.params),
            |row| {
                Ok(RequestView {
                    request: request_from_row(row, 0)?,
                    block_timestamp: row.get(10)?,
                    payout: payout_from_row(row, 11)?,
                    payout_block_timestamp: row.get(17)?,
                    error_message: row.get(18)?,
                })
            },
        )
    }

    /// A page of errors. Address and status filters only match errors about valid requests.
    pub fn find_errors(&self, filter: &RequestFilter) -> Result<Vec<ErrorView>, DatabaseError> {
        let mut conditions = self.filter_conditions(filter, true);
        let query = format!(
            "SELECT e.id, e.height, e.transaction_hash, e.subindex, e.message, e.request_id, \
             (SELECT bt.timestamp FROM block_times bt WHERE bt.height <= e.height \
              ORDER BY bt.height DESC LIMIT 1), \
             r.payout_status \
             FROM wrap_errors e \
             LEFT JOIN requests r ON r.id = e.request_id \
             {conditions} ORDER BY e.height {order}, e.id {order} LIMIT ? OFFSET ?",
            conditions = conditions.as_sql(),
            order = filter.order.as_sql(),
        );
        conditions.params.push(Value::Integer(filter.limit().into()));
        conditions.params.push(Value::Integer(filter.offset.into()));

        db_query(
            &self.conn,
            &query,
            params_from_iter(conditions.params),
            |row| {
                let payout_status = row
                    .get::<_, Option<u32>>(7)?
                    .map(|status| {
                        PayoutStatus::try_from(status)
                            .map_err(|_| FromSqlError::OutOfRange(status.into()))
                    })
                    .transpose()?;
                Ok(ErrorView {
                    error: error_from_row(row)?,
                    block_timestamp: row.get(6)?,
                    payout_status,
                })
            },
        )
    }

    /// Drop everything above the watermark. This is how we recover from a reorg.
    pub fn reset(&mut self) -> Result<usize, DatabaseError> {
        let watermark = self.watermark()?;
        let (deleted, paid_out) = db_exec(&mut self.conn, |tx| {
            let paid_out = tx
                .query_row(
                    "SELECT COUNT(*) FROM requests WHERE height > (?1) \
                     AND payout_transaction_hash IS NOT NULL",
                    params![watermark],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(|e| db_error("Counting reorged payouts", e))?;
            tx.execute(
                "DELETE FROM wrap_errors WHERE request_id IS NULL AND height > (?1)",
                params![watermark],
            )
            .map_err(|e| db_error("Resetting errors", e))?;
            // This cascades to their errors
            let deleted = tx
                .execute(
                    "DELETE FROM requests WHERE height > (?1)",
                    params![watermark],
                )
                .map_err(|e| db_error("Resetting requests", e))?;
            tx.execute(
                "DELETE FROM block_times WHERE height > (?1)",
                params![watermark],
            )
            .map_err(|e| db_error("Resetting block times", e))?;

            Ok((deleted, paid_out))
        })?;

        if paid_out > 0 {
            log::warn!(
                "{} reorged request(s) had a payout submitted, their payout transactions are kept",
                paid_out
            );
        }
        log::info!(
            "Reset requests to height {}: {} request(s) dropped",
            watermark,
            deleted
        );

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rate::ConversionRate,
        utils::test_utils::{test_datadir, PrefixFacade},
    };

    use std::{fs, path::PathBuf};

    // Requests are made on a "nat" chain with millisecond timestamps, paid out on a "wrp" chain
    // with second timestamps.
    fn dummy_ledger(datadir: &Path) -> RequestLedger {
        RequestLedger::open(
            &datadir.join("wrap_requests.sqlite3"),
            Box::new(PrefixFacade::new("nat", 1_000)),
            Box::new(PrefixFacade::new("wrp", 1)),
        )
        .unwrap()
    }

    fn dummy_request(height: i64, hash: &str, subindex: i64, amount: i64) -> WrapRequest {
        WrapRequest {
            key: RequestKey::new(height, hash, subindex),
            sender_address: "nat_sender".to_string(),
            amount,
            destination_address: format!("wrp_dest_{}", hash),
        }
    }

    fn payout(hash: &str, net_amount: i64, total_fee: i64) -> PayoutDetails {
        PayoutDetails {
            transaction_hash: hash.to_string(),
            net_amount,
            total_fee,
            conversion_rate: ConversionRate::new(5, 6),
        }
    }

    fn cleanup(datadir: PathBuf) {
        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }

    #[test]
    fn test_create_tables_idempotent() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);
        ledger.add_request(&dummy_request(1, "aa", -1, 10)).unwrap();
        ledger.create_tables().unwrap();
        ledger.create_tables().unwrap();
        drop(ledger);

        let ledger = dummy_ledger(&datadir);
        assert_eq!(ledger.requests().unwrap().len(), 1);

        cleanup(datadir);
    }

    #[test]
    fn test_duplicates() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);

        ledger.add_request(&dummy_request(1, "aa", -1, 10)).unwrap();
        // Sub-transactions of the same transaction are distinct requests
        ledger.add_request(&dummy_request(2, "bb", 0, 10)).unwrap();
        ledger.add_request(&dummy_request(2, "bb", 1, 10)).unwrap();
        assert!(matches!(
            ledger.add_request(&dummy_request(1, "aa", -1, 10)),
            Err(DatabaseError::Duplicate(_))
        ));
        assert!(matches!(
            ledger.add_request(&dummy_request(2, "bb", 1, 99)),
            Err(DatabaseError::Duplicate(_))
        ));

        ledger
            .add_error(&RequestKey::standalone(3, "cc"), "amount too low")
            .unwrap();
        assert!(matches!(
            ledger.add_error(&RequestKey::standalone(3, "cc"), "amount too low"),
            Err(DatabaseError::Duplicate(_))
        ));

        // Two requests can't be paid out by the same transaction
        ledger
            .mark_payout_sent(&RequestKey::standalone(1, "aa"), &payout("p1", 8, 2))
            .unwrap();
        assert!(matches!(
            ledger.mark_payout_sent(&RequestKey::new(2, "bb", 0), &payout("p1", 8, 2)),
            Err(DatabaseError::Duplicate(_))
        ));
        // And the failed attempt left nothing behind
        assert_eq!(
            ledger
                .payout_transaction_hash_for_request(&RequestKey::new(2, "bb", 0))
                .unwrap(),
            None
        );
        assert_eq!(
            ledger.requests_by_status(PayoutStatus::Sent).unwrap().len(),
            1
        );

        cleanup(datadir);
    }

    #[test]
    fn test_request_lifecycle() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);
        let key = RequestKey::standalone(10, "aa");

        // Unknown requests can't move
        assert!(matches!(
            ledger.mark_payout_sent(&key, &payout("p1", 95, 5)),
            Err(DatabaseError::UnknownRequest(_))
        ));

        ledger.add_request(&dummy_request(10, "aa", -1, 100)).unwrap();
        let request = ledger.requests().unwrap().pop().unwrap();
        assert_eq!(request.payout_status, PayoutStatus::Unprocessed);
        assert_eq!(request.payout_transaction_hash, None);
        assert!(!request.is_retried);
        assert_eq!(ledger.payout_transaction_hash_for_request(&key).unwrap(), None);

        ledger.mark_payout_sent(&key, &payout("p1", 95, 5)).unwrap();
        let request = ledger.requests().unwrap().pop().unwrap();
        assert_eq!(request.payout_status, PayoutStatus::Sent);
        assert_eq!(
            ledger.payout_transaction_hash_for_request(&key).unwrap(),
            Some("p1".to_string())
        );
        assert_eq!(
            ledger.unconfirmed_payout_transaction_hashes().unwrap(),
            vec!["p1".to_string()]
        );
        let payout_tx = ledger.payout_transaction("p1").unwrap().unwrap();
        assert_eq!(payout_tx.height, 0);
        assert_eq!(payout_tx.net_amount, 95);
        assert_eq!(payout_tx.total_fee, 5);
        assert_eq!(payout_tx.conversion_rate, "5/6");
        assert_eq!(
            payout_tx.conversion_rate.parse::<ConversionRate>().unwrap(),
            ConversionRate::new(10, 12)
        );
        // Can't be sent twice
        assert!(matches!(
            ledger.mark_payout_sent(&key, &payout("p2", 95, 5)),
            Err(DatabaseError::UnknownRequest(_))
        ));

        assert_eq!(ledger.mark_payout_completed("p1", 500).unwrap(), 1);
        let request = ledger.requests().unwrap().pop().unwrap();
        assert_eq!(request.payout_status, PayoutStatus::Completed);
        assert!(ledger.unconfirmed_payout_transaction_hashes().unwrap().is_empty());
        assert!(ledger.payout_transaction("p1").unwrap().unwrap().is_confirmed());
        // The payout block is known, but not its time yet
        assert_eq!(ledger.lookup_payout_block_timestamp(500).unwrap(), None);
        ledger.set_payout_block_timestamp(500, 1_700_000_000).unwrap();
        assert_eq!(
            ledger.lookup_payout_block_timestamp(500).unwrap(),
            Some(1_700_000_000)
        );

        // A completed request can't fail anymore
        assert!(matches!(
            ledger.mark_payout_failed(&key, "too late"),
            Err(DatabaseError::UnknownRequest(_))
        ));
        assert!(matches!(
            ledger.mark_payout_completed("unknown", 500),
            Err(DatabaseError::UnknownRequest(_))
        ));

        cleanup(datadir);
    }

    #[test]
    fn test_permanent_failure() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);

        // Failing before being sent
        let key_a = RequestKey::standalone(1, "aa");
        ledger.add_request(&dummy_request(1, "aa", -1, 100)).unwrap();
        ledger.mark_payout_failed(&key_a, "blacklisted").unwrap();

        // Failing after being sent voids the payout
        let key_b = RequestKey::standalone(2, "bb");
        ledger.add_request(&dummy_request(2, "bb", -1, 100)).unwrap();
        ledger.mark_payout_sent(&key_b, &payout("p1", 95, 5)).unwrap();
        ledger.mark_payout_failed(&key_b, "rejected").unwrap();
        assert!(ledger.payout_transaction("p1").unwrap().unwrap().is_voided());
        assert!(ledger.unconfirmed_payout_transaction_hashes().unwrap().is_empty());

        let failed = ledger.requests_by_status(PayoutStatus::Failed).unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| !r.is_retried));
        assert_eq!(ledger.requests().unwrap().len(), 2);
        let messages: Vec<(Option<i64>, String)> = ledger
            .errors()
            .unwrap()
            .into_iter()
            .map(|e| (e.request_id, e.message))
            .collect();
        assert_eq!(
            messages,
            vec![
                (Some(failed[0].id), "blacklisted".to_string()),
                (Some(failed[1].id), "rejected".to_string())
            ]
        );

        // Failed is terminal
        assert!(matches!(
            ledger.mark_payout_failed(&key_a, "again"),
            Err(DatabaseError::UnknownRequest(_))
        ));
        assert!(matches!(
            ledger.mark_payout_sent(&key_a, &payout("p2", 95, 5)),
            Err(DatabaseError::UnknownRequest(_))
        ));

        cleanup(datadir);
    }

    #[test]
    fn test_transient_failure() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);
        let key = RequestKey::new(5, "aa", 3);

        ledger.add_request(&dummy_request(5, "aa", 3, 100)).unwrap();
        ledger.add_request(&dummy_request(6, "bb", -1, 7)).unwrap();
        ledger.mark_payout_sent(&key, &payout("p1", 95, 5)).unwrap();
        let clone_id = ledger
            .mark_payout_failed_transient(&key, "node unreachable")
            .unwrap();
        // And the clone fails as well, before being sent this time
        let second_clone_id = ledger
            .mark_payout_failed_transient(&key, "node unreachable")
            .unwrap();
        assert_ne!(clone_id, second_clone_id);

        let requests = ledger.requests().unwrap();
        assert_eq!(requests.len(), 4);
        let retried: Vec<&DbWrapRequest> = requests.iter().filter(|r| r.is_retried).collect();
        assert_eq!(retried.len(), 2);
        assert!(retried
            .iter()
            .all(|r| r.payout_status == PayoutStatus::Failed));
        let live: Vec<&DbWrapRequest> = requests
            .iter()
            .filter(|r| r.key == key && !r.is_retried)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second_clone_id);
        assert_eq!(live[0].payout_status, PayoutStatus::Unprocessed);
        assert_eq!(live[0].payout_transaction_hash, None);
        // Every retried row has a successor with the same content
        for r in retried {
            assert_eq!(r.sender_address, live[0].sender_address);
            assert_eq!(r.amount, live[0].amount);
            assert_eq!(r.destination_address, live[0].destination_address);
        }
        assert!(ledger.payout_transaction("p1").unwrap().unwrap().is_voided());
        assert_eq!(ledger.errors().unwrap().len(), 2);

        // The live clone goes on with its life
        ledger.mark_payout_sent(&key, &payout("p2", 95, 5)).unwrap();
        assert_eq!(ledger.mark_payout_completed("p2", 12).unwrap(), 1);
        assert_eq!(
            ledger.payout_transaction_hash_for_request(&key).unwrap(),
            Some("p2".to_string())
        );
        assert_eq!(
            ledger.requests_by_status(PayoutStatus::Completed).unwrap()[0].id,
            second_clone_id
        );
        // Even if the voided payout eventually confirms, it doesn't revive the failed row
        assert_eq!(ledger.mark_payout_completed("p1", 13).unwrap(), 0);
        assert_eq!(
            ledger.requests_by_status(PayoutStatus::Failed).unwrap().len(),
            2
        );

        cleanup(datadir);
    }

    #[test]
    fn test_block_timestamps() {
        let datadir = test_datadir();
        let ledger = dummy_ledger(&datadir);

        assert!(!ledger.is_synced_at_timestamp(0).unwrap());
        assert_eq!(ledger.lookup_block_height(1_000).unwrap(), None);

        // Sparse samples, converted from milliseconds
        ledger.set_block_timestamp(10, 1_000_000).unwrap();
        ledger.set_block_timestamp(20, 1_100_000).unwrap();
        ledger.set_block_timestamp(30, 1_200_000).unwrap();
        // Upserting
        ledger.set_block_timestamp(30, 1_250_000).unwrap();

        assert_eq!(ledger.lookup_block_timestamp(20).unwrap(), Some(1_100));
        assert_eq!(ledger.lookup_block_timestamp(25).unwrap(), None);
        assert_eq!(ledger.lookup_block_timestamp(30).unwrap(), Some(1_250));
        assert_eq!(ledger.lookup_closest_block_timestamp(9).unwrap(), None);
        assert_eq!(
            ledger.lookup_closest_block_timestamp(25).unwrap(),
            Some(BlockTimeSample {
                height: 20,
                timestamp: 1_100
            })
        );
        assert_eq!(
            ledger.lookup_closest_block_timestamp(1_000).unwrap().unwrap().height,
            30
        );

        assert_eq!(ledger.lookup_block_height(999).unwrap(), None);
        assert_eq!(ledger.lookup_block_height(1_000).unwrap(), Some(10));
        assert_eq!(ledger.lookup_block_height(1_249).unwrap(), Some(20));
        assert_eq!(ledger.lookup_block_height(5_000).unwrap(), Some(30));
        assert_eq!(ledger.lookup_block_height_until(5_000, 29).unwrap(), Some(20));
        assert_eq!(ledger.lookup_block_height_until(1_249, 30).unwrap(), Some(20));
        assert_eq!(ledger.lookup_block_height_until(5_000, 9).unwrap(), None);
        assert_eq!(ledger.lookup_next_sampled_height(0).unwrap(), Some(10));
        assert_eq!(ledger.lookup_next_sampled_height(10).unwrap(), Some(20));
        assert_eq!(ledger.lookup_next_sampled_height(25).unwrap(), Some(30));
        assert_eq!(ledger.lookup_next_sampled_height(30).unwrap(), None);

        ledger.set_watermark(25).unwrap();
        assert!(ledger.is_synced_at_timestamp(1_100).unwrap());
        assert!(!ledger.is_synced_at_timestamp(1_101).unwrap());
        ledger.set_watermark(30).unwrap();
        assert!(ledger.is_synced_at_timestamp(1_250).unwrap());

        cleanup(datadir);
    }

    #[test]
    fn test_aggregates() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);
        for (height, ts) in &[(1, 100_000), (2, 200_000), (3, 300_000), (5, 500_000)] {
            ledger.set_block_timestamp(*height, *ts).unwrap();
        }

        // Completed at 100
        ledger.add_request(&dummy_request(1, "aa", -1, 1_000)).unwrap();
        ledger
            .mark_payout_sent(&RequestKey::standalone(1, "aa"), &payout("p1", 990, 10))
            .unwrap();
        ledger.mark_payout_completed("p1", 40).unwrap();
        // Sent at 200
        ledger.add_request(&dummy_request(2, "bb", -1, 2_000)).unwrap();
        ledger
            .mark_payout_sent(&RequestKey::standalone(2, "bb"), &payout("p2", 1_980, 20))
            .unwrap();
        // Retried, then sent again, at 300
        ledger.add_request(&dummy_request(3, "cc", 0, 3_000)).unwrap();
        let key_c = RequestKey::new(3, "cc", 0);
        ledger.mark_payout_sent(&key_c, &payout("p3", 2_970, 30)).unwrap();
        ledger.mark_payout_failed_transient(&key_c, "dropped").unwrap();
        ledger.mark_payout_sent(&key_c, &payout("p4", 2_960, 40)).unwrap();
        // Not paid out yet, at 300
        ledger.add_request(&dummy_request(3, "dd", -1, 4_000)).unwrap();
        // Failed for good after being sent, at 300
        ledger.add_request(&dummy_request(3, "ee", -1, 5_000)).unwrap();
        let key_e = RequestKey::standalone(3, "ee");
        ledger.mark_payout_sent(&key_e, &payout("p5", 4_950, 50)).unwrap();
        ledger.mark_payout_failed(&key_e, "rejected").unwrap();
        // At height 4, which was not sampled: correlated with height 3
        ledger.add_request(&dummy_request(4, "ff", -1, 6_000)).unwrap();
        ledger
            .mark_payout_sent(&RequestKey::standalone(4, "ff"), &payout("p6", 5_940, 60))
            .unwrap();

        assert_eq!(ledger.cumulative_net_amount_at(99).unwrap(), 0);
        assert_eq!(ledger.cumulative_net_amount_at(100).unwrap(), 990);
        assert_eq!(ledger.cumulative_net_amount_at(299).unwrap(), 990 + 1_980);
        assert_eq!(
            ledger.cumulative_net_amount_at(300).unwrap(),
            990 + 1_980 + 2_960 + 5_940
        );
        assert_eq!(
            ledger.cumulative_net_amount_at(10_000).unwrap(),
            990 + 1_980 + 2_960 + 5_940
        );
        assert_eq!(ledger.cumulative_fees_paid_at(250).unwrap(), 30);
        assert_eq!(ledger.cumulative_fees_paid_at(300).unwrap(), 130);
        assert_eq!(
            ledger.payout_transaction_hashes_at(300).unwrap(),
            vec!["p1", "p2", "p4", "p6"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<String>>()
        );

        let hashes: Vec<String> = vec!["p1", "p3", "p4", "p6", "unknown"]
            .into_iter()
            .map(String::from)
            .collect();
        for batch_size in 1..=hashes.len() {
            // p3 belongs to a retried row and is not counted
            assert_eq!(
                ledger
                    .sum_payout_transaction_amounts(&hashes, batch_size)
                    .unwrap(),
                1_000 + 3_000 + 6_000
            );
        }

        // Repeated hashes are only counted once, wherever the chunks split them
        let repeated: Vec<String> = vec!["p1", "p4", "p1", "p4", "p1"]
            .into_iter()
            .map(String::from)
            .collect();
        for batch_size in 1..=repeated.len() {
            assert_eq!(
                ledger
                    .sum_payout_transaction_amounts(&repeated, batch_size)
                    .unwrap(),
                1_000 + 3_000
            );
        }

        cleanup(datadir);
    }

    #[test]
    fn test_find_requests() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);
        ledger.set_block_timestamp(1, 100_000).unwrap();

        for (height, hash) in &[(1, "aa"), (2, "bb"), (3, "cc"), (4, "dd"), (5, "ee")] {
            ledger.add_request(&dummy_request(*height, hash, -1, 10)).unwrap();
        }
        let mut other = dummy_request(6, "ff", -1, 10);
        other.sender_address = "nat_other".to_string();
        ledger.add_request(&other).unwrap();
        ledger
            .mark_payout_sent(&RequestKey::standalone(2, "bb"), &payout("p1", 9, 1))
            .unwrap();
        ledger.mark_payout_completed("p1", 77).unwrap();
        ledger.set_payout_block_timestamp(77, 7_777).unwrap();
        ledger
            .mark_payout_failed(&RequestKey::standalone(3, "cc"), "blacklisted")
            .unwrap();

        let hashes = |views: Vec<RequestView>| -> Vec<String> {
            views
                .into_iter()
                .map(|v| v.request.key.transaction_hash)
                .collect()
        };

        // Pagination and ordering
        let all = ledger.find_requests(&RequestFilter::default()).unwrap();
        assert_eq!(all.len(), 6);
        let page = ledger
            .find_requests(&RequestFilter {
                order: SortOrder::Descending,
                offset: 1,
                limit: 2,
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(hashes(page), vec!["ee", "dd"]);

        // Joined information
        let view = &all[1];
        assert_eq!(view.block_timestamp, Some(100));
        assert_eq!(view.payout.as_ref().unwrap().transaction_hash, "p1");
        assert_eq!(view.payout_block_timestamp, Some(7_777));
        assert_eq!(view.error_message, None);
        assert_eq!(all[2].error_message, Some("blacklisted".to_string()));
        assert_eq!(all[2].payout, None);

        // Filters
        let by_hash = ledger
            .find_requests(&RequestFilter {
                hash: Some("p1".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(hashes(by_hash), vec!["bb"]);
        let by_hash = ledger
            .find_requests(&RequestFilter {
                hash: Some(" dd ".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(hashes(by_hash), vec!["dd"]);
        let by_status = ledger
            .find_requests(&RequestFilter {
                status: Some("failed".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(hashes(by_status), vec!["cc"]);
        let by_sender = ledger
            .find_requests(&RequestFilter {
                address: Some("nat_other".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(hashes(by_sender), vec!["ff"]);
        let by_destination = ledger
            .find_requests(&RequestFilter {
                address: Some("wrp_dest_ee".to_string()),
                status: Some("0".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(hashes(by_destination), vec!["ee"]);

        // Garbage is ignored
        let garbage = ledger
            .find_requests(&RequestFilter {
                address: Some("not an address".to_string()),
                hash: Some("'; DROP TABLE requests; --".to_string()),
                status: Some("pending".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(garbage.len(), 6);

        cleanup(datadir);
    }

    #[test]
    fn test_find_errors() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);

        ledger
            .add_error(&RequestKey::standalone(1, "aa"), "invalid destination")
            .unwrap();
        ledger.add_request(&dummy_request(2, "bb", -1, 10)).unwrap();
        ledger
            .mark_payout_failed(&RequestKey::standalone(2, "bb"), "blacklisted")
            .unwrap();
        ledger
            .add_error(&RequestKey::new(3, "cc", 1), "amount too low")
            .unwrap();

        let all = ledger.find_errors(&RequestFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].payout_status, None);
        assert_eq!(all[1].payout_status, Some(PayoutStatus::Failed));
        assert_eq!(all[1].error.message, "blacklisted");

        let desc = ledger
            .find_errors(&RequestFilter {
                order: SortOrder::Descending,
                limit: 1,
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(desc[0].error.key, RequestKey::new(3, "cc", 1));

        let by_hash = ledger
            .find_errors(&RequestFilter {
                hash: Some("aa".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(by_hash.len(), 1);
        assert_eq!(by_hash[0].error.message, "invalid destination");

        let by_address = ledger
            .find_errors(&RequestFilter {
                address: Some("nat_sender".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(by_address.len(), 1);
        assert_eq!(by_address[0].error.key.transaction_hash, "bb");

        let garbage = ledger
            .find_errors(&RequestFilter {
                hash: Some("".to_string()),
                status: Some("42".to_string()),
                ..RequestFilter::default()
            })
            .unwrap();
        assert_eq!(garbage.len(), 3);

        cleanup(datadir);
    }

    #[test]
    fn test_reset() {
        let datadir = test_datadir();
        let mut ledger = dummy_ledger(&datadir);

        for height in 1..=6 {
            ledger.set_block_timestamp(height, height * 1_000).unwrap();
        }
        ledger.add_request(&dummy_request(2, "aa", -1, 10)).unwrap();
        ledger.add_request(&dummy_request(4, "bb", -1, 10)).unwrap();
        ledger.add_request(&dummy_request(5, "cc", -1, 10)).unwrap();
        ledger
            .mark_payout_sent(&RequestKey::standalone(5, "cc"), &payout("p1", 9, 1))
            .unwrap();
        ledger
            .mark_payout_failed_transient(&RequestKey::standalone(5, "cc"), "dropped")
            .unwrap();
        ledger
            .mark_payout_failed(&RequestKey::standalone(2, "aa"), "blacklisted")
            .unwrap();
        ledger
            .add_error(&RequestKey::standalone(3, "dd"), "invalid")
            .unwrap();
        ledger
            .add_error(&RequestKey::standalone(6, "ee"), "invalid")
            .unwrap();
        ledger.set_watermark(3).unwrap();

        assert_eq!(ledger.reset().unwrap(), 3);
        let heights: Vec<i64> = ledger
            .requests()
            .unwrap()
            .into_iter()
            .map(|r| r.key.height)
            .collect();
        assert_eq!(heights, vec![2]);
        // The errors of the reorged requests went with them
        let errors: Vec<String> = ledger
            .errors()
            .unwrap()
            .into_iter()
            .map(|e| e.key.transaction_hash)
            .collect();
        assert_eq!(errors, vec!["aa".to_string(), "dd".to_string()]);
        assert_eq!(ledger.lookup_closest_block_timestamp(100).unwrap().unwrap().height, 3);
        // The payout was sent already, we keep track of it
        assert!(ledger.payout_transaction("p1").unwrap().is_some());

        // A second reset is a no-op
        assert_eq!(ledger.reset().unwrap(), 0);
        assert_eq!(ledger.requests().unwrap().len(), 1);
        assert_eq!(ledger.errors().unwrap().len(), 2);

        // And the reorged requests may come back
        ledger.add_request(&dummy_request(5, "cc", -1, 10)).unwrap();

        cleanup(datadir);
    }

    #[test]
    fn test_read_only() {
        let datadir = test_datadir();
        let mut writer = dummy_ledger(&datadir);
        writer.add_request(&dummy_request(1, "aa", -1, 10)).unwrap();
        writer.set_watermark(1).unwrap();

        let mut reader = RequestLedger::open_read_only(
            &datadir.join("wrap_requests.sqlite3"),
            Box::new(PrefixFacade::new("nat", 1_000)),
            Box::new(PrefixFacade::new("wrp", 1)),
        )
        .unwrap();
        assert_eq!(reader.watermark().unwrap(), 1);
        assert_eq!(reader.find_requests(&RequestFilter::default()).unwrap().len(), 1);
        reader.add_request(&dummy_request(2, "bb", -1, 10)).unwrap_err();

        cleanup(datadir);
    }
}
