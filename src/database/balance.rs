use crate::database::{
    create_tables, db_error, db_exec, db_query, db_query_scalar, distinct_hashes, open_db,
    open_db_read_only, placeholders,
    schema::{DbTransfer, BALANCE_SCHEMA},
    watermark::{SyncWatermark, STORE_WATERMARK},
    DatabaseError,
};

use std::{collections::VecDeque, path::Path};

use rusqlite::{params, params_from_iter, types::Value, Connection};

/// A balance change observed in a feed carrying the activity of several addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBalanceChange {
    pub address: String,
    pub currency: String,
    pub amount: i64,
    pub transaction_hash: String,
}

/// The ledger of the vault balance on the native chain.
pub struct BalanceChangeLedger {
    conn: Connection,
    watermark: SyncWatermark,
}

impl BalanceChangeLedger {
    /// Open the store at this path for writing, creating it if needed.
    pub fn open(db_path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: open_db(db_path, BALANCE_SCHEMA)?,
            watermark: STORE_WATERMARK,
        })
    }

    /// Open an existing store for reading.
    pub fn open_read_only(db_path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: open_db_read_only(db_path)?,
            watermark: STORE_WATERMARK,
        })
    }

    pub fn create_tables(&mut self) -> Result<(), DatabaseError> {
        create_tables(&mut self.conn, BALANCE_SCHEMA)
    }

    pub fn watermark(&self) -> Result<i64, DatabaseError> {
        self.watermark.get(&self.conn)
    }

    pub fn set_watermark(&self, height: i64) -> Result<(), DatabaseError> {
        self.watermark.set(&self.conn, height)
    }

    pub fn is_synced_at_height(&self, height: i64) -> Result<bool, DatabaseError> {
        Ok(height <= self.watermark()?)
    }

    fn ensure_synced(&self, height: i64) -> Result<(), DatabaseError> {
        let available = self.watermark()?;
        if height > available {
            return Err(DatabaseError::HeightNotSynced {
                requested: height,
                available,
            });
        }

        Ok(())
    }

    /// Record a balance change of the vault. A transaction hash can only be recorded once.
    pub fn add_transfer(
        &self,
        height: i64,
        currency: &str,
        amount: i64,
        transaction_hash: &str,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO transfers (height, currency, amount, transaction_hash) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![height, currency, amount, transaction_hash],
            )
            .map_err(|e| db_error(&format!("Inserting transfer '{}'", transaction_hash), e))?;
        log::debug!(
            "Recorded transfer '{}' of {} {} at height {}",
            transaction_hash,
            amount,
            currency,
            height
        );

        Ok(())
    }

    /// Record the changes of a multi-address feed that concern `target_address`. Changes that
    /// were already recorded are skipped. Returns how many were inserted.
    pub fn add_transfers_filtered_by_address(
        &mut self,
        height: i64,
        changes: &[AddressBalanceChange],
        target_address: &str,
    ) -> Result<usize, DatabaseError> {
        db_exec(&mut self.conn, |tx| {
            let mut inserted = 0;
            for change in changes.iter().filter(|c| c.address == target_address) {
                inserted += tx
                    .execute(
                        "INSERT OR IGNORE INTO transfers \
                         (height, currency, amount, transaction_hash) VALUES (?1, ?2, ?3, ?4)",
                        params![
                            height,
                            change.currency,
                            change.amount,
                            change.transaction_hash
                        ],
                    )
                    .map_err(|e| db_error("Inserting transfers", e))?;
            }
            Ok(inserted)
        })
    }

    /// The balance of the vault in this currency as of this height, included.
    pub fn balance_at(&self, height: i64, currency: &str) -> Result<i64, DatabaseError> {
        self.ensure_synced(height)?;

        db_query_scalar(
            &self.conn,
            "SELECT SUM(amount) FROM transfers WHERE currency = (?1) AND height <= (?2)",
            params![currency, height],
        )
        .map(|sum| sum.unwrap_or(0))
    }

    /// Same as [BalanceChangeLedger::balance_at] restricted to a set of transaction hashes,
    /// queried `batch_size` hashes at a time.
    pub fn partial_balance_at(
        &self,
        height: i64,
        currency: &str,
        transaction_hashes: &[String],
        batch_size: usize,
    ) -> Result<i64, DatabaseError> {
        self.ensure_synced(height)?;

        let mut balance = 0;
        for chunk in distinct_hashes(transaction_hashes).chunks(batch_size.max(1)) {
            let query = format!(
                "SELECT SUM(amount) FROM transfers WHERE currency = ? AND height <= ? \
                 AND transaction_hash IN ({})",
                placeholders(chunk.len())
            );
            let params = chunk_params(currency, height, chunk);
            balance += db_query_scalar(&self.conn, &query, params_from_iter(params))?.unwrap_or(0);
        }

        Ok(balance)
    }

    /// The subset of these hashes that is already recorded at or below this height. The
    /// returned sequence is lazy and may be iterated as many times as needed.
    pub fn filter_transactions_if_present<'a>(
        &'a self,
        height: i64,
        currency: &'a str,
        transaction_hashes: &'a [String],
        batch_size: usize,
    ) -> PresentTransactions<'a> {
        PresentTransactions {
            conn: &self.conn,
            height,
            currency,
            transaction_hashes: distinct_hashes(transaction_hashes),
            batch_size: batch_size.max(1),
        }
    }

    /// All transfers, in height order.
    pub fn transfers(&self) -> Result<Vec<DbTransfer>, DatabaseError> {
        db_query(
            &self.conn,
            "SELECT id, height, currency, amount, transaction_hash FROM transfers \
             ORDER BY height, id",
            [],
            |row| {
                Ok(DbTransfer {
                    id: row.get(0)?,
                    height: row.get(1)?,
                    currency: row.get(2)?,
                    amount: row.get(3)?,
                    transaction_hash: row.get(4)?,
                })
            },
        )
    }

    /// Drop everything above the watermark. This is how we recover from a reorg.
    pub fn reset(&self) -> Result<usize, DatabaseError> {
        let watermark = self.watermark()?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM transfers WHERE height > (?1)",
                params![watermark],
            )
            .map_err(|e| db_error("Resetting transfers", e))?;
        log::info!(
            "Reset balance changes to height {}: {} transfer(s) dropped",
            watermark,
            deleted
        );

        Ok(deleted)
    }
}

fn chunk_params(currency: &str, height: i64, chunk: &[&str]) -> Vec<Value> {
    let mut params = Vec::with_capacity(chunk.len() + 2);
    params.push(Value::Text(currency.to_string()));
    params.push(Value::Integer(height));
    params.extend(chunk.iter().map(|hash| Value::Text(hash.to_string())));
    params
}

/// The recorded subset of a batch of transaction hashes, see
/// [BalanceChangeLedger::filter_transactions_if_present].
#[derive(Clone)]
pub struct PresentTransactions<'a> {
    conn: &'a Connection,
    height: i64,
    currency: &'a str,
    transaction_hashes: Vec<&'a str>,
    batch_size: usize,
}

impl<'a> PresentTransactions<'a> {
    /// Start a new pass over the recorded hashes.
    pub fn iter(&self) -> PresentTransactionsIter<'a> {
        PresentTransactionsIter {
            source: self.clone(),
            next_chunk: 0,
            pending: VecDeque::new(),
        }
    }
}

impl<'a> IntoIterator for &PresentTransactions<'a> {
    type Item = Result<String, DatabaseError>;
    type IntoIter = PresentTransactionsIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Queries one chunk of hashes at a time, when the previous one is exhausted.
pub struct PresentTransactionsIter<'a> {
    source: PresentTransactions<'a>,
    next_chunk: usize,
    pending: VecDeque<String>,
}

impl<'a> PresentTransactionsIter<'a> {
    fn fetch_chunk(&self, chunk: &[&str]) -> Result<Vec<String>, DatabaseError> {
        let query = format!(
            "SELECT transaction_hash FROM transfers WHERE currency = ? AND height <= ? \
             AND transaction_hash IN ({}) ORDER BY id",
            placeholders(chunk.len())
        );
        let params = chunk_params(self.source.currency, self.source.height, chunk);

        db_query(self.source.conn, &query, params_from_iter(params), |row| {
            row.get::<_, String>(0)
        })
    }
}

impl<'a> Iterator for PresentTransactionsIter<'a> {
    type Item = Result<String, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(hash) = self.pending.pop_front() {
                return Some(Ok(hash));
            }

            let hashes = &self.source.transaction_hashes;
            let start = self.next_chunk * self.source.batch_size;
            if start >= hashes.len() {
                return None;
            }
            let end = (start + self.source.batch_size).min(hashes.len());
            self.next_chunk += 1;
            match self.fetch_chunk(&self.source.transaction_hashes[start..end]) {
                Ok(hashes) => self.pending.extend(hashes),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
