use crate::database::{db_error, db_query_scalar, DatabaseError};

use rusqlite::{params, Connection};

/// The highest height whose data is guaranteed durably ingested in a store.
///
/// Every ledger embeds one. It doesn't enforce monotonicity: moving the watermark forward is the
/// ingestion pipeline's job, and a reorg recovery is done through the ledgers' `reset()`.
#[derive(Debug, Clone, Copy)]
pub struct SyncWatermark {
    table: &'static str,
}

impl SyncWatermark {
    pub const fn new(table: &'static str) -> Self {
        Self { table }
    }

    /// Get the watermark, 0 if it was never set.
    pub fn get(&self, conn: &Connection) -> Result<i64, DatabaseError> {
        db_query_scalar(
            conn,
            &format!("SELECT height FROM {} WHERE id = 0", self.table),
            [],
        )
        .map(|height| height.unwrap_or(0))
    }

    /// Set the watermark. Idempotent.
    pub fn set(&self, conn: &Connection, height: i64) -> Result<(), DatabaseError> {
        conn.execute(
            &format!(
                "INSERT INTO {} (id, height) VALUES (0, ?1) \
                 ON CONFLICT (id) DO UPDATE SET height = excluded.height",
                self.table
            ),
            params![height],
        )
        .map_err(|e| db_error("Updating watermark", e))?;
        log::debug!("Watermark of '{}' set to {}", self.table, height);

        Ok(())
    }
}

/// The watermark of both store kinds.
pub const STORE_WATERMARK: SyncWatermark = SyncWatermark::new("sync_watermark");
