pub mod balance;
pub mod requests;
pub mod schema;
pub mod watermark;

use std::{collections::HashSet, fs, path::Path, time::Duration};

use rusqlite::{
    ffi, params, Connection, ErrorCode, OpenFlags, Params, Row, Transaction,
    TransactionBehavior,
};

pub const DB_VERSION: u32 = 0;

#[derive(PartialEq, Eq, Debug)]
pub enum DatabaseError {
    /// A uniqueness constraint rejected an insert. Expected when replaying.
    Duplicate(String),
    /// A query reached past the watermark.
    HeightNotSynced { requested: i64, available: i64 },
    /// A lifecycle transition targeted no live request in an eligible state.
    UnknownRequest(String),
    VersionMismatch { found: u32, expected: u32 },
    Storage(String),
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Duplicate(e) => write!(f, "Database error: already recorded: {}", e),
            Self::HeightNotSynced {
                requested,
                available,
            } => write!(
                f,
                "Database error: height {} requested but only synced up to {}",
                requested, available
            ),
            Self::UnknownRequest(e) => write!(f, "Database error: unknown request: {}", e),
            Self::VersionMismatch { found, expected } => write!(
                f,
                "Database error: unexpected database version: got '{}', expected '{}'",
                found, expected
            ),
            Self::Storage(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<rusqlite::Error> for DatabaseError {
    fn from(e: rusqlite::Error) -> Self {
        db_error("SQLite error", e)
    }
}

/// Classify a SQLite error, prefixing it with what we were doing.
pub(crate) fn db_error(context: &str, e: rusqlite::Error) -> DatabaseError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.code == ErrorCode::ConstraintViolation
            && (err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        {
            return DatabaseError::Duplicate(format!("{}: {}", context, e));
        }
    }

    DatabaseError::Storage(format!("{}: {}", context, e))
}

// Create the db file with RW permissions only for the user
fn create_db_file(db_path: &Path) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    let options = options.read(true).write(true).create_new(true);

    #[cfg(unix)]
    return {
        use std::os::unix::fs::OpenOptionsExt;

        options.mode(0o600).open(db_path)?;
        Ok(())
    };

    #[cfg(not(unix))]
    return {
        options.open(db_path)?;
        Ok(())
    };
}

fn configure_connection(conn: &Connection) -> Result<(), DatabaseError> {
    conn.busy_timeout(Duration::from_secs(60))
        .map_err(|e| db_error("Setting busy timeout", e))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| db_error("Enabling foreign keys", e))?;
    Ok(())
}

/// Open (and create if needed) a store for writing, making sure its schema is in place.
pub fn open_db(db_path: &Path, schema: &str) -> Result<Connection, DatabaseError> {
    if !db_path.exists() {
        log::info!("No database at {:?}, creating a new one.", db_path);
        create_db_file(db_path)
            .map_err(|e| DatabaseError::Storage(format!("Creating db file: {}", e)))?;
    }

    let mut conn = Connection::open(db_path).map_err(|e| db_error("Opening database", e))?;
    configure_connection(&conn)?;
    create_tables(&mut conn, schema)?;

    Ok(conn)
}

/// Open an existing store for reading only, so that readers never block the ingestion writer.
pub fn open_db_read_only(db_path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| db_error("Opening database read-only", e))?;
    configure_connection(&conn)?;
    check_version(&conn)?;

    Ok(conn)
}

/// Create the tables of the given schema if they don't exist yet. Idempotent.
pub fn create_tables(conn: &mut Connection, schema: &str) -> Result<(), DatabaseError> {
    db_exec(conn, |tx| {
        tx.execute_batch(schema)
            .map_err(|e| db_error("Creating database", e))?;
        tx.execute(
            "INSERT INTO version (version) SELECT (?1) WHERE NOT EXISTS (SELECT 1 FROM version)",
            params![DB_VERSION],
        )
        .map_err(|e| db_error("Inserting version", e))?;
        Ok(())
    })?;

    check_version(conn)
}

// Be strict until we have migrations.
fn check_version(conn: &Connection) -> Result<(), DatabaseError> {
    let found = db_version(conn)?;
    if found != DB_VERSION {
        return Err(DatabaseError::VersionMismatch {
            found,
            expected: DB_VERSION,
        });
    }

    Ok(())
}

/// Get the database version
pub fn db_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let mut rows = db_query(conn, "SELECT version FROM version", [], |row| {
        row.get::<_, u32>(0)
    })?;

    rows.pop()
        .ok_or_else(|| DatabaseError::Storage("No row in version table?".to_string()))
}

/// Perform a set of modifications to the database inside a single transaction
pub fn db_exec<F, T>(conn: &mut Connection, modifications: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&Transaction) -> Result<T, DatabaseError>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_error("Creating transaction", e))?;

    // Dropping the transaction on error rolls it back.
    let res = modifications(&tx)?;
    tx.commit()
        .map_err(|e| db_error("Comitting transaction", e))?;

    Ok(res)
}

// Internal helper for queries boilerplate
pub(crate) fn db_query<P, F, T>(
    conn: &Connection,
    stmt_str: &str,
    params: P,
    f: F,
) -> Result<Vec<T>, DatabaseError>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn
        .prepare(stmt_str)
        .map_err(|e| db_error("Preparing query", e))?;
    let rows = stmt
        .query_map(params, f)
        .map_err(|e| db_error("Mapping query", e))?
        .collect::<rusqlite::Result<Vec<T>>>()
        .map_err(|e| db_error("Executing query", e));

    rows
}

/// Query a single integer aggregate (SUM, MAX..), which may be NULL.
pub(crate) fn db_query_scalar<P>(
    conn: &Connection,
    stmt_str: &str,
    params: P,
) -> Result<Option<i64>, DatabaseError>
where
    P: Params,
{
    let mut rows = db_query(conn, stmt_str, params, |row| row.get::<_, Option<i64>>(0))?;

    Ok(rows.pop().flatten())
}

/// The distinct hashes of this list, in order of first appearance. An IN clause only
/// deduplicates within a chunk.
pub(crate) fn distinct_hashes(hashes: &[String]) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(hashes.len());
    hashes
        .iter()
        .map(String::as_str)
        .filter(|hash| seen.insert(*hash))
        .collect()
}

/// Build a "?,?,?" placeholder list for an IN clause.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}
