//! Dead-letter storage for discarded records.
//!
//! Records the dispatcher gives up on are kept in a `SQLite` database so an
//! operator can see what was lost and why. Only ciphertext is stored; the
//! store never holds plaintext events.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::Priority;
use crate::transport::{DiscardSink, DiscardedRecord};

const SELECT_COLUMNS: &str =
    "SELECT id, record_id, priority, retries, event_count, payload, reason, discarded_at \
     FROM dead_letters";

/// A stored dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    /// Row identifier.
    pub id: i64,
    /// Identifier of the discarded record.
    pub record_id: u64,
    /// Priority of the record.
    pub priority: Priority,
    /// Failed attempts before discard.
    pub retries: u32,
    /// Events in the batch.
    pub event_count: usize,
    /// Undelivered ciphertext.
    pub payload: String,
    /// Last failure.
    pub reason: String,
    /// When the record was discarded.
    pub discarded_at: DateTime<Utc>,
}

/// `SQLite`-backed store of discarded records.
///
/// The connection sits behind a mutex so the store can be shared with the
/// dispatcher as a [`DiscardSink`].
#[derive(Debug)]
pub struct DeadLetterStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl DeadLetterStore {
    /// Open or create a store at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening dead-letter store at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Dead-letter store opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        migrations::initialize_schema(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a discarded record and return its row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert(&self, record: &DiscardedRecord) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            r"
            INSERT INTO dead_letters
                (record_id, priority, retries, event_count, payload, reason, discarded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                i64::try_from(record.record_id).unwrap_or(i64::MAX),
                record.priority.code(),
                record.retries,
                i64::try_from(record.event_count).unwrap_or(i64::MAX),
                record.ciphertext,
                record.reason,
                timestamp(record.discarded_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, record_id = record.record_id, "Stored dead letter");
        Ok(id)
    }

    /// Fetch one dead letter by row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<DeadLetter>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let letter = self
            .conn()
            .query_row(&sql, [id], Self::row_to_dead_letter)
            .optional()?;
        Ok(letter)
    }

    /// Most recently discarded records first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY discarded_at DESC, id DESC LIMIT ?1");
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let letters = stmt
            .query_map([limit_param(limit)], Self::row_to_dead_letter)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(letters)
    }

    /// Most recent dead letters of one priority.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn by_priority(&self, priority: Priority, limit: usize) -> Result<Vec<DeadLetter>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE priority = ?1 ORDER BY discarded_at DESC, id DESC LIMIT ?2"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let letters = stmt
            .query_map(
                params![priority.code(), limit_param(limit)],
                Self::row_to_dead_letter,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(letters)
    }

    /// Total dead letters stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete dead letters older than `max_age`; returns how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - max_age);
        let affected = self
            .conn()
            .execute("DELETE FROM dead_letters WHERE discarded_at < ?1", [cutoff])?;
        if affected > 0 {
            info!("Pruned {} old dead letters", affected);
        }
        Ok(affected)
    }

    /// Summary counts for the store.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn stats(&self) -> Result<DeadLetterStats> {
        let total = self.count()?;

        let mut by_priority = [0i64; 3];
        {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT priority, COUNT(*) FROM dead_letters GROUP BY priority")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, u8>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (code, count) = row?;
                match Priority::from_code(code) {
                    Ok(priority) => by_priority[priority.index()] = count,
                    Err(_) => warn!("Ignoring dead letters with unknown priority {}", code),
                }
            }
        }

        let (oldest, newest): (Option<String>, Option<String>) = self.conn().query_row(
            "SELECT MIN(discarded_at), MAX(discarded_at) FROM dead_letters",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(DeadLetterStats {
            total,
            by_priority,
            oldest: oldest.as_deref().and_then(parse_timestamp),
            newest: newest.as_deref().and_then(parse_timestamp),
            db_size_bytes,
        })
    }

    fn row_to_dead_letter(row: &rusqlite::Row) -> rusqlite::Result<DeadLetter> {
        let code: u8 = row.get(2)?;
        let priority = Priority::from_code(code).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Integer,
                Box::<dyn std::error::Error + Send + Sync>::from(e.to_string()),
            )
        })?;
        let discarded_at: String = row.get(7)?;

        Ok(DeadLetter {
            id: row.get(0)?,
            record_id: u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
            priority,
            retries: row.get(3)?,
            event_count: usize::try_from(row.get::<_, i64>(4)?).unwrap_or_default(),
            payload: row.get(5)?,
            reason: row.get(6)?,
            discarded_at: parse_timestamp(&discarded_at).unwrap_or_else(Utc::now),
        })
    }
}

impl DiscardSink for DeadLetterStore {
    fn discard(&self, record: DiscardedRecord) {
        if let Err(e) = self.insert(&record) {
            warn!(
                record_id = record.record_id,
                error = %e,
                "Failed to store dead letter"
            );
        }
    }
}

/// Summary of the dead-letter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    /// Dead letters stored.
    pub total: i64,
    /// Counts per priority, highest first.
    pub by_priority: [i64; 3],
    /// Oldest discard time.
    pub oldest: Option<DateTime<Utc>>,
    /// Newest discard time.
    pub newest: Option<DateTime<Utc>>,
    /// Database file size in bytes; 0 for in-memory stores.
    pub db_size_bytes: u64,
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
