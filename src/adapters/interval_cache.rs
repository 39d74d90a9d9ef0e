//! Interval cache store backed by one SQLite file per table.
//!
//! Each file holds `cache_entries(key, columns, payload)` where `payload` is
//! the CSV rendering of a [`Frame`]. Range entries of a table never overlap:
//! every range write is planned by [`plan_range_write`] and executed inside a
//! single transaction, so a failed write leaves the file untouched.

use crate::domain::cache_key::{Absorb, CacheKey, WritePlan, plan_range_write};
use crate::domain::error::TidemarkError;
use crate::domain::frame::Frame;
use crate::domain::range::TimeRange;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    columns TEXT NOT NULL,
    payload TEXT NOT NULL
);";

pub struct IntervalCacheStore {
    dir: PathBuf,
}

impl IntervalCacheStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, TidemarkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(TidemarkError::store)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.sqlite"))
    }

    fn open(&self, table: &str) -> Result<Connection, TidemarkError> {
        let conn = Connection::open(self.file_for(table)).map_err(TidemarkError::store)?;
        conn.execute_batch(SCHEMA).map_err(TidemarkError::store)?;
        Ok(conn)
    }

    /// `None` when nothing was ever written for the table.
    fn open_existing(&self, table: &str) -> Result<Option<Connection>, TidemarkError> {
        if !self.file_for(table).exists() {
            return Ok(None);
        }
        self.open(table).map(Some)
    }

    /// Stores `data` under `key`. Empty frames are ignored.
    pub fn put(&self, data: &Frame, key: &CacheKey) -> Result<(), TidemarkError> {
        if data.is_empty() {
            debug!(key = %key, "skipping empty cache write");
            return Ok(());
        }

        let mut conn = self.open(key.table())?;
        let tx = conn.transaction().map_err(TidemarkError::store)?;
        match key {
            CacheKey::Version { .. } => write_entry(&tx, &key.to_string(), data)?,
            CacheKey::Range { table, range } => merge_range(&tx, table, *range, data)?,
        }
        tx.commit().map_err(TidemarkError::store)
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool, TidemarkError> {
        let Some(conn) = self.open_existing(key.table())? else {
            return Ok(false);
        };
        match key {
            CacheKey::Version { .. } => Ok(read_payload(&conn, &key.to_string())?.is_some()),
            CacheKey::Range { table, range } => {
                Ok(containing_entry(&conn, table, range)?.is_some())
            }
        }
    }

    /// Version keys return the stored frame; range keys return the slice of
    /// the entry containing the request, optionally projected to `columns`.
    pub fn get(
        &self,
        key: &CacheKey,
        columns: Option<&[String]>,
    ) -> Result<Option<Frame>, TidemarkError> {
        let Some(conn) = self.open_existing(key.table())? else {
            return Ok(None);
        };

        let frame = match key {
            CacheKey::Version { .. } => read_payload(&conn, &key.to_string())?,
            CacheKey::Range { table, range } => match containing_entry(&conn, table, range)? {
                Some(entry) => read_payload(&conn, &entry)?.map(|f| f.slice(range)),
                None => None,
            },
        };

        match (frame, columns) {
            (Some(f), Some(cols)) => f.project(cols).map(Some),
            (frame, _) => Ok(frame),
        }
    }

    /// Raw stored keys of a table, sorted.
    pub fn keys(&self, table: &str) -> Result<Vec<String>, TidemarkError> {
        match self.open_existing(table)? {
            Some(conn) => all_keys(&conn),
            None => Ok(Vec::new()),
        }
    }

    /// Returns whether an entry was deleted.
    pub fn remove(&self, key: &CacheKey) -> Result<bool, TidemarkError> {
        let Some(conn) = self.open_existing(key.table())? else {
            return Ok(false);
        };
        let deleted = conn
            .execute(
                "DELETE FROM cache_entries WHERE key = ?1",
                params![key.to_string()],
            )
            .map_err(TidemarkError::store)?;
        Ok(deleted > 0)
    }
}

fn merge_range(
    tx: &Transaction<'_>,
    table: &str,
    request: TimeRange,
    data: &Frame,
) -> Result<(), TidemarkError> {
    let existing = stored_ranges(tx, table)?;

    let (target, absorbed) = match plan_range_write(request, &existing)? {
        WritePlan::Discard { covered_by } => {
            debug!(table, request = %request, cached = %covered_by, "range already cached");
            return Ok(());
        }
        WritePlan::Store { target, absorbed } => (target, absorbed),
    };

    let mut pending = data.clone();
    pending.sort_by_date();

    for step in &absorbed {
        let cached_key = CacheKey::range(table, step.cached())?.to_string();
        match step {
            Absorb::Replaced(_) => {}
            Absorb::LeftOverlap(c) => {
                let cached = load_required(tx, &cached_key)?;
                let start = c.start();
                pending = pending.filter(|r| r.date < start).concat(cached)?;
            }
            Absorb::RightOverlap(c) => {
                let cached = load_required(tx, &cached_key)?;
                let end = c.end();
                pending = cached.concat(pending.filter(|r| r.date > end))?;
            }
        }
        tx.execute(
            "DELETE FROM cache_entries WHERE key = ?1",
            params![cached_key],
        )
        .map_err(TidemarkError::store)?;
    }

    let target_key = CacheKey::range(table, target)?.to_string();
    write_entry(tx, &target_key, &pending)?;

    if absorbed.is_empty() {
        debug!(table, key = %target_key, rows = pending.len(), "stored new range");
    } else {
        info!(
            table,
            key = %target_key,
            merged = absorbed.len(),
            rows = pending.len(),
            "merged cached ranges"
        );
    }
    Ok(())
}

fn write_entry(conn: &Connection, key: &str, frame: &Frame) -> Result<(), TidemarkError> {
    let columns = serde_json::to_string(frame.columns())
        .map_err(|e| TidemarkError::integrity(e.to_string()))?;
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries (key, columns, payload) VALUES (?1, ?2, ?3)",
        params![key, columns, frame.to_csv()?],
    )
    .map_err(TidemarkError::store)?;
    Ok(())
}

fn read_payload(conn: &Connection, key: &str) -> Result<Option<Frame>, TidemarkError> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM cache_entries WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(TidemarkError::store)?;
    payload.map(|p| Frame::from_csv(&p)).transpose()
}

fn load_required(conn: &Connection, key: &str) -> Result<Frame, TidemarkError> {
    read_payload(conn, key)?
        .ok_or_else(|| TidemarkError::integrity(format!("cache entry {key} vanished mid-write")))
}

fn all_keys(conn: &Connection) -> Result<Vec<String>, TidemarkError> {
    let mut stmt = conn
        .prepare("SELECT key FROM cache_entries ORDER BY key")
        .map_err(TidemarkError::store)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(TidemarkError::store)?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(row.map_err(TidemarkError::store)?);
    }
    Ok(keys)
}

/// Ranges of every range entry. Version entries are skipped; anything that
/// does not parse is an error.
fn stored_ranges(conn: &Connection, table: &str) -> Result<Vec<TimeRange>, TidemarkError> {
    let mut ranges = Vec::new();
    for key in all_keys(conn)? {
        match CacheKey::parse(&key)? {
            CacheKey::Version { .. } => {}
            CacheKey::Range { .. } => ranges.push(CacheKey::parse_range_of(table, &key)?),
        }
    }
    Ok(ranges)
}

fn containing_entry(
    conn: &Connection,
    table: &str,
    request: &TimeRange,
) -> Result<Option<String>, TidemarkError> {
    let found = stored_ranges(conn, table)?
        .into_iter()
        .find(|r| r.contains_range(request));
    found
        .map(|r| CacheKey::range(table, r).map(|k| k.to_string()))
        .transpose()
}
