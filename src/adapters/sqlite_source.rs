//! SQLite upstream source.
//!
//! Upstream tables carry a `date TEXT` (`YYYY-MM-DD`) and an `entity TEXT`
//! column; every other column is read as text into the returned [`Frame`].

use crate::domain::error::TidemarkError;
use crate::domain::frame::{Frame, Row};
use crate::domain::range::TimeRange;
use crate::ports::source_port::SourcePort;
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use rusqlite::types::Value;
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct SqliteSource {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteSource {
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self, TidemarkError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e: r2d2::Error| TidemarkError::source(e))?;
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, TidemarkError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| TidemarkError::source(e))?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, TidemarkError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| TidemarkError::source(e))
    }

    /// Creates `table` with the index columns plus `columns` as text.
    pub fn create_table(&self, table: &str, columns: &[String]) -> Result<(), TidemarkError> {
        validate_identifier(table)?;
        for c in columns {
            validate_identifier(c)?;
        }
        let extra: String = columns.iter().map(|c| format!(", {c} TEXT")).collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                date TEXT NOT NULL,
                entity TEXT NOT NULL{extra},
                PRIMARY KEY (date, entity)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_date ON {table}(date);"
        );
        self.conn()?
            .execute_batch(&sql)
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))
    }

    pub fn insert_frame(&self, table: &str, frame: &Frame) -> Result<(), TidemarkError> {
        validate_identifier(table)?;
        let mut names = vec!["date".to_string(), "entity".to_string()];
        for c in frame.columns() {
            validate_identifier(c)?;
            names.push(c.clone());
        }
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {table} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        );

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))?;
        for row in frame.rows() {
            let mut values = vec![row.date.format(DATE_FORMAT).to_string(), row.entity.clone()];
            values.extend(row.values.iter().cloned());
            tx.execute(&sql, rusqlite::params_from_iter(values.iter()))
                .map_err(|e: rusqlite::Error| TidemarkError::source(e))?;
        }
        tx.commit()
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))
    }
}

impl SourcePort for SqliteSource {
    fn query(&self, table: &str, range: Option<TimeRange>) -> Result<Frame, TidemarkError> {
        validate_identifier(table)?;
        let conn = self.conn()?;

        let (sql, bounds) = match range {
            Some(r) => (
                format!("SELECT * FROM {table} WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC"),
                vec![
                    r.start().format(DATE_FORMAT).to_string(),
                    r.end().format(DATE_FORMAT).to_string(),
                ],
            ),
            None => (format!("SELECT * FROM {table} ORDER BY date ASC"), vec![]),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))?;

        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let date_idx = index_of(&names, "date", table)?;
        let entity_idx = index_of(&names, "entity", table)?;
        let value_idx: Vec<usize> = (0..names.len())
            .filter(|i| *i != date_idx && *i != entity_idx)
            .collect();
        let columns = value_idx.iter().map(|&i| names[i].clone()).collect();

        let raw = stmt
            .query_map(rusqlite::params_from_iter(bounds.iter()), |row| {
                let mut cells = Vec::with_capacity(names.len());
                for i in 0..names.len() {
                    cells.push(row.get::<_, Value>(i)?);
                }
                Ok(cells)
            })
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))?;

        let mut frame = Frame::new(columns);
        for cells in raw {
            let cells = cells.map_err(|e: rusqlite::Error| TidemarkError::source(e))?;
            let date_str = render(&cells[date_idx]);
            let date = NaiveDate::parse_from_str(&date_str, DATE_FORMAT).map_err(|e| {
                TidemarkError::source(format!("invalid date {date_str:?} in {table}: {e}"))
            })?;
            frame.push(Row {
                date,
                entity: render(&cells[entity_idx]),
                values: value_idx.iter().map(|&i| render(&cells[i])).collect(),
            })?;
        }
        Ok(frame)
    }

    fn list_tables(&self) -> Result<Vec<String>, TidemarkError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))?;
        let rows = stmt
            .query_map(params![], |row| row.get::<_, String>(0))
            .map_err(|e: rusqlite::Error| TidemarkError::source(e))?;

        let mut tables = Vec::new();
        for row in rows {
            tables.push(row.map_err(|e: rusqlite::Error| TidemarkError::source(e))?);
        }
        Ok(tables)
    }
}

fn index_of(names: &[String], wanted: &str, table: &str) -> Result<usize, TidemarkError> {
    names
        .iter()
        .position(|n| n.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| TidemarkError::source(format!("table {table} has no {wanted} column")))
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => hex::encode(b),
    }
}

fn validate_identifier(name: &str) -> Result<(), TidemarkError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TidemarkError::source(format!(
            "invalid table or column name {name:?}"
        )))
    }
}
