//! CSV directory upstream source.
//!
//! Each table is a file `{base}/{table}.csv` whose header starts with
//! `date,entity`; the remaining columns are carried through untouched.

use crate::domain::error::TidemarkError;
use crate::domain::frame::Frame;
use crate::domain::range::TimeRange;
use crate::ports::source_port::SourcePort;
use std::fs;
use std::path::PathBuf;

pub struct CsvSource {
    base_path: PathBuf,
}

impl CsvSource {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, table: &str) -> PathBuf {
        self.base_path.join(format!("{table}.csv"))
    }
}

impl SourcePort for CsvSource {
    fn query(&self, table: &str, range: Option<TimeRange>) -> Result<Frame, TidemarkError> {
        let path = self.csv_path(table);
        let content = fs::read_to_string(&path).map_err(|e| {
            TidemarkError::source(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut frame = Frame::from_csv(&content).map_err(|e| {
            TidemarkError::source(format!("{}: {}", path.display(), e))
        })?;
        if let Some(range) = range {
            frame = frame.slice(&range);
        }
        frame.sort_by_date();
        Ok(frame)
    }

    fn list_tables(&self) -> Result<Vec<String>, TidemarkError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| {
            TidemarkError::source(format!(
                "failed to list {}: {}",
                self.base_path.display(),
                e
            ))
        })?;

        let mut tables = Vec::new();
        for entry in entries {
            let path = entry.map_err(TidemarkError::source)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                tables.push(stem.to_string());
            }
        }
        tables.sort();
        Ok(tables)
    }
}
