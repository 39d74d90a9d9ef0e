//! Tabular dataset keyed by trading date.
//!
//! A [`Frame`] is a list of rows sharing one column layout. Every row carries
//! its trading date and an entity (usually a security code) as the index; the
//! remaining cells are kept as text so that heterogeneous upstream tables
//! round-trip through the cache without a schema registry.

use crate::domain::error::TidemarkError;
use crate::domain::range::TimeRange;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub date: NaiveDate,
    pub entity: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Result<Self, TidemarkError> {
        let mut frame = Self::new(columns);
        for row in rows {
            frame.push(row)?;
        }
        Ok(frame)
    }

    pub fn push(&mut self, row: Row) -> Result<(), TidemarkError> {
        if row.values.len() != self.columns.len() {
            return Err(TidemarkError::integrity(format!(
                "row for {} on {} has {} values, frame has {} columns",
                row.entity,
                row.date,
                row.values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn date_bounds(&self) -> Option<TimeRange> {
        let min = self.rows.iter().map(|r| r.date).min()?;
        let max = self.rows.iter().map(|r| r.date).max()?;
        Some(TimeRange::new(min, max).unwrap_or(TimeRange::single(min)))
    }

    /// Stable sort, so rows of the same date keep their relative order.
    pub fn sort_by_date(&mut self) {
        self.rows.sort_by_key(|r| r.date);
    }

    pub fn slice(&self, range: &TimeRange) -> Frame {
        self.filter(|row| range.contains_date(row.date))
    }

    pub fn filter<F: Fn(&Row) -> bool>(&self, keep: F) -> Frame {
        Frame {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    pub fn project(&self, columns: &[String]) -> Result<Frame, TidemarkError> {
        let mut indices = Vec::with_capacity(columns.len());
        for name in columns {
            let idx = self
                .columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| TidemarkError::integrity(format!("unknown column {name:?}")))?;
            indices.push(idx);
        }

        let rows = self
            .rows
            .iter()
            .map(|r| Row {
                date: r.date,
                entity: r.entity.clone(),
                values: indices.iter().map(|&i| r.values[i].clone()).collect(),
            })
            .collect();

        Ok(Frame {
            columns: columns.to_vec(),
            rows,
        })
    }

    /// Appends `other`'s rows; column layouts must match exactly.
    pub fn concat(mut self, other: Frame) -> Result<Frame, TidemarkError> {
        if self.columns.is_empty() && self.rows.is_empty() {
            return Ok(other);
        }
        if other.columns.is_empty() && other.rows.is_empty() {
            return Ok(self);
        }
        if self.columns != other.columns {
            return Err(TidemarkError::integrity(format!(
                "column mismatch: {:?} vs {:?}",
                self.columns, other.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(self)
    }

    /// Union keyed by `(date, entity)`; rows from `incoming` replace equal keys.
    pub fn upsert(self, incoming: Frame) -> Result<Frame, TidemarkError> {
        if self.columns.is_empty() && self.rows.is_empty() {
            let mut out = incoming;
            out.sort_by_date();
            return Ok(out);
        }
        if !incoming.columns.is_empty() && self.columns != incoming.columns {
            return Err(TidemarkError::integrity(format!(
                "column mismatch: {:?} vs {:?}",
                self.columns, incoming.columns
            )));
        }

        let columns = self.columns;
        let mut keyed: BTreeMap<(NaiveDate, String), Row> = BTreeMap::new();
        for row in self.rows.into_iter().chain(incoming.rows) {
            keyed.insert((row.date, row.entity.clone()), row);
        }

        Ok(Frame {
            columns,
            rows: keyed.into_values().collect(),
        })
    }

    pub fn to_csv(&self) -> Result<String, TidemarkError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());

        let mut header = vec!["date".to_string(), "entity".to_string()];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header)
            .map_err(|e| TidemarkError::integrity(format!("CSV write error: {e}")))?;

        for row in &self.rows {
            let mut record = Vec::with_capacity(row.values.len() + 2);
            record.push(row.date.format(DATE_FORMAT).to_string());
            record.push(row.entity.clone());
            record.extend(row.values.iter().cloned());
            wtr.write_record(&record)
                .map_err(|e| TidemarkError::integrity(format!("CSV write error: {e}")))?;
        }

        let bytes = wtr
            .into_inner()
            .map_err(|e| TidemarkError::integrity(format!("CSV flush error: {e}")))?;
        String::from_utf8(bytes).map_err(|e| TidemarkError::integrity(e.to_string()))
    }

    /// Parses the layout written by [`Frame::to_csv`]: `date,entity,<columns...>`.
    pub fn from_csv(content: &str) -> Result<Frame, TidemarkError> {
        let mut rdr = csv::Reader::from_reader(content.as_bytes());

        let headers = rdr
            .headers()
            .map_err(|e| TidemarkError::integrity(format!("CSV parse error: {e}")))?
            .clone();
        if headers.len() < 2 || &headers[0] != "date" || &headers[1] != "entity" {
            return Err(TidemarkError::integrity(format!(
                "CSV header must start with date,entity; got {:?}",
                headers.iter().collect::<Vec<_>>()
            )));
        }
        let columns: Vec<String> = headers.iter().skip(2).map(str::to_string).collect();

        let mut frame = Frame::new(columns);
        for result in rdr.records() {
            let record =
                result.map_err(|e| TidemarkError::integrity(format!("CSV parse error: {e}")))?;
            let date_str = record
                .get(0)
                .ok_or_else(|| TidemarkError::integrity("missing date column"))?;
            let date = NaiveDate::parse_from_str(date_str, DATE_FORMAT).map_err(|e| {
                TidemarkError::integrity(format!("invalid date {date_str:?}: {e}"))
            })?;
            let entity = record.get(1).unwrap_or_default().to_string();
            let values = record.iter().skip(2).map(str::to_string).collect();
            frame.push(Row {
                date,
                entity,
                values,
            })?;
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn row(date: NaiveDate, entity: &str, close: &str, volume: &str) -> Row {
        Row {
            date,
            entity: entity.into(),
            values: vec![close.into(), volume.into()],
        }
    }

    fn sample() -> Frame {
        Frame::from_rows(
            vec!["close".into(), "volume".into()],
            vec![
                row(d(2024, 1, 2), "BHP", "100.5", "1000"),
                row(d(2024, 1, 3), "BHP", "101.0", "1200"),
                row(d(2024, 1, 4), "BHP", "99.5", "900"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn push_rejects_wrong_width() {
        let mut frame = Frame::new(vec!["close".into()]);
        let result = frame.push(row(d(2024, 1, 2), "BHP", "1", "2"));
        assert!(matches!(result, Err(TidemarkError::Integrity { .. })));
    }

    #[test]
    fn slice_keeps_inclusive_bounds() {
        let frame = sample();
        let range = TimeRange::new(d(2024, 1, 3), d(2024, 1, 4)).unwrap();
        let sliced = frame.slice(&range);
        assert_eq!(sliced.len(), 2);
        assert_eq!(sliced.rows()[0].date, d(2024, 1, 3));
    }

    #[test]
    fn project_selects_columns() {
        let frame = sample();
        let projected = frame.project(&["volume".to_string()]).unwrap();
        assert_eq!(projected.columns(), &["volume".to_string()]);
        assert_eq!(projected.rows()[1].values, vec!["1200".to_string()]);
    }

    #[test]
    fn project_unknown_column_fails() {
        let result = sample().project(&["open".to_string()]);
        assert!(matches!(result, Err(TidemarkError::Integrity { .. })));
    }

    #[test]
    fn upsert_incoming_wins_on_duplicate_key() {
        let old = sample();
        let incoming = Frame::from_rows(
            vec!["close".into(), "volume".into()],
            vec![
                row(d(2024, 1, 4), "BHP", "98.0", "950"),
                row(d(2024, 1, 5), "BHP", "97.0", "800"),
            ],
        )
        .unwrap();

        let merged = old.upsert(incoming).unwrap();
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.rows()[2].values[0], "98.0");
        assert_eq!(merged.rows()[3].date, d(2024, 1, 5));
    }

    #[test]
    fn concat_rejects_column_mismatch() {
        let other = Frame::from_rows(
            vec!["open".into()],
            vec![Row {
                date: d(2024, 1, 5),
                entity: "BHP".into(),
                values: vec!["1".into()],
            }],
        )
        .unwrap();
        assert!(sample().concat(other).is_err());
    }

    #[test]
    fn csv_round_trip_preserves_quoting() {
        let frame = Frame::from_rows(
            vec!["name".into()],
            vec![Row {
                date: d(2024, 1, 2),
                entity: "XYZ".into(),
                values: vec!["Acme, Inc.".into()],
            }],
        )
        .unwrap();
        let parsed = Frame::from_csv(&frame.to_csv().unwrap()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn from_csv_requires_index_header() {
        let result = Frame::from_csv("day,close\n2024-01-02,1\n");
        assert!(matches!(result, Err(TidemarkError::Integrity { .. })));
    }

    #[test]
    fn date_bounds_of_empty_frame() {
        assert!(Frame::new(vec![]).date_bounds().is_none());
        assert_eq!(
            sample().date_bounds(),
            Some(TimeRange::new(d(2024, 1, 2), d(2024, 1, 4)).unwrap())
        );
    }
}
