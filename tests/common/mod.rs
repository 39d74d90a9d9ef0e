#![allow(dead_code)]

use chrono::{Days, NaiveDate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tidemark::adapters::clock_adapter::FixedClock;
use tidemark::domain::calendar::{TradingCalendar, WeekdayCalendar};
use tidemark::domain::error::TidemarkError;
use tidemark::domain::frame::{Frame, Row};
use tidemark::domain::range::TimeRange;
use tidemark::ports::source_port::SourcePort;

pub struct MockSource {
    pub tables: HashMap<String, Frame>,
    pub errors: HashMap<String, String>,
    pub calls: Mutex<Vec<(String, Option<TimeRange>)>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            errors: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_frame(mut self, table: &str, frame: Frame) -> Self {
        self.tables.insert(table.to_string(), frame);
        self
    }

    pub fn with_error(mut self, table: &str, reason: &str) -> Self {
        self.errors.insert(table.to_string(), reason.to_string());
        self
    }

    pub fn call_count(&self, table: &str) -> usize {
        self.calls.lock().iter().filter(|(t, _)| t == table).count()
    }

    pub fn ranges_for(&self, table: &str) -> Vec<Option<TimeRange>> {
        self.calls
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, r)| *r)
            .collect()
    }
}

impl SourcePort for MockSource {
    fn query(&self, table: &str, range: Option<TimeRange>) -> Result<Frame, TidemarkError> {
        self.calls.lock().push((table.to_string(), range));
        if let Some(reason) = self.errors.get(table) {
            return Err(TidemarkError::SourceUnavailable {
                reason: reason.clone(),
            });
        }
        let frame = self.tables.get(table).cloned().unwrap_or_default();
        Ok(match range {
            Some(r) => frame.slice(&r),
            None => frame,
        })
    }

    fn list_tables(&self) -> Result<Vec<String>, TidemarkError> {
        let mut tables: Vec<String> = self.tables.keys().cloned().collect();
        tables.sort();
        Ok(tables)
    }
}

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Calendar day `n` counted from 2020-01-01.
pub fn day(n: u64) -> NaiveDate {
    d(2020, 1, 1) + Days::new(n)
}

pub fn range(a: NaiveDate, b: NaiveDate) -> TimeRange {
    TimeRange::new(a, b).unwrap()
}

/// One `close` row per calendar day in `[start, end]` for `entity`.
pub fn daily_closes(entity: &str, start: NaiveDate, end: NaiveDate, base: f64) -> Frame {
    let rows = start
        .iter_days()
        .take_while(|date| *date <= end)
        .enumerate()
        .map(|(i, date)| Row {
            date,
            entity: entity.to_string(),
            values: vec![format!("{:.2}", base + i as f64)],
        })
        .collect();
    Frame::from_rows(vec!["close".into()], rows).unwrap()
}

pub fn dividend_rows(events: &[(NaiveDate, &str, f64)]) -> Frame {
    let rows = events
        .iter()
        .map(|(date, symbol, cash)| Row {
            date: *date,
            entity: symbol.to_string(),
            values: vec![cash.to_string(), "0".into(), "0".into()],
        })
        .collect();
    Frame::from_rows(
        vec![
            "per_cash_div".into(),
            "per_share_div_ratio".into(),
            "per_share_trans_ratio".into(),
        ],
        rows,
    )
    .unwrap()
}

pub fn calendar() -> Arc<dyn TradingCalendar> {
    Arc::new(WeekdayCalendar::new())
}

pub fn clock(today: NaiveDate) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(today))
}

/// Every calendar day trades.
pub struct EveryDayCalendar;

impl TradingCalendar for EveryDayCalendar {
    fn is_session(&self, _date: NaiveDate) -> bool {
        true
    }

    fn next_session(&self, date: NaiveDate) -> NaiveDate {
        date + Days::new(1)
    }

    fn previous_session(&self, date: NaiveDate) -> NaiveDate {
        date - Days::new(1)
    }
}

/// Lets a test keep a handle on a [`MockSource`] that an adapter owns.
pub struct SharedSource(pub Arc<MockSource>);

impl SourcePort for SharedSource {
    fn query(&self, table: &str, range: Option<TimeRange>) -> Result<Frame, TidemarkError> {
        self.0.query(table, range)
    }

    fn list_tables(&self) -> Result<Vec<String>, TidemarkError> {
        self.0.list_tables()
    }
}
