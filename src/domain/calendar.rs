//! Trading session calendar.
//!
//! Sessions are weekdays that are not listed as exchange holidays. All range
//! arithmetic in the crate steps through sessions via [`TradingCalendar`].

use crate::domain::error::TidemarkError;
use chrono::{Datelike, Days, NaiveDate, Weekday};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub trait TradingCalendar: Send + Sync {
    fn is_session(&self, date: NaiveDate) -> bool;

    /// First session strictly after `date`.
    fn next_session(&self, date: NaiveDate) -> NaiveDate;

    /// Last session strictly before `date`.
    fn previous_session(&self, date: NaiveDate) -> NaiveDate;

    /// All sessions in `[start, end]`, ascending.
    fn sessions(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        if start > end {
            return out;
        }
        let mut day = if self.is_session(start) {
            start
        } else {
            self.next_session(start)
        };
        while day <= end {
            out.push(day);
            day = self.next_session(day);
        }
        out
    }

    /// `date` itself when it is a session, otherwise the session before it.
    fn session_on_or_before(&self, date: NaiveDate) -> NaiveDate {
        if self.is_session(date) {
            date
        } else {
            self.previous_session(date)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl WeekdayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays<I: IntoIterator<Item = NaiveDate>>(holidays: I) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Reads one `YYYY-MM-DD` date per line; blank lines and `#` comments are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TidemarkError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut holidays = BTreeSet::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let date = NaiveDate::parse_from_str(line, "%Y-%m-%d").map_err(|e| {
                TidemarkError::ConfigInvalid {
                    section: "calendar".into(),
                    key: "holidays".into(),
                    reason: format!("{}:{}: {}", path.display(), lineno + 1, e),
                }
            })?;
            holidays.insert(date);
        }

        Ok(Self { holidays })
    }

    pub fn holiday_count(&self) -> usize {
        self.holidays.len()
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_session(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn next_session(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        loop {
            day = match day.checked_add_days(Days::new(1)) {
                Some(d) => d,
                None => return day,
            };
            if self.is_session(day) {
                return day;
            }
        }
    }

    fn previous_session(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        loop {
            day = match day.checked_sub_days(Days::new(1)) {
                Some(d) => d,
                None => return day,
            };
            if self.is_session(day) {
                return day;
            }
        }
    }
}
