//! Closed trading-date ranges and coverage sets.

use crate::domain::calendar::TradingCalendar;
use crate::domain::error::TidemarkError;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed `[start, end]` range; `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct TimeRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawRange> for TimeRange {
    type Error = TidemarkError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, TidemarkError> {
        if start > end {
            return Err(TidemarkError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest range covering both.
    pub fn span(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    fn touches(&self, other: &TimeRange) -> bool {
        if self.overlaps(other) {
            return true;
        }
        let (first, second) = if self.end < other.start {
            (self, other)
        } else {
            (other, self)
        };
        first.end.checked_add_days(Days::new(1)) == Some(second.start)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Groups ascending session dates into maximal runs of consecutive sessions.
pub fn ranges_from_sessions(
    calendar: &dyn TradingCalendar,
    sessions: &[NaiveDate],
) -> Vec<TimeRange> {
    let mut ranges = Vec::new();
    let mut iter = sessions.iter().copied();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let mut current = TimeRange::single(first);
    for date in iter {
        if date <= current.end {
            continue;
        }
        if calendar.next_session(current.end) == date {
            current.end = date;
        } else {
            ranges.push(current);
            current = TimeRange::single(date);
        }
    }
    ranges.push(current);
    ranges
}

/// Normalized union of ranges: sorted, non-overlapping, calendar-day gaps only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coverage {
    ranges: Vec<TimeRange>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_range(range: TimeRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn insert(&mut self, range: TimeRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.touches(&r) => *last = last.span(&r),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn union(&self, other: &Coverage) -> Coverage {
        let mut out = self.clone();
        for r in &other.ranges {
            out.insert(*r);
        }
        out
    }

    pub fn covers_date(&self, date: NaiveDate) -> bool {
        self.ranges.iter().any(|r| r.contains_date(date))
    }

    pub fn covers(&self, range: &TimeRange) -> bool {
        self.ranges.iter().any(|r| r.contains_range(range))
    }

    pub fn bounds(&self) -> Option<TimeRange> {
        let first = self.ranges.first()?;
        let last = self.ranges.last()?;
        Some(first.span(last))
    }

    /// Maximal session runs inside `window` that this coverage does not reach.
    pub fn missing_in(&self, calendar: &dyn TradingCalendar, window: TimeRange) -> Vec<TimeRange> {
        let missing: Vec<NaiveDate> = calendar
            .sessions(window.start, window.end)
            .into_iter()
            .filter(|d| !self.covers_date(*d))
            .collect();
        ranges_from_sessions(calendar, &missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::calendar::WeekdayCalendar;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn r(a: NaiveDate, b: NaiveDate) -> TimeRange {
        TimeRange::new(a, b).unwrap()
    }

    #[test]
    fn new_rejects_inverted_range() {
        let result = TimeRange::new(d(2024, 1, 5), d(2024, 1, 4));
        assert!(matches!(result, Err(TidemarkError::InvalidRange { .. })));
    }

    #[test]
    fn containment_and_overlap() {
        let outer = r(d(2024, 1, 1), d(2024, 1, 31));
        let inner = r(d(2024, 1, 10), d(2024, 1, 20));
        let straddle = r(d(2024, 1, 25), d(2024, 2, 5));
        let apart = r(d(2024, 3, 1), d(2024, 3, 2));

        assert!(outer.contains_range(&inner));
        assert!(!inner.contains_range(&outer));
        assert!(outer.overlaps(&straddle));
        assert!(!outer.overlaps(&apart));
        assert_eq!(outer.span(&straddle), r(d(2024, 1, 1), d(2024, 2, 5)));
    }

    #[test]
    fn sessions_group_into_runs() {
        let cal = WeekdayCalendar::new();
        // Thu, Fri, Mon are consecutive sessions; Wed after a gap is not.
        let days = [d(2024, 1, 4), d(2024, 1, 5), d(2024, 1, 8), d(2024, 1, 10)];
        let ranges = ranges_from_sessions(&cal, &days);
        assert_eq!(
            ranges,
            vec![r(d(2024, 1, 4), d(2024, 1, 8)), TimeRange::single(d(2024, 1, 10))]
        );
    }

    #[test]
    fn sessions_empty_input() {
        let cal = WeekdayCalendar::new();
        assert!(ranges_from_sessions(&cal, &[]).is_empty());
    }

    #[test]
    fn coverage_merges_overlapping_and_adjacent() {
        let mut cov = Coverage::new();
        cov.insert(r(d(2024, 1, 10), d(2024, 1, 20)));
        cov.insert(r(d(2024, 1, 1), d(2024, 1, 9)));
        cov.insert(r(d(2024, 2, 1), d(2024, 2, 3)));
        assert_eq!(
            cov.ranges(),
            &[r(d(2024, 1, 1), d(2024, 1, 20)), r(d(2024, 2, 1), d(2024, 2, 3))]
        );
        assert_eq!(cov.bounds(), Some(r(d(2024, 1, 1), d(2024, 2, 3))));
    }

    #[test]
    fn missing_in_empty_coverage_is_whole_window() {
        let cal = WeekdayCalendar::new();
        let window = r(d(2024, 1, 1), d(2024, 1, 31));
        let missing = Coverage::new().missing_in(&cal, window);
        assert_eq!(missing, vec![r(d(2024, 1, 1), d(2024, 1, 31))]);
    }

    #[test]
    fn missing_in_ignores_weekend_gaps() {
        let cal = WeekdayCalendar::new();
        let mut cov = Coverage::new();
        cov.insert(r(d(2024, 1, 1), d(2024, 1, 5)));
        cov.insert(r(d(2024, 1, 8), d(2024, 1, 12)));
        let missing = cov.missing_in(&cal, r(d(2024, 1, 1), d(2024, 1, 17)));
        assert_eq!(missing, vec![r(d(2024, 1, 15), d(2024, 1, 17))]);
    }

    #[test]
    fn serde_rejects_inverted_range() {
        let json = r#"{"start":"2024-01-05","end":"2024-01-01"}"#;
        assert!(serde_json::from_str::<TimeRange>(json).is_err());
    }
}
