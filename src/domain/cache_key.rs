//! Cache entry keys and the range merge-on-write planner.
//!
//! Range entries are keyed `"{table}:{start}:{end}"` with `YYYYMMDD` dates,
//! version entries `"{table}:{label}"`. Planning is pure so the store adapter
//! only has to execute the resulting [`WritePlan`] against its payloads.

use crate::domain::error::TidemarkError;
use crate::domain::range::TimeRange;
use chrono::NaiveDate;
use std::fmt;

pub const DEFAULT_VERSION: &str = "latest";

const KEY_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Range { table: String, range: TimeRange },
    Version { table: String, label: String },
}

impl CacheKey {
    pub fn range(table: &str, range: TimeRange) -> Result<Self, TidemarkError> {
        validate_table(table)?;
        Ok(CacheKey::Range {
            table: table.to_string(),
            range,
        })
    }

    /// `None` selects the `latest` label.
    pub fn version(table: &str, label: Option<&str>) -> Result<Self, TidemarkError> {
        validate_table(table)?;
        let label = label.unwrap_or(DEFAULT_VERSION);
        if label.is_empty() || label.contains(':') {
            return Err(TidemarkError::MalformedKey {
                key: format!("{table}:{label}"),
                reason: "version label must be non-empty and free of ':'".into(),
            });
        }
        Ok(CacheKey::Version {
            table: table.to_string(),
            label: label.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        match self {
            CacheKey::Range { table, .. } | CacheKey::Version { table, .. } => table,
        }
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        match self {
            CacheKey::Range { range, .. } => Some(*range),
            CacheKey::Version { .. } => None,
        }
    }

    /// Parses a stored key. Two tokens mean a version key, three a range key.
    pub fn parse(key: &str) -> Result<Self, TidemarkError> {
        let malformed = |reason: String| TidemarkError::MalformedKey {
            key: key.to_string(),
            reason,
        };

        let tokens: Vec<&str> = key.split(':').collect();
        match tokens.as_slice() {
            [table, label] => {
                CacheKey::version(table, Some(*label)).map_err(|e| malformed(e.to_string()))
            }
            [table, start, end] => {
                let start = parse_key_date(start).map_err(&malformed)?;
                let end = parse_key_date(end).map_err(&malformed)?;
                let range = TimeRange::new(start, end).map_err(|e| malformed(e.to_string()))?;
                CacheKey::range(table, range).map_err(|e| malformed(e.to_string()))
            }
            _ => Err(malformed(format!(
                "expected 2 or 3 ':'-separated tokens, found {}",
                tokens.len()
            ))),
        }
    }

    /// Parses a stored key that must be a range key of `table`.
    pub fn parse_range_of(table: &str, key: &str) -> Result<TimeRange, TidemarkError> {
        match CacheKey::parse(key)? {
            CacheKey::Range { table: t, range } if t == table => Ok(range),
            CacheKey::Range { table: t, .. } => Err(TidemarkError::MalformedKey {
                key: key.to_string(),
                reason: format!("belongs to table {t:?}, expected {table:?}"),
            }),
            CacheKey::Version { .. } => Err(TidemarkError::MalformedKey {
                key: key.to_string(),
                reason: "expected 3 tokens for a range entry, found 2".into(),
            }),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Range { table, range } => write!(
                f,
                "{}:{}:{}",
                table,
                range.start().format(KEY_DATE_FORMAT),
                range.end().format(KEY_DATE_FORMAT)
            ),
            CacheKey::Version { table, label } => write!(f, "{table}:{label}"),
        }
    }
}

fn validate_table(table: &str) -> Result<(), TidemarkError> {
    if table.is_empty() || table.contains(':') || table.contains('/') {
        return Err(TidemarkError::MalformedKey {
            key: table.to_string(),
            reason: "table name must be non-empty and free of ':' and '/'".into(),
        });
    }
    Ok(())
}

fn parse_key_date(token: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(token, KEY_DATE_FORMAT)
        .map_err(|e| format!("invalid date token {token:?}: {e}"))
}

/// How one cached entry is folded into the pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorb {
    /// Cached range lies inside the write; the cached payload is dropped.
    Replaced(TimeRange),
    /// Write starts at or before the cached start and ends inside it: new rows
    /// before the cached start, then the cached payload.
    LeftOverlap(TimeRange),
    /// Write starts inside the cached range and ends at or after it: the cached
    /// payload, then new rows after the cached end.
    RightOverlap(TimeRange),
}

impl Absorb {
    pub fn cached(&self) -> TimeRange {
        match self {
            Absorb::Replaced(r) | Absorb::LeftOverlap(r) | Absorb::RightOverlap(r) => *r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// Request already fully covered by one cached entry.
    Discard { covered_by: TimeRange },
    /// Store the combined payload under `target` after absorbing entries in order.
    Store {
        target: TimeRange,
        absorbed: Vec<Absorb>,
    },
}

/// Plans a range write against the ranges already stored for the table.
///
/// Cases are tested in order (covered, replaces, left overlap, right overlap,
/// disjoint). After an entry is absorbed the widened target keeps being
/// reconciled with the remaining entries, so a write spanning several cached
/// entries collapses them all into one.
pub fn plan_range_write(
    request: TimeRange,
    existing: &[TimeRange],
) -> Result<WritePlan, TidemarkError> {
    let mut cached: Vec<TimeRange> = existing.to_vec();
    cached.sort();

    let mut target = request;
    let mut absorbed = Vec::new();

    for c in cached {
        if !target.overlaps(&c) {
            continue;
        }

        if c.contains_range(&target) {
            if absorbed.is_empty() {
                return Ok(WritePlan::Discard { covered_by: c });
            }
            return Err(TidemarkError::integrity(format!(
                "cached ranges overlap each other around {c}"
            )));
        } else if target.contains_range(&c) {
            absorbed.push(Absorb::Replaced(c));
        } else if target.start() <= c.start() && target.end() < c.end() {
            absorbed.push(Absorb::LeftOverlap(c));
            target = target.span(&c);
        } else {
            absorbed.push(Absorb::RightOverlap(c));
            target = target.span(&c);
        }
    }

    Ok(WritePlan::Store { target, absorbed })
}
