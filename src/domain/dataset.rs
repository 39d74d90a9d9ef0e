//! Tracked datasets: units of data kept fresh in the object registry.
//!
//! A dataset knows how to fetch an exact date range from upstream, merge two
//! values, report which ranges its published value is missing, and encode the
//! value for the registry. The sync service drives everything else.

use crate::domain::calendar::TradingCalendar;
use crate::domain::error::TidemarkError;
use crate::domain::range::{Coverage, TimeRange};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// `low_bound` is fixed at construction; `high_water_mark` only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedInterval {
    low_bound: NaiveDate,
    high_water_mark: NaiveDate,
}

impl TrackedInterval {
    pub fn new(low_bound: NaiveDate) -> Self {
        Self {
            low_bound,
            high_water_mark: low_bound,
        }
    }

    pub fn low_bound(&self) -> NaiveDate {
        self.low_bound
    }

    pub fn high_water_mark(&self) -> NaiveDate {
        self.high_water_mark
    }

    /// Returns whether the mark moved.
    pub fn advance(&mut self, to: NaiveDate) -> bool {
        if to > self.high_water_mark {
            self.high_water_mark = to;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetMeta {
    pub identity: String,
    pub name: String,
    pub interval: TrackedInterval,
    /// Include today's session once it is a trading day.
    pub same_day: bool,
}

impl DatasetMeta {
    pub fn new(identity: &str, name: &str, low_bound: NaiveDate, same_day: bool) -> Self {
        Self {
            identity: identity.to_string(),
            name: name.to_string(),
            interval: TrackedInterval::new(low_bound),
            same_day,
        }
    }

    /// The `[low_bound, effective_end]` window the dataset must cover, or
    /// `None` when the low bound lies after the effective end.
    pub fn window(&self, calendar: &dyn TradingCalendar, today: NaiveDate) -> Option<TimeRange> {
        let end = effective_end(calendar, today, self.same_day);
        TimeRange::new(self.interval.low_bound(), end).ok()
    }

    /// Missing ranges for a value whose coverage is known.
    pub fn missing(
        &self,
        calendar: &dyn TradingCalendar,
        today: NaiveDate,
        coverage: Option<&Coverage>,
    ) -> Vec<TimeRange> {
        let Some(window) = self.window(calendar, today) else {
            return Vec::new();
        };
        match coverage {
            None => vec![window],
            Some(cov) => cov.missing_in(calendar, window),
        }
    }
}

/// Today when same-day data is wanted and today trades, else the last session before today.
pub fn effective_end(calendar: &dyn TradingCalendar, today: NaiveDate, same_day: bool) -> NaiveDate {
    if same_day && calendar.is_session(today) {
        today
    } else {
        calendar.previous_session(today)
    }
}

pub trait TrackedDataset: Send {
    type Value: Clone + Send;

    fn meta(&self) -> &DatasetMeta;

    fn meta_mut(&mut self) -> &mut DatasetMeta;

    /// Raw data for exactly `range`, independent of anything fetched before.
    fn fetch(&self, range: TimeRange) -> Result<Self::Value, TidemarkError>;

    /// Union of both inputs' coverage; `incoming` wins on duplicate entries.
    /// On error the caller still holds its own copy of `old`.
    fn merge(&self, old: Self::Value, incoming: Self::Value) -> Result<Self::Value, TidemarkError>;

    /// Maximal disjoint ranges the published value lacks. `None` means nothing
    /// is published yet.
    fn check(
        &self,
        current: Option<&Self::Value>,
        today: NaiveDate,
    ) -> Result<Vec<TimeRange>, TidemarkError>;

    fn serialize(&self, value: &Self::Value) -> Result<Vec<u8>, TidemarkError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Value, TidemarkError>;
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    kind: &'a str,
    payload: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn<T> {
    kind: String,
    payload: T,
}

/// JSON wire format tagged with the dataset kind.
pub fn encode_envelope<T: Serialize>(kind: &str, value: &T) -> Result<Vec<u8>, TidemarkError> {
    serde_json::to_vec(&EnvelopeOut {
        kind,
        payload: value,
    })
    .map_err(|e| TidemarkError::integrity(format!("failed to encode {kind}: {e}")))
}

/// Decodes a payload written by [`encode_envelope`]; a different kind is a type mismatch.
pub fn decode_envelope<T: DeserializeOwned>(kind: &str, bytes: &[u8]) -> Result<T, TidemarkError> {
    let envelope: EnvelopeIn<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| TidemarkError::integrity(format!("unreadable {kind} payload: {e}")))?;
    if envelope.kind != kind {
        return Err(TidemarkError::integrity(format!(
            "type mismatch: expected {kind}, found {}",
            envelope.kind
        )));
    }
    serde_json::from_value(envelope.payload)
        .map_err(|e| TidemarkError::integrity(format!("malformed {kind} payload: {e}")))
}
