//! Dataset mirroring one upstream time-series table.

use crate::domain::calendar::TradingCalendar;
use crate::domain::dataset::{DatasetMeta, TrackedDataset, decode_envelope, encode_envelope};
use crate::domain::error::TidemarkError;
use crate::domain::frame::Frame;
use crate::domain::range::{Coverage, TimeRange};
use crate::ports::source_port::SourcePort;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const KIND: &str = "table_series";

/// Rows plus the date ranges they are known to be complete for. Coverage is
/// tracked separately because a range can legitimately hold no rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub frame: Frame,
    pub coverage: Coverage,
}

impl SeriesSnapshot {
    pub fn slice(&self, range: &TimeRange) -> Frame {
        self.frame.slice(range)
    }
}

pub struct TableSeriesDataset {
    meta: DatasetMeta,
    table: String,
    source: Arc<dyn SourcePort>,
    calendar: Arc<dyn TradingCalendar>,
}

impl TableSeriesDataset {
    pub fn new(
        meta: DatasetMeta,
        table: &str,
        source: Arc<dyn SourcePort>,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Self {
        Self {
            meta,
            table: table.to_string(),
            source,
            calendar,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl TrackedDataset for TableSeriesDataset {
    type Value = SeriesSnapshot;

    fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DatasetMeta {
        &mut self.meta
    }

    fn fetch(&self, range: TimeRange) -> Result<SeriesSnapshot, TidemarkError> {
        let mut frame = self.source.query(&self.table, Some(range))?.slice(&range);
        frame.sort_by_date();
        Ok(SeriesSnapshot {
            frame,
            coverage: Coverage::from_range(range),
        })
    }

    fn merge(
        &self,
        old: SeriesSnapshot,
        incoming: SeriesSnapshot,
    ) -> Result<SeriesSnapshot, TidemarkError> {
        let coverage = old.coverage.union(&incoming.coverage);
        let frame = old.frame.upsert(incoming.frame)?;
        Ok(SeriesSnapshot { frame, coverage })
    }

    fn check(
        &self,
        current: Option<&SeriesSnapshot>,
        today: NaiveDate,
    ) -> Result<Vec<TimeRange>, TidemarkError> {
        Ok(self
            .meta
            .missing(self.calendar.as_ref(), today, current.map(|s| &s.coverage)))
    }

    fn serialize(&self, value: &SeriesSnapshot) -> Result<Vec<u8>, TidemarkError> {
        encode_envelope(KIND, value)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<SeriesSnapshot, TidemarkError> {
        decode_envelope(KIND, bytes)
    }
}
