//! Dividend, share bonus and rights issue events keyed by ex-date.
//!
//! Built from two upstream tables: the dividend table (`per_cash_div`,
//! `per_share_div_ratio`, `per_share_trans_ratio`) and the allotment table
//! (`allotment_ratio`, `allotment_price`). Rows are indexed by ex-date and
//! symbol like any other [`Frame`].

use crate::domain::calendar::TradingCalendar;
use crate::domain::dataset::{DatasetMeta, TrackedDataset, decode_envelope, encode_envelope};
use crate::domain::error::TidemarkError;
use crate::domain::frame::Frame;
use crate::domain::range::{Coverage, TimeRange};
use crate::ports::source_port::SourcePort;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const KIND: &str = "corporate_actions";
pub const DIVIDEND_TABLE: &str = "equ_div";
pub const ALLOTMENT_TABLE: &str = "equ_allot";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorporateAction {
    pub symbol: String,
    /// Cash paid per share.
    pub cash_dividend: f64,
    /// Bonus plus transferred shares per share held.
    pub share_dividend: f64,
    pub rights_ratio: f64,
    pub rights_price: f64,
}

impl CorporateAction {
    fn absorb(&mut self, other: &CorporateAction) {
        self.cash_dividend += other.cash_dividend;
        self.share_dividend += other.share_dividend;
        if other.rights_ratio > 0.0 {
            self.rights_ratio = other.rights_ratio;
        }
        if other.rights_price > 0.0 {
            self.rights_price = other.rights_price;
        }
    }
}

type EventTable = BTreeMap<NaiveDate, BTreeMap<String, CorporateAction>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorporateActions {
    events: EventTable,
    coverage: Coverage,
}

impl CorporateActions {
    pub fn empty(range: TimeRange) -> Self {
        Self {
            events: BTreeMap::new(),
            coverage: Coverage::from_range(range),
        }
    }

    /// Accumulates dividend and allotment rows; same-day events for one
    /// symbol are summed, negative or unreadable amounts count as zero.
    pub fn from_frames(
        range: TimeRange,
        dividends: &Frame,
        allotments: &Frame,
    ) -> Result<Self, TidemarkError> {
        let mut actions = Self::empty(range);

        let cash = column_index(dividends, "per_cash_div");
        let bonus = column_index(dividends, "per_share_div_ratio");
        let transfer = column_index(dividends, "per_share_trans_ratio");
        for row in dividends.rows().iter().filter(|r| range.contains_date(r.date)) {
            let action = CorporateAction {
                symbol: row.entity.clone(),
                cash_dividend: amount(&row.values, cash),
                share_dividend: amount(&row.values, bonus) + amount(&row.values, transfer),
                ..Default::default()
            };
            actions.record(row.date, action);
        }

        let ratio = column_index(allotments, "allotment_ratio");
        let price = column_index(allotments, "allotment_price");
        for row in allotments.rows().iter().filter(|r| range.contains_date(r.date)) {
            let action = CorporateAction {
                symbol: row.entity.clone(),
                rights_ratio: amount(&row.values, ratio),
                rights_price: amount(&row.values, price),
                ..Default::default()
            };
            actions.record(row.date, action);
        }

        Ok(actions)
    }

    fn record(&mut self, date: NaiveDate, action: CorporateAction) {
        let day = self.events.entry(date).or_default();
        match day.get_mut(&action.symbol) {
            Some(existing) => existing.absorb(&action),
            None => {
                day.insert(action.symbol.clone(), action);
            }
        }
    }

    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    pub fn ex_dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.events.keys().copied()
    }

    pub fn on(&self, date: NaiveDate) -> Option<&BTreeMap<String, CorporateAction>> {
        self.events.get(&date)
    }

    pub fn lookup(&self, date: NaiveDate, symbol: &str) -> Option<&CorporateAction> {
        self.events.get(&date)?.get(symbol)
    }

    /// Events inside `range`; coverage is clipped to what was known.
    pub fn between(&self, range: TimeRange) -> CorporateActions {
        let events = self
            .events
            .range(range.start()..=range.end())
            .map(|(d, e)| (*d, e.clone()))
            .collect();
        let mut coverage = Coverage::new();
        for r in self.coverage.ranges().iter().filter(|r| r.overlaps(&range)) {
            let start = r.start().max(range.start());
            let end = r.end().min(range.end());
            if let Ok(clipped) = TimeRange::new(start, end) {
                coverage.insert(clipped);
            }
        }
        CorporateActions { events, coverage }
    }

    pub fn event_count(&self) -> usize {
        self.events.values().map(BTreeMap::len).sum()
    }

    /// Dates covered by `incoming` take its events; the rest are kept.
    pub fn merge(mut self, incoming: CorporateActions) -> CorporateActions {
        self.events
            .retain(|date, _| !incoming.coverage.covers_date(*date));
        self.events.extend(incoming.events);
        self.coverage = self.coverage.union(&incoming.coverage);
        self
    }
}

fn column_index(frame: &Frame, name: &str) -> Option<usize> {
    frame
        .columns()
        .iter()
        .position(|c| c.eq_ignore_ascii_case(name))
}

fn amount(values: &[String], index: Option<usize>) -> f64 {
    index
        .and_then(|i| values.get(i))
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(0.0)
}

pub struct CorporateActionDataset {
    meta: DatasetMeta,
    source: Arc<dyn SourcePort>,
    calendar: Arc<dyn TradingCalendar>,
}

impl CorporateActionDataset {
    pub fn new(
        meta: DatasetMeta,
        source: Arc<dyn SourcePort>,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Self {
        Self {
            meta,
            source,
            calendar,
        }
    }
}

impl TrackedDataset for CorporateActionDataset {
    type Value = CorporateActions;

    fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DatasetMeta {
        &mut self.meta
    }

    fn fetch(&self, range: TimeRange) -> Result<CorporateActions, TidemarkError> {
        let dividends = self.source.query(DIVIDEND_TABLE, Some(range))?;
        let allotments = self.source.query(ALLOTMENT_TABLE, Some(range))?;
        CorporateActions::from_frames(range, &dividends, &allotments)
    }

    fn merge(
        &self,
        old: CorporateActions,
        incoming: CorporateActions,
    ) -> Result<CorporateActions, TidemarkError> {
        Ok(old.merge(incoming))
    }

    fn check(
        &self,
        current: Option<&CorporateActions>,
        today: NaiveDate,
    ) -> Result<Vec<TimeRange>, TidemarkError> {
        Ok(self
            .meta
            .missing(self.calendar.as_ref(), today, current.map(|v| &v.coverage)))
    }

    fn serialize(&self, value: &CorporateActions) -> Result<Vec<u8>, TidemarkError> {
        encode_envelope(KIND, value)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CorporateActions, TidemarkError> {
        decode_envelope(KIND, bytes)
    }
}

/// Owned lookup cache in front of a loader. A request beyond the cached
/// coverage reloads the span of the old and new ranges.
pub struct CorporateActionCache<F>
where
    F: FnMut(TimeRange) -> Result<CorporateActions, TidemarkError>,
{
    loader: F,
    cached: Option<CorporateActions>,
}

impl<F> CorporateActionCache<F>
where
    F: FnMut(TimeRange) -> Result<CorporateActions, TidemarkError>,
{
    pub fn new(loader: F) -> Self {
        Self {
            loader,
            cached: None,
        }
    }

    pub fn get(&mut self, range: TimeRange) -> Result<CorporateActions, TidemarkError> {
        if let Some(cached) = self.cached.as_ref().filter(|c| c.coverage.covers(&range)) {
            return Ok(cached.between(range));
        }

        let wanted = match self.cached.as_ref().and_then(|c| c.coverage.bounds()) {
            Some(bounds) => bounds.span(&range),
            None => range,
        };
        let loaded = (self.loader)(wanted)?;
        let view = loaded.between(range);
        self.cached = Some(loaded);
        Ok(view)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
