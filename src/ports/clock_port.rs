//! Wall-clock port, so freshness checks can be pinned in tests.

use chrono::NaiveDate;

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}
