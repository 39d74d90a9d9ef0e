//! Clock implementations.

use crate::ports::clock_port::Clock;
use chrono::{Days, NaiveDate};
use parking_lot::Mutex;

/// Local calendar date of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Settable clock for replaying a given day.
#[derive(Debug)]
pub struct FixedClock {
    today: Mutex<NaiveDate>,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock() = today;
    }

    pub fn advance_days(&self, days: u64) {
        let mut today = self.today.lock();
        *today = *today + Days::new(days);
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_moves_only_when_told() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.today(), start);
        clock.advance_days(1);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        clock.set(start);
        assert_eq!(clock.today(), start);
    }
}
