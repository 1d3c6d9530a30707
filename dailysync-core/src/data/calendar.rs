//! Trading calendars. Gap detection reports every under-populated day; the
//! calendar decides which of those days are expected to carry data.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, Weekday};

pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Monday through Friday.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeekdayCalendar;

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Weekdays minus an explicit holiday list.
#[derive(Debug, Clone, Default)]
pub struct HolidayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }
}

impl TradingCalendar for HolidayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        WeekdayCalendar.is_trading_day(date) && !self.is_holiday(date)
    }
}
