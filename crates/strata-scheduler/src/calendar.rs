//! Business-day predicates and month-boundary arithmetic.
//!
//! A working day is Monday through Friday. There is no holiday calendar.

use chrono::{Datelike, Days, NaiveDate, Weekday};

/// A calendar month, anchored on its first day.
///
/// Built from any date inside the month, so every value is calendar-valid and
/// none of the helpers below can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(NaiveDate);

impl Month {
    /// The month that contains `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Month(date - Days::new(u64::from(date.day0())))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// 1-based month number.
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn len_days(&self) -> u32 {
        days_in_month(self.year(), self.month())
    }

    /// The following calendar month.
    pub fn next(&self) -> Self {
        Month(self.0 + Days::new(u64::from(self.len_days())))
    }

    /// Day `day` of this month, clamped into `1..=len_days()`.
    pub fn day_clamped(&self, day: u32) -> NaiveDate {
        let day = day.clamp(1, self.len_days());
        self.0 + Days::new(u64::from(day - 1))
    }
}

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month` (1-12) of `year`.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

pub fn is_working_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn last_day_of_month(month: Month) -> NaiveDate {
    month.day_clamped(month.len_days())
}

pub fn first_working_day_of_month(month: Month) -> NaiveDate {
    // Day 1 is Sat or Sun at worst, so Monday is at most two days away.
    let first = month.first_day();
    match first.weekday() {
        Weekday::Sat => first + Days::new(2),
        Weekday::Sun => first + Days::new(1),
        _ => first,
    }
}

pub fn last_working_day_of_month(month: Month) -> NaiveDate {
    let last = last_day_of_month(month);
    match last.weekday() {
        Weekday::Sat => last - Days::new(1),
        Weekday::Sun => last - Days::new(2),
        _ => last,
    }
}
