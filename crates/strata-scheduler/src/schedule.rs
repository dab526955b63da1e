use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::{
    calendar::{
        first_working_day_of_month, last_day_of_month, last_working_day_of_month, Month,
    },
    error::Result,
    types::{parse_timezone, DayOfMonth, MonthlyPattern, ScheduleDefinition, TimeOfDay},
};

/// Today plus tomorrow, plus one more day in case tomorrow's only slot falls
/// in a DST gap.
const DAILY_SCAN_DAYS: u64 = 3;
/// Two full weeks: when today's slot has passed and next week's slot on the
/// same weekday falls in a DST gap, the week after still matches.
const WEEKLY_SCAN_DAYS: u64 = 15;
/// A target day resolves within two month-steps; the third covers a DST gap.
const MONTHLY_SCAN_MONTHS: usize = 3;

/// Compute the earliest instant strictly after `after` that satisfies
/// `definition`, evaluating wall-clock rules in `tz`.
///
/// Returns `Ok(None)` only for a `one_time` schedule whose instant is not in
/// the future. Local times skipped by a DST transition do not exist and the
/// scan moves on to the next slot; repeated local times fire once, at the
/// earlier instant.
pub fn compute_next<T: TimeZone>(
    definition: &ScheduleDefinition,
    after: DateTime<Utc>,
    tz: &T,
) -> Result<Option<DateTime<Utc>>> {
    definition.validate()?;

    let next = match definition {
        ScheduleDefinition::Interval { interval } => after.checked_add_signed(interval.duration()),

        ScheduleDefinition::Daily { times } => {
            scan_days(after, tz, DAILY_SCAN_DAYS, |_| true, times)
        }

        ScheduleDefinition::Weekly { weekdays, times } => scan_days(
            after,
            tz,
            WEEKLY_SCAN_DAYS,
            |day| weekdays.contains(&day.weekday()),
            times,
        ),

        ScheduleDefinition::MonthlyDay { day_of_month, at } => {
            scan_months(after, tz, *at, |month| match day_of_month {
                DayOfMonth::Day(d) => month.day_clamped(u32::from(*d)),
                DayOfMonth::Last => last_day_of_month(month),
            })
        }

        ScheduleDefinition::MonthlyPattern { pattern, at } => {
            scan_months(after, tz, *at, |month| pattern_day(*pattern, month))
        }

        ScheduleDefinition::OneTime { at_datetime } => {
            (*at_datetime > after).then_some(*at_datetime)
        }
    };

    if next.is_none() && !matches!(definition, ScheduleDefinition::OneTime { .. }) {
        // Bounded scans always hit for valid definitions; reaching this means
        // every candidate fell into DST gaps or the interval overflowed.
        warn!(kind = definition.kind(), %after, "no occurrence found within scan window");
    }
    Ok(next)
}

/// Up to `count` upcoming occurrences after `from`, each computed from the
/// previous one. Stops early when the schedule has no further occurrence.
pub fn next_occurrences<T: TimeZone>(
    definition: &ScheduleDefinition,
    from: DateTime<Utc>,
    tz: &T,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = from;
    while out.len() < count {
        // compute_next is strictly-after, so the previous occurrence is
        // already the smallest usable step forward.
        match compute_next(definition, cursor, tz)? {
            Some(next) => {
                out.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    Ok(out)
}

/// Resolve the zone used for schedules without their own timezone:
/// the configured name, then `$TZ`, then UTC.
pub fn default_timezone(configured: Option<&str>) -> Result<Tz> {
    if let Some(name) = configured {
        return parse_timezone(name);
    }
    Ok(std::env::var("TZ")
        .ok()
        .and_then(|name| parse_timezone(name.trim_start_matches(':')).ok())
        .unwrap_or(Tz::UTC))
}

fn pattern_day(pattern: MonthlyPattern, month: Month) -> NaiveDate {
    match pattern {
        MonthlyPattern::FirstWorkingDay => first_working_day_of_month(month),
        MonthlyPattern::LastWorkingDay => last_working_day_of_month(month),
        MonthlyPattern::FirstDay => month.first_day(),
        MonthlyPattern::LastDay => last_day_of_month(month),
    }
}

/// Map a wall-clock time in `tz` to an instant. `None` inside a DST gap.
fn resolve_local<T: TimeZone>(tz: &T, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Walk `days` local days starting at the local date of `after`, pairing each
/// matching day with every time of day, and return the first instant past
/// `after`. Candidates are generated in ascending order, so the first hit is
/// the minimum.
fn scan_days<T: TimeZone>(
    after: DateTime<Utc>,
    tz: &T,
    days: u64,
    day_matches: impl Fn(NaiveDate) -> bool,
    times: &BTreeSet<TimeOfDay>,
) -> Option<DateTime<Utc>> {
    let start = after.with_timezone(tz).date_naive();
    (0..days)
        .map(|offset| start + Days::new(offset))
        .filter(|day| day_matches(*day))
        .flat_map(|day| times.iter().map(move |t| day.and_time(t.as_naive())))
        .filter_map(|local| resolve_local(tz, local))
        .find(|candidate| *candidate > after)
}

fn scan_months<T: TimeZone>(
    after: DateTime<Utc>,
    tz: &T,
    at: TimeOfDay,
    target_day: impl Fn(Month) -> NaiveDate,
) -> Option<DateTime<Utc>> {
    let mut month = Month::containing(after.with_timezone(tz).date_naive());
    for _ in 0..MONTHLY_SCAN_MONTHS {
        let local = target_day(month).and_time(at.as_naive());
        if let Some(candidate) = resolve_local(tz, local) {
            if candidate > after {
                return Some(candidate);
            }
        }
        month = month.next();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::types::{Interval, IntervalUnit};
    use chrono::{Duration, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn times(list: &[&str]) -> BTreeSet<TimeOfDay> {
        list.iter().map(|t| t.parse().unwrap()).collect()
    }

    fn next(def: &ScheduleDefinition, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        compute_next(def, after, &Utc).unwrap()
    }

    #[test]
    fn interval_is_pure_addition() {
        let after = Utc.with_ymd_and_hms(2024, 5, 17, 13, 7, 42).unwrap();
        for (unit, amount, expected) in [
            (IntervalUnit::Minutes, 15, Duration::minutes(15)),
            (IntervalUnit::Hours, 6, Duration::hours(6)),
            (IntervalUnit::Days, 2, Duration::days(2)),
        ] {
            let def = ScheduleDefinition::Interval {
                interval: Interval { unit, amount },
            };
            assert_eq!(next(&def, after), Some(after + expected));
        }
    }

    #[test]
    fn daily_picks_next_slot_then_rolls_to_tomorrow() {
        let def = ScheduleDefinition::Daily {
            times: times(&["17:00", "08:00"]),
        };
        // before T1
        assert_eq!(next(&def, utc(2024, 5, 17, 6, 0)), Some(utc(2024, 5, 17, 8, 0)));
        // exactly T1 counts as passed
        assert_eq!(next(&def, utc(2024, 5, 17, 8, 0)), Some(utc(2024, 5, 17, 17, 0)));
        // between T1 and T2
        assert_eq!(next(&def, utc(2024, 5, 17, 12, 30)), Some(utc(2024, 5, 17, 17, 0)));
        // after T2
        assert_eq!(next(&def, utc(2024, 5, 17, 17, 0)), Some(utc(2024, 5, 18, 8, 0)));
        // across a month boundary
        assert_eq!(next(&def, utc(2024, 5, 31, 23, 0)), Some(utc(2024, 6, 1, 8, 0)));
    }

    #[test]
    fn weekly_result_is_minimal_matching_instant() {
        let weekdays = vec![Weekday::Mon, Weekday::Wed, Weekday::Fri];
        let slots = times(&["09:00", "14:30"]);
        let def = ScheduleDefinition::Weekly {
            weekdays: weekdays.clone(),
            times: slots.clone(),
        };

        let start = utc(2024, 5, 15, 0, 0); // Wednesday
        for step in 0..40 {
            let after = start + Duration::minutes(step * 197);
            let got = next(&def, after).unwrap();
            assert!(got > after);
            assert!(weekdays.contains(&got.weekday()));
            assert!(slots.iter().any(|t| t.as_naive() == got.time()));

            // brute force: nothing qualifying strictly between `after` and `got`
            let mut probe = after + Duration::minutes(1);
            while probe < got {
                let qualifies = probe > after
                    && weekdays.contains(&probe.weekday())
                    && slots.iter().any(|t| t.as_naive() == probe.time());
                assert!(!qualifies, "{probe} qualifies before {got} (after {after})");
                probe += Duration::minutes(1);
            }
        }
    }

    #[test]
    fn weekly_wraps_to_next_week() {
        let def = ScheduleDefinition::Weekly {
            weekdays: vec![Weekday::Tue],
            times: times(&["08:00"]),
        };
        // Tuesday 2024-05-14 after the slot -> following Tuesday
        assert_eq!(next(&def, utc(2024, 5, 14, 9, 0)), Some(utc(2024, 5, 21, 8, 0)));
        // Tuesday before the slot -> same day
        assert_eq!(next(&def, utc(2024, 5, 14, 7, 59)), Some(utc(2024, 5, 14, 8, 0)));
    }

    #[test]
    fn monthly_last_day_handles_leap_years() {
        let def = ScheduleDefinition::MonthlyDay {
            day_of_month: DayOfMonth::Last,
            at: "08:00".parse().unwrap(),
        };
        assert_eq!(next(&def, utc(2024, 2, 10, 12, 0)), Some(utc(2024, 2, 29, 8, 0)));
        assert_eq!(next(&def, utc(2023, 2, 10, 12, 0)), Some(utc(2023, 2, 28, 8, 0)));
        // past this month's slot -> next month's last day
        assert_eq!(next(&def, utc(2024, 2, 29, 9, 0)), Some(utc(2024, 3, 31, 8, 0)));
    }

    #[test]
    fn monthly_day_clamps_short_months() {
        let def = ScheduleDefinition::MonthlyDay {
            day_of_month: DayOfMonth::Day(31),
            at: "09:00".parse().unwrap(),
        };
        assert_eq!(next(&def, utc(2023, 1, 31, 10, 0)), Some(utc(2023, 2, 28, 9, 0)));
        assert_eq!(next(&def, utc(2023, 4, 2, 0, 0)), Some(utc(2023, 4, 30, 9, 0)));

        let fifteenth = ScheduleDefinition::MonthlyDay {
            day_of_month: DayOfMonth::Day(15),
            at: "09:00".parse().unwrap(),
        };
        assert_eq!(next(&fifteenth, utc(2023, 12, 15, 9, 0)), Some(utc(2024, 1, 15, 9, 0)));
    }

    #[test]
    fn first_working_day_skips_weekend_start() {
        let def = ScheduleDefinition::MonthlyPattern {
            pattern: MonthlyPattern::FirstWorkingDay,
            at: "08:00".parse().unwrap(),
        };
        // June 2024 starts on a Saturday
        assert_eq!(next(&def, utc(2024, 5, 31, 12, 0)), Some(utc(2024, 6, 3, 8, 0)));
        // already past June's first working day -> July 1 (a Monday)
        assert_eq!(next(&def, utc(2024, 6, 3, 8, 0)), Some(utc(2024, 7, 1, 8, 0)));
    }

    #[test]
    fn other_monthly_patterns() {
        let at: TimeOfDay = "18:00".parse().unwrap();
        let last_working = ScheduleDefinition::MonthlyPattern {
            pattern: MonthlyPattern::LastWorkingDay,
            at,
        };
        // August 2024 ends on a Saturday
        assert_eq!(next(&last_working, utc(2024, 8, 1, 0, 0)), Some(utc(2024, 8, 30, 18, 0)));

        let first_day = ScheduleDefinition::MonthlyPattern {
            pattern: MonthlyPattern::FirstDay,
            at,
        };
        assert_eq!(next(&first_day, utc(2024, 12, 1, 18, 0)), Some(utc(2025, 1, 1, 18, 0)));

        let last_day = ScheduleDefinition::MonthlyPattern {
            pattern: MonthlyPattern::LastDay,
            at,
        };
        assert_eq!(next(&last_day, utc(2024, 4, 3, 0, 0)), Some(utc(2024, 4, 30, 18, 0)));
    }

    #[test]
    fn one_time_fires_once() {
        let at = utc(2024, 7, 1, 9, 0);
        let def = ScheduleDefinition::OneTime { at_datetime: at };
        assert_eq!(next(&def, utc(2024, 6, 30, 0, 0)), Some(at));
        assert_eq!(next(&def, at), None);
        assert_eq!(next(&def, at + Duration::days(3)), None);
    }

    #[test]
    fn evaluates_wall_clock_in_schedule_timezone() {
        let tz: Tz = "Europe/Amsterdam".parse().unwrap();
        let def = ScheduleDefinition::Daily {
            times: times(&["08:00"]),
        };
        // winter: UTC+1
        assert_eq!(
            compute_next(&def, utc(2024, 1, 10, 0, 0), &tz).unwrap(),
            Some(utc(2024, 1, 10, 7, 0))
        );
        // summer: UTC+2
        assert_eq!(
            compute_next(&def, utc(2024, 7, 10, 0, 0), &tz).unwrap(),
            Some(utc(2024, 7, 10, 6, 0))
        );
        // 23:30Z on Jan 10 is already Jan 11 in Amsterdam
        assert_eq!(
            compute_next(&def, utc(2024, 1, 10, 23, 30), &tz).unwrap(),
            Some(utc(2024, 1, 11, 7, 0))
        );
    }

    #[test]
    fn skipped_local_time_moves_to_next_valid_slot() {
        // America/New_York jumps from 02:00 to 03:00 on 2024-03-10.
        let tz: Tz = "America/New_York".parse().unwrap();
        let only_skipped = ScheduleDefinition::Daily {
            times: times(&["02:30"]),
        };
        // Saturday noon EST -> Sunday 02:30 does not exist -> Monday 02:30 EDT
        assert_eq!(
            compute_next(&only_skipped, utc(2024, 3, 9, 17, 0), &tz).unwrap(),
            Some(utc(2024, 3, 11, 6, 30))
        );

        let with_later_slot = ScheduleDefinition::Daily {
            times: times(&["02:30", "09:00"]),
        };
        assert_eq!(
            compute_next(&with_later_slot, utc(2024, 3, 9, 17, 0), &tz).unwrap(),
            Some(utc(2024, 3, 10, 13, 0))
        );
    }

    #[test]
    fn weekly_slot_in_gap_moves_to_following_week() {
        // Sunday 2024-03-10 02:30 does not exist in New York.
        let tz: Tz = "America/New_York".parse().unwrap();
        let def = ScheduleDefinition::Weekly {
            weekdays: vec![Weekday::Sun],
            times: times(&["02:30"]),
        };
        let following = Some(utc(2024, 3, 17, 6, 30)); // 02:30 EDT

        // Sunday 2024-03-03 03:00 EST, past that day's slot
        assert_eq!(compute_next(&def, utc(2024, 3, 3, 8, 0), &tz).unwrap(), following);
        // Saturday 2024-03-09 12:00 EST, the day before the transition
        assert_eq!(compute_next(&def, utc(2024, 3, 9, 17, 0), &tz).unwrap(), following);
    }

    #[test]
    fn monthly_day_in_gap_moves_to_next_month() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let def = ScheduleDefinition::MonthlyDay {
            day_of_month: DayOfMonth::Day(10),
            at: "02:30".parse().unwrap(),
        };
        // past February's slot; March 10 02:30 is skipped -> April 10 02:30 EDT
        assert_eq!(
            compute_next(&def, utc(2024, 2, 10, 12, 0), &tz).unwrap(),
            Some(utc(2024, 4, 10, 6, 30))
        );
    }

    #[test]
    fn monthly_pattern_in_gap_moves_to_next_month() {
        // London skips 01:00-02:00 on Sunday 2024-03-31, the last day of March.
        let tz: Tz = "Europe/London".parse().unwrap();
        let def = ScheduleDefinition::MonthlyPattern {
            pattern: MonthlyPattern::LastDay,
            at: "01:30".parse().unwrap(),
        };
        // past February's slot -> March 31 01:30 skipped -> April 30 01:30 BST
        assert_eq!(
            compute_next(&def, utc(2024, 2, 29, 12, 0), &tz).unwrap(),
            Some(utc(2024, 4, 30, 0, 30))
        );
    }

    #[test]
    fn repeated_local_time_fires_once() {
        // 01:30 happens twice in New York on 2024-11-03.
        let tz: Tz = "America/New_York".parse().unwrap();
        let def = ScheduleDefinition::Daily {
            times: times(&["01:30"]),
        };
        let first = compute_next(&def, utc(2024, 11, 2, 16, 0), &tz).unwrap().unwrap();
        assert_eq!(first, utc(2024, 11, 3, 5, 30)); // 01:30 EDT
        let second = compute_next(&def, first, &tz).unwrap().unwrap();
        assert_eq!(second, utc(2024, 11, 4, 6, 30)); // 01:30 EST next day
    }

    #[test]
    fn preview_chains_occurrences() {
        let def = ScheduleDefinition::Daily {
            times: times(&["08:00"]),
        };
        let runs = next_occurrences(&def, utc(2024, 5, 17, 9, 0), &Utc, 3).unwrap();
        assert_eq!(
            runs,
            vec![utc(2024, 5, 18, 8, 0), utc(2024, 5, 19, 8, 0), utc(2024, 5, 20, 8, 0)]
        );

        let once = ScheduleDefinition::OneTime {
            at_datetime: utc(2024, 6, 1, 0, 0),
        };
        assert_eq!(next_occurrences(&once, utc(2024, 5, 17, 9, 0), &Utc, 5).unwrap().len(), 1);
    }

    #[test]
    fn malformed_definition_is_rejected() {
        let def = ScheduleDefinition::Daily {
            times: BTreeSet::new(),
        };
        assert!(matches!(
            compute_next(&def, utc(2024, 5, 17, 9, 0), &Utc),
            Err(SchedulerError::MalformedDefinition(_))
        ));
    }

    #[test]
    fn configured_timezone_wins() {
        assert_eq!(default_timezone(Some("Asia/Tokyo")).unwrap().name(), "Asia/Tokyo");
        assert!(default_timezone(Some("Nowhere/Special")).is_err());
    }
}
