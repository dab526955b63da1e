use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SchedulerError};

/// A wall-clock time of day at minute precision, written `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    /// `None` when `hour` or `minute` is out of range.
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(TimeOfDay)
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl std::str::FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(TimeOfDay)
            .map_err(|_| format!("invalid time of day (expected HH:MM): {s}"))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Target day for `monthly_day` schedules: a fixed day number or the last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOfMonth {
    /// 1-31. Months shorter than the day clamp to their last day.
    Day(u8),
    Last,
}

impl Serialize for DayOfMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DayOfMonth::Day(d) => serializer.serialize_u8(*d),
            DayOfMonth::Last => serializer.serialize_str("last"),
        }
    }
}

impl<'de> Deserialize<'de> for DayOfMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Word(String),
        }

        match Raw::deserialize(deserializer)? {
            // -1 is the legacy sentinel for "last day"
            Raw::Number(-1) => Ok(DayOfMonth::Last),
            Raw::Number(n) => u8::try_from(n)
                .map(DayOfMonth::Day)
                .map_err(|_| serde::de::Error::custom(format!("day_of_month out of range: {n}"))),
            Raw::Word(w) if w.eq_ignore_ascii_case("last") => Ok(DayOfMonth::Last),
            Raw::Word(w) => Err(serde::de::Error::custom(format!(
                "day_of_month must be 1-31 or \"last\", got {w:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub unit: IntervalUnit,
    pub amount: u32,
}

impl Interval {
    pub fn duration(&self) -> Duration {
        let amount = i64::from(self.amount);
        match self.unit {
            IntervalUnit::Minutes => Duration::minutes(amount),
            IntervalUnit::Hours => Duration::hours(amount),
            IntervalUnit::Days => Duration::days(amount),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthlyPattern {
    FirstWorkingDay,
    LastWorkingDay,
    FirstDay,
    LastDay,
}

/// When a schedule fires. Replaced wholesale on edit.
///
/// Stored as JSON with a `kind` discriminant, e.g.
/// `{"kind":"weekly","weekdays":["mon","thu"],"times":["08:00"]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ScheduleDefinition {
    /// Fixed distance from the reference instant, aligned to no epoch.
    Interval { interval: Interval },

    /// Every day at each of `times`.
    Daily { times: BTreeSet<TimeOfDay> },

    /// On each of `weekdays` at each of `times`.
    Weekly {
        weekdays: Vec<Weekday>,
        times: BTreeSet<TimeOfDay>,
    },

    MonthlyDay {
        day_of_month: DayOfMonth,
        at: TimeOfDay,
    },

    MonthlyPattern {
        pattern: MonthlyPattern,
        at: TimeOfDay,
    },

    /// A single absolute instant.
    OneTime { at_datetime: DateTime<Utc> },
}

impl ScheduleDefinition {
    /// Decode and validate a JSON definition.
    pub fn parse(json: &str) -> Result<Self> {
        let definition: ScheduleDefinition = serde_json::from_str(json)
            .map_err(|e| SchedulerError::MalformedDefinition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Reject definitions that lack what their kind needs.
    pub fn validate(&self) -> Result<()> {
        let malformed = |msg: &str| Err(SchedulerError::MalformedDefinition(msg.to_string()));
        match self {
            ScheduleDefinition::Interval { interval } if interval.amount == 0 => {
                malformed("interval amount must be positive")
            }
            ScheduleDefinition::Daily { times } if times.is_empty() => {
                malformed("daily schedule needs at least one time")
            }
            ScheduleDefinition::Weekly { weekdays, .. } if weekdays.is_empty() => {
                malformed("weekly schedule needs at least one weekday")
            }
            ScheduleDefinition::Weekly { times, .. } if times.is_empty() => {
                malformed("weekly schedule needs at least one time")
            }
            ScheduleDefinition::MonthlyDay {
                day_of_month: DayOfMonth::Day(d),
                ..
            } if !(1..=31).contains(d) => malformed("day_of_month must be between 1 and 31"),
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleDefinition::Interval { .. } => "interval",
            ScheduleDefinition::Daily { .. } => "daily",
            ScheduleDefinition::Weekly { .. } => "weekly",
            ScheduleDefinition::MonthlyDay { .. } => "monthly_day",
            ScheduleDefinition::MonthlyPattern { .. } => "monthly_pattern",
            ScheduleDefinition::OneTime { .. } => "one_time",
        }
    }
}

/// Parse an IANA zone name such as `"Europe/Amsterdam"`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

mod tz_name {
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tz: &Option<Tz>, serializer: S) -> Result<S::Ok, S::Error> {
        match tz {
            Some(tz) => serializer.serialize_some(tz.name()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Tz>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|name| name.parse::<Tz>().map_err(|_| serde::de::Error::custom(format!("unknown timezone: {name}"))))
            .transpose()
    }
}

/// A report definition: the SQL a schedule executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub name: String,
    pub sql: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted schedule. Owned by exactly one report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// UUID v4 string, primary key.
    pub id: String,
    pub report_id: String,
    /// Human-readable label, used in `run_by` and logs.
    pub name: String,
    pub enabled: bool,
    pub definition: ScheduleDefinition,
    /// Values bound to the report's parameters at execution time.
    pub parameters: BTreeMap<String, String>,
    pub recipients: Vec<String>,
    /// Results with at most this many rows are rendered inline in the email.
    pub max_inline_rows: u32,
    /// Zone the definition is evaluated in. `None` uses the worker default.
    #[serde(with = "tz_name")]
    pub timezone: Option<Tz>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// `None` means no future occurrence exists.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Enabled and `next_run_at <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Input for [`crate::store::ScheduleStore::create_schedule`].
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub report_id: String,
    pub name: String,
    pub definition: ScheduleDefinition,
    pub parameters: BTreeMap<String, String>,
    pub recipients: Vec<String>,
    pub max_inline_rows: u32,
    pub timezone: Option<Tz>,
}

pub const DEFAULT_MAX_INLINE_ROWS: u32 = 100;

/// Outcome of one report execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One row of run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRun {
    pub id: String,
    pub report_id: String,
    pub schedule_id: Option<String>,
    pub status: RunStatus,
    /// `schedule:<name>` for worker-initiated runs.
    pub run_by: String,
    pub row_count: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub cache_handle: Option<String>,
    /// Set when the run succeeded but the email hand-off did not.
    pub delivery_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_of_day_parses_and_orders() {
        let a: TimeOfDay = "08:00".parse().unwrap();
        let b: TimeOfDay = "17:30".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "17:30");
        assert!("25:00".parse::<TimeOfDay>().is_err());
        assert!("8am".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn weekly_definition_from_json() {
        let def = ScheduleDefinition::parse(
            r#"{"kind":"weekly","weekdays":["mon","Thursday"],"times":["17:00","08:30"]}"#,
        )
        .unwrap();
        match def {
            ScheduleDefinition::Weekly { weekdays, times } => {
                assert_eq!(weekdays, vec![Weekday::Mon, Weekday::Thu]);
                let times: Vec<String> = times.iter().map(|t| t.to_string()).collect();
                assert_eq!(times, vec!["08:30", "17:00"]);
            }
            other => panic!("expected weekly, got {other:?}"),
        }
    }

    #[test]
    fn interval_definition_from_json() {
        let def = ScheduleDefinition::parse(
            r#"{"kind":"interval","interval":{"unit":"minutes","amount":15}}"#,
        )
        .unwrap();
        assert_eq!(def.kind(), "interval");
        match def {
            ScheduleDefinition::Interval { interval } => {
                assert_eq!(interval.duration(), Duration::minutes(15))
            }
            other => panic!("expected interval, got {other:?}"),
        }
    }

    #[test]
    fn day_of_month_accepts_last_and_legacy_sentinel() {
        let a = ScheduleDefinition::parse(r#"{"kind":"monthly_day","day_of_month":"last","at":"06:00"}"#).unwrap();
        let b = ScheduleDefinition::parse(r#"{"kind":"monthly_day","day_of_month":-1,"at":"06:00"}"#).unwrap();
        assert_eq!(a, b);
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains(r#""day_of_month":"last""#));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let cases = [
            r#"{"kind":"daily"}"#,
            r#"{"kind":"weekly","times":["08:00"]}"#,
            r#"{"kind":"monthly_pattern","at":"08:00"}"#,
            r#"{"kind":"one_time"}"#,
            r#"{"kind":"interval"}"#,
            r#"{"kind":"fortnightly","times":["08:00"]}"#,
        ];
        for json in cases {
            let err = ScheduleDefinition::parse(json).unwrap_err();
            assert!(
                matches!(err, SchedulerError::MalformedDefinition(_)),
                "{json} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn empty_or_out_of_range_values_are_malformed() {
        let cases = [
            r#"{"kind":"interval","interval":{"unit":"hours","amount":0}}"#,
            r#"{"kind":"daily","times":[]}"#,
            r#"{"kind":"weekly","weekdays":[],"times":["08:00"]}"#,
            r#"{"kind":"weekly","weekdays":["mon"],"times":[]}"#,
            r#"{"kind":"monthly_day","day_of_month":0,"at":"08:00"}"#,
            r#"{"kind":"monthly_day","day_of_month":32,"at":"08:00"}"#,
        ];
        for json in cases {
            assert!(ScheduleDefinition::parse(json).is_err(), "{json} should be rejected");
        }
    }

    #[test]
    fn run_status_round_trips_through_strings() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("queued".parse::<RunStatus>().is_err());
    }

    #[test]
    fn timezone_names_are_validated() {
        assert_eq!(parse_timezone("Europe/Amsterdam").unwrap().name(), "Europe/Amsterdam");
        assert!(matches!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }
}
