//! `strata-scheduler`: recurring report schedules with SQLite persistence.
//!
//! # Overview
//!
//! Reports and their schedules live in SQLite (see [`db`]). The
//! [`engine::ScheduleWorker`] polls for schedules whose `next_run_at` has
//! arrived, claims each one, runs its report through a [`ReportExecutor`],
//! caches the result, advances the schedule and emails the recipients.
//!
//! # Schedule kinds
//!
//! | Kind              | Fires                                                   |
//! |-------------------|---------------------------------------------------------|
//! | `interval`        | Every N minutes / hours / days after the reference time |
//! | `daily`           | At each listed local time, every day                    |
//! | `weekly`          | At each listed local time on the listed weekdays        |
//! | `monthly_day`     | On a day of the month (clamped, or `last`)              |
//! | `monthly_pattern` | First/last (working) day of each month                  |
//! | `one_time`        | Once, at an absolute instant                            |
//!
//! Occurrences are evaluated in the schedule's IANA timezone; see
//! [`schedule::compute_next`] for the daylight-saving rules.

pub mod calendar;
pub mod collaborators;
pub mod db;
pub mod email;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod store;
pub mod types;

pub use collaborators::{Attachment, Mailer, OutboundEmail, ReportExecutor, ResultExporter, TabularResult};
pub use engine::{Clock, ScheduleWorker, ServeOutcome, SystemClock, WorkerOptions};
pub use error::{DeliveryError, ExecutionError, ExportError, Result, SchedulerError};
pub use schedule::{compute_next, next_occurrences};
pub use store::ScheduleStore;
pub use types::{
    DayOfMonth, Interval, IntervalUnit, MonthlyPattern, NewSchedule, Report, ReportRun, RunStatus,
    Schedule, ScheduleDefinition, TimeOfDay,
};
