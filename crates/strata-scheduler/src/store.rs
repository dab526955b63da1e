use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use chrono_tz::Tz;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::compute_next,
    types::{
        parse_timezone, NewSchedule, Report, ReportRun, RunStatus, Schedule, ScheduleDefinition,
    },
};

const SCHEDULE_COLUMNS: &str = "id, report_id, name, enabled, definition, parameters, recipients,
     max_inline_rows, timezone, last_run_at, next_run_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, report_id, schedule_id, status, run_by, row_count, duration_ms,
     error, cache_handle, delivery_error, started_at, completed_at";

/// Persisted schedule state, reports and run history.
///
/// Cloning is cheap and shares the connection. Every transition the worker
/// relies on (claim, advance) is a single conditional UPDATE, so several
/// worker processes may share one database file.
#[derive(Clone)]
pub struct ScheduleStore {
    conn: Arc<Mutex<Connection>>,
    default_tz: Tz,
    claim_ttl: Duration,
}

impl ScheduleStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            default_tz: Tz::UTC,
            claim_ttl: Duration::minutes(15),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Zone used for schedules that carry no timezone of their own.
    pub fn with_default_timezone(mut self, tz: Tz) -> Self {
        self.default_tz = tz;
        self
    }

    /// Claims older than `ttl` are treated as abandoned.
    pub fn with_claim_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.claim_ttl = Duration::from_std(ttl).unwrap_or(self.claim_ttl);
        self
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_tz
    }

    /// The zone `schedule` is evaluated in.
    pub fn timezone_for(&self, schedule: &Schedule) -> Tz {
        schedule.timezone.unwrap_or(self.default_tz)
    }

    // --- reports -------------------------------------------------------------

    pub fn create_report(&self, name: &str, sql: &str) -> Result<Report> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO reports (id, name, sql_text, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name.trim(), sql, ts(now)],
        )?;
        info!(report_id = %id, name = %name.trim(), "report created");
        Ok(Report {
            id,
            name: name.trim().to_string(),
            sql: sql.to_string(),
            created_at: now,
        })
    }

    pub fn get_report(&self, id: &str) -> Result<Report> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, sql_text, created_at FROM reports WHERE id = ?1",
            [id],
            |row| {
                Ok(Report {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sql: row.get(2)?,
                    created_at: parse_ts(row, 3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| SchedulerError::ReportNotFound { id: id.to_string() })
    }

    /// Delete a report. Its schedules and run history go with it.
    pub fn delete_report(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM reports WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::ReportNotFound { id: id.to_string() });
        }
        info!(report_id = %id, "report deleted");
        Ok(())
    }

    // --- schedules -----------------------------------------------------------

    pub fn create_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        self.create_schedule_at(new, Utc::now())
    }

    /// Create a schedule whose first occurrence is computed from `now`.
    pub fn create_schedule_at(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule> {
        let tz = new.timezone.unwrap_or(self.default_tz);
        let next_run_at = compute_next(&new.definition, now, &tz)?;
        let id = Uuid::new_v4().to_string();
        let definition_json = serde_json::to_string(&new.definition)?;
        let parameters_json = serde_json::to_string(&new.parameters)?;
        let recipients_json = serde_json::to_string(&new.recipients)?;

        let conn = self.conn.lock().unwrap();
        let report_exists = conn
            .query_row("SELECT 1 FROM reports WHERE id = ?1", [&new.report_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !report_exists {
            return Err(SchedulerError::ReportNotFound { id: new.report_id });
        }

        conn.execute(
            "INSERT INTO schedules
             (id, report_id, name, enabled, definition, parameters, recipients,
              max_inline_rows, timezone, last_run_at, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?11, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10, ?10)",
            params![
                id,
                new.report_id,
                new.name.trim(),
                definition_json,
                parameters_json,
                recipients_json,
                new.max_inline_rows,
                new.timezone.map(|tz| tz.name()),
                next_run_at.map(ts),
                ts(now),
                next_run_at.is_some(),
            ],
        )?;

        info!(
            schedule_id = %id,
            name = %new.name.trim(),
            kind = new.definition.kind(),
            next_run_at = ?next_run_at,
            "schedule created"
        );

        Ok(Schedule {
            id,
            report_id: new.report_id,
            name: new.name.trim().to_string(),
            enabled: next_run_at.is_some(),
            definition: new.definition,
            parameters: new.parameters,
            recipients: new.recipients,
            max_inline_rows: new.max_inline_rows,
            timezone: new.timezone,
            last_run_at: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_schedule(&self, id: &str) -> Result<Schedule> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                [id],
                RawSchedule::from_row,
            )
            .optional()?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?;
        raw.into_schedule()
    }

    /// All schedules ordered by name. Rows that fail to decode are skipped.
    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name, created_at"
        ))?;
        let raws = stmt
            .query_map([], RawSchedule::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(raws))
    }

    /// Replace the definition wholesale and recompute `next_run_at` from now.
    pub fn update_definition(&self, id: &str, definition: ScheduleDefinition) -> Result<Schedule> {
        let schedule = self.get_schedule(id)?;
        let now = Utc::now();
        let next_run_at = compute_next(&definition, now, &self.timezone_for(&schedule))?;
        let definition_json = serde_json::to_string(&definition)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE schedules
                 SET definition = ?1, next_run_at = ?2, updated_at = ?3,
                     enabled = CASE WHEN ?2 IS NULL THEN 0 ELSE enabled END
                 WHERE id = ?4",
                params![definition_json, next_run_at.map(ts), ts(now), id],
            )?;
        }
        info!(schedule_id = %id, kind = definition.kind(), next_run_at = ?next_run_at, "schedule definition replaced");
        self.get_schedule(id)
    }

    /// Soft-disable or re-enable a schedule.
    ///
    /// Re-enabling recomputes `next_run_at` from now so occurrences missed
    /// while disabled never fire.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Schedule> {
        let schedule = self.get_schedule(id)?;
        let now = Utc::now();
        {
            let conn = self.conn.lock().unwrap();
            if enabled {
                let next_run_at =
                    compute_next(&schedule.definition, now, &self.timezone_for(&schedule))?;
                // nothing left to fire: stays disabled
                conn.execute(
                    "UPDATE schedules SET enabled = ?1, next_run_at = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![next_run_at.is_some(), next_run_at.map(ts), ts(now), id],
                )?;
            } else {
                conn.execute(
                    "UPDATE schedules SET enabled = 0, updated_at = ?1 WHERE id = ?2",
                    params![ts(now), id],
                )?;
            }
        }
        info!(schedule_id = %id, enabled, "schedule toggled");
        self.get_schedule(id)
    }

    // --- worker transitions --------------------------------------------------

    /// Enabled schedules with `next_run_at <= now` and no live claim, oldest
    /// occurrence first.
    #[instrument(skip(self))]
    pub fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
               AND (claimed_by IS NULL OR claimed_at < ?2)
             ORDER BY next_run_at"
        ))?;
        let raws = stmt
            .query_map(params![ts(now), ts(now - self.claim_ttl)], RawSchedule::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(raws))
    }

    /// Mark the occurrence `observed_next_run_at` of `schedule_id` as being
    /// served by `worker_id`.
    ///
    /// Fails with `ConcurrentModification` when the schedule was disabled,
    /// advanced, or claimed by someone else since it was read.
    #[instrument(skip(self))]
    pub fn claim(
        &self,
        schedule_id: &str,
        observed_next_run_at: DateTime<Utc>,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules SET claimed_by = ?1, claimed_at = ?2
             WHERE id = ?3 AND enabled = 1 AND next_run_at = ?4
               AND (claimed_by IS NULL OR claimed_at < ?5)",
            params![
                worker_id,
                ts(now),
                schedule_id,
                ts(observed_next_run_at),
                ts(now - self.claim_ttl)
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::ConcurrentModification {
                schedule_id: schedule_id.to_string(),
            });
        }
        debug!("schedule claimed");
        Ok(())
    }

    /// Commit a served occurrence: store the next occurrence, stamp
    /// `last_run_at` when given, disable the schedule when nothing follows,
    /// and release the claim. Only the claim holder may do this.
    #[instrument(skip(self))]
    pub fn claim_and_advance(
        &self,
        schedule_id: &str,
        worker_id: &str,
        new_next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules
             SET next_run_at = ?1,
                 last_run_at = COALESCE(?2, last_run_at),
                 enabled     = CASE WHEN ?1 IS NULL THEN 0 ELSE enabled END,
                 claimed_by  = NULL,
                 claimed_at  = NULL,
                 updated_at  = ?3
             WHERE id = ?4 AND claimed_by = ?5",
            params![
                new_next_run_at.map(ts),
                last_run_at.map(ts),
                ts(Utc::now()),
                schedule_id,
                worker_id
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::ConcurrentModification {
                schedule_id: schedule_id.to_string(),
            });
        }
        debug!("schedule advanced");
        Ok(())
    }

    /// Drop every claim held by `worker_id`, e.g. left over from a previous
    /// process with the same identity.
    pub fn release_claims(&self, worker_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules SET claimed_by = NULL, claimed_at = NULL WHERE claimed_by = ?1",
            [worker_id],
        )?;
        Ok(n)
    }

    // --- run history ---------------------------------------------------------

    /// Record a run as started and return its id.
    pub fn start_run(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO report_runs (id, report_id, schedule_id, status, run_by, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                schedule.report_id,
                schedule.id,
                RunStatus::Running.to_string(),
                format!("schedule:{}", schedule.name),
                ts(now)
            ],
        )?;
        Ok(id)
    }

    pub fn complete_run(
        &self,
        run_id: &str,
        row_count: u64,
        duration_ms: u64,
        cache_handle: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.finish_run(run_id, RunStatus::Completed, Some(row_count), duration_ms, None, cache_handle, now)
    }

    pub fn fail_run(
        &self,
        run_id: &str,
        error: &str,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.finish_run(run_id, RunStatus::Failed, None, duration_ms, Some(error), None, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        row_count: Option<u64>,
        duration_ms: u64,
        error: Option<&str>,
        cache_handle: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE report_runs
             SET status = ?1, row_count = ?2, duration_ms = ?3, error = ?4,
                 cache_handle = ?5, completed_at = ?6
             WHERE id = ?7",
            params![
                status.to_string(),
                row_count.map(|n| n as i64),
                duration_ms as i64,
                error,
                cache_handle,
                ts(now),
                run_id
            ],
        )?;
        Ok(())
    }

    /// Note a failed email hand-off on an otherwise successful run.
    pub fn record_delivery_error(&self, run_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE report_runs SET delivery_error = ?1 WHERE id = ?2",
            params![error, run_id],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<ReportRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM report_runs WHERE id = ?1"),
                [run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs of a schedule, newest first.
    pub fn list_runs(&self, schedule_id: &str, limit: usize) -> Result<Vec<ReportRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM report_runs
             WHERE schedule_id = ?1
             ORDER BY started_at DESC
             LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(params![schedule_id, limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort as strings.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => parse_ts(row, idx).map(Some),
        None => Ok(None),
    }
}

/// A schedule row before its JSON columns are decoded.
struct RawSchedule {
    id: String,
    report_id: String,
    name: String,
    enabled: bool,
    definition: String,
    parameters: String,
    recipients: String,
    max_inline_rows: u32,
    timezone: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawSchedule {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            report_id: row.get(1)?,
            name: row.get(2)?,
            enabled: row.get(3)?,
            definition: row.get(4)?,
            parameters: row.get(5)?,
            recipients: row.get(6)?,
            max_inline_rows: row.get(7)?,
            timezone: row.get(8)?,
            last_run_at: parse_opt_ts(row, 9)?,
            next_run_at: parse_opt_ts(row, 10)?,
            created_at: parse_ts(row, 11)?,
            updated_at: parse_ts(row, 12)?,
        })
    }

    fn into_schedule(self) -> Result<Schedule> {
        let definition = ScheduleDefinition::parse(&self.definition)?;
        let parameters: BTreeMap<String, String> = serde_json::from_str(&self.parameters)?;
        let recipients: Vec<String> = serde_json::from_str(&self.recipients)?;
        let timezone = self.timezone.as_deref().map(parse_timezone).transpose()?;
        Ok(Schedule {
            id: self.id,
            report_id: self.report_id,
            name: self.name,
            enabled: self.enabled,
            definition,
            parameters,
            recipients,
            max_inline_rows: self.max_inline_rows,
            timezone,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn decode_all(raws: Vec<RawSchedule>) -> Vec<Schedule> {
    raws.into_iter()
        .filter_map(|raw| {
            let id = raw.id.clone();
            match raw.into_schedule() {
                Ok(s) => Some(s),
                Err(e) => {
                    error!(schedule_id = %id, "undecodable schedule row skipped: {e}");
                    None
                }
            }
        })
        .collect()
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<ReportRun> {
    let status: String = row.get(3)?;
    let status = status.parse::<RunStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
    })?;
    Ok(ReportRun {
        id: row.get(0)?,
        report_id: row.get(1)?,
        schedule_id: row.get(2)?,
        status,
        run_by: row.get(4)?,
        row_count: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
        duration_ms: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
        error: row.get(7)?,
        cache_handle: row.get(8)?,
        delivery_error: row.get(9)?,
        started_at: parse_ts(row, 10)?,
        completed_at: parse_opt_ts(row, 11)?,
    })
}
