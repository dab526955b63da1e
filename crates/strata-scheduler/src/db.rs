use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `reports`, `schedules` and `report_runs` tables (idempotent)
/// and an index on `next_run_at` so the due query stays cheap with thousands
/// of schedules. Timestamps are RFC 3339 UTC strings with a fixed width, so
/// string comparison orders them correctly.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS reports (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            sql_text    TEXT    NOT NULL,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules (
            id              TEXT    NOT NULL PRIMARY KEY,
            report_id       TEXT    NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
            name            TEXT    NOT NULL,
            enabled         INTEGER NOT NULL DEFAULT 1,
            definition      TEXT    NOT NULL,   -- JSON-encoded ScheduleDefinition
            parameters      TEXT    NOT NULL,   -- JSON object of bound values
            recipients      TEXT    NOT NULL,   -- JSON array of addresses
            max_inline_rows INTEGER NOT NULL,
            timezone        TEXT,               -- IANA name or NULL for the worker default
            last_run_at     TEXT,
            next_run_at     TEXT,               -- NULL: no future occurrence
            claimed_by      TEXT,               -- worker currently serving this schedule
            claimed_at      TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Due query: WHERE enabled = 1 AND next_run_at <= ? ORDER BY next_run_at
        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (enabled, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_schedules_report ON schedules (report_id);

        CREATE TABLE IF NOT EXISTS report_runs (
            id              TEXT    NOT NULL PRIMARY KEY,
            report_id       TEXT    NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
            schedule_id     TEXT    REFERENCES schedules(id) ON DELETE SET NULL,
            status          TEXT    NOT NULL,
            run_by          TEXT    NOT NULL,
            row_count       INTEGER,
            duration_ms     INTEGER,
            error           TEXT,
            cache_handle    TEXT,
            delivery_error  TEXT,
            started_at      TEXT    NOT NULL,
            completed_at    TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_runs_schedule ON report_runs (schedule_id, started_at DESC);
        ",
    )?;
    Ok(())
}
