use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `job_parameters` tables (idempotent) and an index
/// on `(status, next_execution)` so the claim query stays cheap with
/// thousands of jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            scheduling_pattern  TEXT    NOT NULL,
            job_class           TEXT    NOT NULL,
            enabled             INTEGER NOT NULL DEFAULT 1,
            status              TEXT    NOT NULL DEFAULT 'unscheduled',
            execution_attempts  INTEGER NOT NULL DEFAULT 0,
            lock_name           TEXT,               -- owning instance while executing
            last_executed       TEXT,               -- RFC 3339 UTC or NULL
            next_execution      TEXT,               -- RFC 3339 UTC or NULL
            once_off            INTEGER NOT NULL DEFAULT 0,
            created             TEXT    NOT NULL,
            updated             TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_status_next_execution
            ON jobs (status, next_execution);

        CREATE TABLE IF NOT EXISTS job_parameters (
            job_id   TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            name     TEXT NOT NULL,
            value    TEXT NOT NULL,
            created  TEXT NOT NULL,
            updated  TEXT NOT NULL,
            PRIMARY KEY (job_id, name)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp text; lexical order equals chronological order.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn timestamps_sort_chronologically_as_text() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        let c = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        assert!(fmt_ts(a) < fmt_ts(b));
        assert!(fmt_ts(b) < fmt_ts(c));
        assert_eq!(parse_ts(&fmt_ts(b)), Some(b));
    }
}
