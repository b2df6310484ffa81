//! v001 -- Chat messages.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order, breaks timestamp ties
    id         TEXT NOT NULL UNIQUE,              -- UUID v4
    job_id     TEXT NOT NULL,
    sender     TEXT NOT NULL,
    receiver   TEXT NOT NULL,
    body       TEXT NOT NULL,
    read       INTEGER NOT NULL DEFAULT 0,        -- boolean 0/1
    created_at TEXT NOT NULL                      -- RFC-3339, fixed-width microseconds, UTC
);

CREATE INDEX IF NOT EXISTS idx_messages_job_ts
    ON messages(job_id, created_at, seq);

CREATE INDEX IF NOT EXISTS idx_messages_job_receiver
    ON messages(job_id, receiver);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
