//! v002 -- Job participant read model.
//!
//! The job subsystem owns jobs; the chat subsystem keeps only who may talk
//! in each job's room.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY NOT NULL,
    client          TEXT NOT NULL,
    hired_developer TEXT,                     -- nullable
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_applicants (
    job_id    TEXT NOT NULL,
    applicant TEXT NOT NULL,

    PRIMARY KEY (job_id, applicant),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
