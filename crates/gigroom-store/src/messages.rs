use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use rusqlite::params;
use uuid::Uuid;

use gigroom_shared::constants::MAX_BODY_CHARS;
use gigroom_shared::{JobId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, ReadReceipt};

const MESSAGE_COLUMNS: &str = "id, job_id, sender, receiver, body, read, created_at";

impl Database {
    /// Validate and persist a new unread message.
    ///
    /// The insert runs in one transaction together with the lookup that keeps
    /// timestamps monotonic per job, so a message is either stored whole or
    /// not at all.
    pub fn append_message(
        &mut self,
        job_id: &str,
        sender: &str,
        receiver: &str,
        body: &str,
    ) -> Result<Message> {
        let job_id = JobId::parse(job_id)?;
        let sender = UserId::parse(sender)?;
        let receiver = UserId::parse(receiver)?;
        validate_body(body)?;

        let tx = self.conn_mut().transaction()?;

        let latest: Option<String> = tx.query_row(
            "SELECT MAX(created_at) FROM messages WHERE job_id = ?1",
            params![job_id.as_str()],
            |row| row.get(0),
        )?;

        let mut created_at = truncate_to_micros(Utc::now());
        if let Some(latest) = latest {
            let latest = parse_timestamp(&latest)?;
            if latest > created_at {
                created_at = latest;
            }
        }

        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO messages (id, job_id, sender, receiver, body, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                id.to_string(),
                job_id.as_str(),
                sender.as_str(),
                receiver.as_str(),
                body,
                format_timestamp(&created_at),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(message = %id, job = %job_id, "message stored");

        Ok(Message {
            id,
            job_id,
            sender,
            receiver,
            body: body.to_string(),
            read: false,
            created_at,
        })
    }

    /// Full history of a job, oldest first. Unknown jobs yield an empty list.
    pub fn list_messages_for_job(&self, job_id: &JobId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE job_id = ?1
             ORDER BY created_at ASC, seq ASC"
        ))?;

        let rows = stmt.query_map(params![job_id.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Unread messages of a job addressed to `receiver`, oldest first.
    pub fn unread_for_receiver(&self, job_id: &JobId, receiver: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE job_id = ?1 AND receiver = ?2 AND read = 0
             ORDER BY created_at ASC, seq ASC"
        ))?;

        let rows = stmt.query_map(
            params![job_id.as_str(), receiver.as_str()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Set the read flag. Marking an already-read message changes nothing
    /// and is not an error.
    pub fn mark_message_read(&self, id: Uuid) -> Result<ReadReceipt> {
        let affected = self.conn().execute(
            "UPDATE messages SET read = 1 WHERE id = ?1 AND read = 0",
            params![id.to_string()],
        )?;

        let message = self.get_message(id)?;
        Ok(ReadReceipt {
            message,
            changed: affected > 0,
        })
    }
}

/// A body must have visible content and fit in [`MAX_BODY_CHARS`].
pub fn validate_body(body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(StoreError::Validation("message body is empty".into()));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(StoreError::Validation(format!(
            "message body is longer than {MAX_BODY_CHARS} characters"
        )));
    }
    Ok(())
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond() / 1_000 * 1_000;
    ts.with_nanosecond(nanos).unwrap_or(ts)
}

/// Fixed-width RFC 3339 so that text order in SQLite equals time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let receiver_str: String = row.get(3)?;
    let body: String = row.get(4)?;
    let read: bool = row.get(5)?;
    let ts_str: String = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let job_id = JobId::parse(&job_str).map_err(|e| conversion_error(1, e))?;
    let sender = UserId::parse(&sender_str).map_err(|e| conversion_error(2, e))?;
    let receiver = UserId::parse(&receiver_str).map_err(|e| conversion_error(3, e))?;
    let created_at = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(6, e))?;

    Ok(Message {
        id,
        job_id,
        sender,
        receiver,
        body,
        read,
        created_at,
    })
}
