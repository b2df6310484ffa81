use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};

use gigroom_shared::{JobId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::JobParticipants;

impl Database {
    /// Replace the participant record of a job (client, applicants, hired
    /// developer) in one transaction.
    pub fn upsert_job_participants(&mut self, job: &JobParticipants) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, client, hired_developer, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 client = excluded.client,
                 hired_developer = excluded.hired_developer,
                 updated_at = excluded.updated_at",
            params![
                job.job_id.as_str(),
                job.client.as_str(),
                job.hired_developer.as_ref().map(UserId::as_str),
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;

        tx.execute(
            "DELETE FROM job_applicants WHERE job_id = ?1",
            params![job.job_id.as_str()],
        )?;
        for applicant in &job.applicants {
            tx.execute(
                "INSERT OR IGNORE INTO job_applicants (job_id, applicant) VALUES (?1, ?2)",
                params![job.job_id.as_str(), applicant.as_str()],
            )?;
        }

        tx.commit()?;

        tracing::debug!(
            job = %job.job_id,
            applicants = job.applicants.len(),
            hired = job.hired_developer.is_some(),
            "job participants updated"
        );
        Ok(())
    }

    /// Participant record of a job, or `None` if the job is unknown.
    pub fn get_job_participants(&self, job_id: &JobId) -> Result<Option<JobParticipants>> {
        let row: Option<(String, Option<String>)> = self
            .conn()
            .query_row(
                "SELECT client, hired_developer FROM jobs WHERE id = ?1",
                params![job_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((client, hired_developer)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn().prepare(
            "SELECT applicant FROM job_applicants WHERE job_id = ?1 ORDER BY applicant",
        )?;
        let rows = stmt.query_map(params![job_id.as_str()], |row| row.get::<_, String>(0))?;

        let mut applicants = Vec::new();
        for row in rows {
            applicants.push(UserId::parse(&row?)?);
        }

        Ok(Some(JobParticipants {
            job_id: job_id.clone(),
            client: UserId::parse(&client)?,
            applicants,
            hired_developer: hired_developer.as_deref().map(UserId::parse).transpose()?,
        }))
    }
}
