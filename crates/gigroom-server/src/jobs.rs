//! The Job collaborator, as seen by the chat subsystem.

use async_trait::async_trait;

use gigroom_shared::JobId;
use gigroom_store::JobParticipants;

use crate::error::ServerError;
use crate::store::{with_database, SharedDatabase};

/// Who is attached to a job. `None` means the job is unknown.
#[async_trait]
pub trait JobDirectory: Send + Sync {
    async fn participants(&self, job_id: &JobId) -> Result<Option<JobParticipants>, ServerError>;
}

/// Reads the participant records the job service pushes into our database.
#[derive(Clone)]
pub struct SqliteJobDirectory {
    db: SharedDatabase,
}

impl SqliteJobDirectory {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Replace the participant record of a job.
    pub async fn upsert(&self, participants: JobParticipants) -> Result<(), ServerError> {
        with_database(&self.db, move |db| db.upsert_job_participants(&participants)).await
    }
}

#[async_trait]
impl JobDirectory for SqliteJobDirectory {
    async fn participants(&self, job_id: &JobId) -> Result<Option<JobParticipants>, ServerError> {
        let job_id = job_id.clone();
        with_database(&self.db, move |db| db.get_job_participants(&job_id)).await
    }
}
