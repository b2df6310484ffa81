//! Async seam over the synchronous SQLite store.
//!
//! The gateway only sees [`MessageStore`]; the SQLite implementation runs
//! each call on the blocking pool so persistence never stalls the event
//! loop, and so that a spawned write finishes even if the caller that
//! started it goes away.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use gigroom_shared::{JobId, UserId};
use gigroom_store::{Database, Message, ReadReceipt};

use crate::error::ServerError;

pub type SharedDatabase = Arc<Mutex<Database>>;

/// Durable message persistence, scoped by job.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Validate and persist a new unread message.
    async fn append(
        &self,
        job_id: &str,
        sender: &str,
        receiver: &str,
        body: &str,
    ) -> Result<Message, ServerError>;

    /// Full history of a job, oldest first.
    async fn list_by_job(&self, job_id: &JobId) -> Result<Vec<Message>, ServerError>;

    async fn get(&self, id: Uuid) -> Result<Message, ServerError>;

    /// Set the read flag; `changed` tells whether it was unread before.
    async fn mark_read(&self, id: Uuid) -> Result<ReadReceipt, ServerError>;

    async fn unread_for(&self, job_id: &JobId, receiver: &UserId)
        -> Result<Vec<Message>, ServerError>;
}

/// Run `f` against the shared database on the blocking pool.
pub(crate) async fn with_database<T, F>(db: &SharedDatabase, f: F) -> Result<T, ServerError>
where
    T: Send + 'static,
    F: FnOnce(&mut Database) -> gigroom_store::Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = db
            .lock()
            .map_err(|_| ServerError::StoreUnavailable("database lock poisoned".into()))?;
        f(&mut *guard).map_err(ServerError::from)
    })
    .await
    .map_err(|e| ServerError::StoreUnavailable(format!("store task failed: {e}")))?
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    db: SharedDatabase,
}

impl SqliteMessageStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(
        &self,
        job_id: &str,
        sender: &str,
        receiver: &str,
        body: &str,
    ) -> Result<Message, ServerError> {
        let (job_id, sender, receiver, body) = (
            job_id.to_string(),
            sender.to_string(),
            receiver.to_string(),
            body.to_string(),
        );
        with_database(&self.db, move |db| {
            db.append_message(&job_id, &sender, &receiver, &body)
        })
        .await
    }

    async fn list_by_job(&self, job_id: &JobId) -> Result<Vec<Message>, ServerError> {
        let job_id = job_id.clone();
        with_database(&self.db, move |db| db.list_messages_for_job(&job_id)).await
    }

    async fn get(&self, id: Uuid) -> Result<Message, ServerError> {
        with_database(&self.db, move |db| db.get_message(id)).await
    }

    async fn mark_read(&self, id: Uuid) -> Result<ReadReceipt, ServerError> {
        with_database(&self.db, move |db| db.mark_message_read(id)).await
    }

    async fn unread_for(
        &self,
        job_id: &JobId,
        receiver: &UserId,
    ) -> Result<Vec<Message>, ServerError> {
        let (job_id, receiver) = (job_id.clone(), receiver.clone());
        with_database(&self.db, move |db| db.unread_for_receiver(&job_id, &receiver)).await
    }
}
