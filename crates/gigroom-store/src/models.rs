//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gigroom_shared::protocol::ChatMessage;
use gigroom_shared::{JobId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message exchanged in a job's room.
///
/// Everything but `read` is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier, assigned by the store.
    pub id: Uuid,
    /// The job whose room the message belongs to.
    pub job_id: JobId,
    pub sender: UserId,
    pub receiver: UserId,
    /// Non-empty message text.
    pub body: String,
    /// Set once the receiver has seen the message; never reset.
    pub read: bool,
    /// Server time at persistence. Never earlier than any previous message
    /// of the same job.
    pub created_at: DateTime<Utc>,
}

impl From<Message> for ChatMessage {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            job: m.job_id,
            sender: m.sender,
            receiver: m.receiver,
            message: m.body,
            read: m.read,
            timestamp: m.created_at,
        }
    }
}

/// Result of marking a message as read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    /// The message after the update.
    pub message: Message,
    /// `true` only when this call flipped the flag from unread to read.
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// Job participants
// ---------------------------------------------------------------------------

/// Who has standing in a job's chat room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobParticipants {
    pub job_id: JobId,
    /// The user who posted the job.
    pub client: UserId,
    /// Developers who applied, in no particular order.
    #[serde(default)]
    pub applicants: Vec<UserId>,
    /// The developer selected for the job, once hired.
    #[serde(default)]
    pub hired_developer: Option<UserId>,
}
