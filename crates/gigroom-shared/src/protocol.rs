//! JSON wire protocol for the per-job realtime chat channel.
//!
//! Client → server frames carry an event name, an optional correlation id
//! and a payload object:
//!
//! ```json
//! {"event": "sendMessage", "requestId": "r-1",
//!  "data": {"jobId": "job-42", "receiver": "B", "message": "hello"}}
//! ```
//!
//! Server → client frames are adjacently tagged [`ServerEvent`]s:
//!
//! ```json
//! {"event": "receiveMessage", "data": {"id": "...", "job": "job-42", ...}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::events;
use crate::error::ProtocolError;
use crate::types::{JobId, UserId};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Raw client frame, before the payload is decoded for its event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub job_id: String,
}

/// `sender` is optional: the server takes the sender from the connection's
/// credential and only uses this field to reject mismatches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub receiver: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsRead {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// A decoded client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    SendMessage(SendMessage),
    MarkAsRead(MarkAsRead),
    Typing(Typing),
    StopTyping(Typing),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => events::JOIN_ROOM,
            ClientEvent::SendMessage(_) => events::SEND_MESSAGE,
            ClientEvent::MarkAsRead(_) => events::MARK_AS_READ,
            ClientEvent::Typing(_) => events::TYPING,
            ClientEvent::StopTyping(_) => events::STOP_TYPING,
        }
    }

    /// Decode the payload of a raw frame according to its event name.
    pub fn from_frame(frame: &InboundFrame) -> Result<Self, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(
            frame: &InboundFrame,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(frame.data.clone()).map_err(|source| {
                ProtocolError::Payload {
                    event: frame.event.clone(),
                    source,
                }
            })
        }

        match frame.event.as_str() {
            events::JOIN_ROOM => Ok(ClientEvent::JoinRoom(payload(frame)?)),
            events::SEND_MESSAGE => Ok(ClientEvent::SendMessage(payload(frame)?)),
            events::MARK_AS_READ => Ok(ClientEvent::MarkAsRead(payload(frame)?)),
            events::TYPING => Ok(ClientEvent::Typing(payload(frame)?)),
            events::STOP_TYPING => Ok(ClientEvent::StopTyping(payload(frame)?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Wrap this event into a frame ready to be sent by a client.
    pub fn into_frame(self, request_id: Option<String>) -> Result<InboundFrame, ProtocolError> {
        let event = self.name().to_string();
        let data = match self {
            ClientEvent::JoinRoom(p) => serde_json::to_value(p)?,
            ClientEvent::SendMessage(p) => serde_json::to_value(p)?,
            ClientEvent::MarkAsRead(p) => serde_json::to_value(p)?,
            ClientEvent::Typing(p) | ClientEvent::StopTyping(p) => serde_json::to_value(p)?,
        };
        Ok(InboundFrame {
            event,
            request_id,
            data,
        })
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A persisted chat message as it travels over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub job: JobId,
    pub sender: UserId,
    pub receiver: UserId,
    pub message: String,
    pub read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Machine-readable failure class carried by [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    StoreUnavailable,
    BadFrame,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Broadcast to the whole room, sender included.
    ReceiveMessage(ChatMessage),

    /// Broadcast once per false→true transition of a message's read flag.
    MessageRead { message_id: Uuid },

    UserTyping { sender: UserId },

    UserStoppedTyping { sender: UserId },

    /// Private reply to a frame that carried a `requestId`.
    Ack { request_id: String },

    /// Private reply to a frame that failed. Never broadcast.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ReceiveMessage(_) => events::RECEIVE_MESSAGE,
            ServerEvent::MessageRead { .. } => events::MESSAGE_READ,
            ServerEvent::UserTyping { .. } => events::USER_TYPING,
            ServerEvent::UserStoppedTyping { .. } => events::USER_STOPPED_TYPING,
            ServerEvent::Ack { .. } => events::ACK,
            ServerEvent::Error { .. } => events::ERROR,
        }
    }
}
