use thiserror::Error;

use gigroom_shared::protocol::ErrorCode;
use gigroom_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Token cannot be sent as a header value")]
    InvalidToken,

    #[error("Channel is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server rejected request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Timed out waiting for the server")]
    Timeout,
}
