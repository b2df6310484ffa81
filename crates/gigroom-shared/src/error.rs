use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} id is empty")]
    Empty { kind: &'static str },

    #[error("{kind} id is longer than {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} id contains invalid character {found:?}")]
    InvalidChar { kind: &'static str, found: char },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Malformed {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
