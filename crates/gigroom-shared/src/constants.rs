/// Longest accepted job or user identifier.
pub const MAX_ID_LEN: usize = 64;

/// Longest accepted message body, in characters.
pub const MAX_BODY_CHARS: usize = 4000;

/// Client-side idle time after the last keystroke before `stopTyping` is sent.
pub const TYPING_IDLE_MS: u64 = 2000;

/// Default capacity of a connection's outbound event queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Realtime event names, exactly as they appear on the wire.
pub mod events {
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const MARK_AS_READ: &str = "markAsRead";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stopTyping";

    pub const RECEIVE_MESSAGE: &str = "receiveMessage";
    pub const MESSAGE_READ: &str = "messageRead";
    pub const USER_TYPING: &str = "userTyping";
    pub const USER_STOPPED_TYPING: &str = "userStoppedTyping";
    pub const ACK: &str = "ack";
    pub const ERROR: &str = "error";
}
