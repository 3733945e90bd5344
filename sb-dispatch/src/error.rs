use sb_channels::SessionKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown queue mode: {0}")]
    UnknownQueueMode(String),

    #[error("unknown drop policy: {0}")]
    UnknownDropPolicy(String),

    #[error("unknown reply-to mode: {0}")]
    UnknownReplyToMode(String),

    #[error("unknown session scope: {0}")]
    UnknownSessionScope(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("session {0} is closed")]
    SessionClosed(SessionKey),
}
