use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode packet: {0}")]
    Codec(#[from] bincode::Error),
    #[error("invalid hub address '{0}'")]
    Address(String),
    #[error("no reply from hub within {0:?}")]
    Timeout(Duration),
    #[error("unexpected reply from hub: {0}")]
    UnexpectedReply(String),
    #[error("restart denied: {0}")]
    Denied(String),
    #[error("no restart slot after {0} attempts")]
    GaveUp(u32),
    #[error("restart command failed: {0}")]
    CommandFailed(String),
    #[error("hub rejected the completion report: {0}")]
    CompletionRejected(String),
    #[error("hub could not send its restart state: {0}")]
    StateUnavailable(String),
    #[error("failed to read player count: {0}")]
    Count(String),
}
