//! Error taxonomy for admission and restart coordination
//!
//! None of these ever escape the tick loop. Admission errors are logged and
//! surfaced to the affected player; restart errors are translated into
//! protocol replies by the network layer.

use crate::ledger::SubjectId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("subject {subject} is queued for unknown backend '{target}'")]
    InvalidTarget { subject: SubjectId, target: String },
}

/// Failure of the external handoff of a player to a backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("subject disconnected before the transfer completed")]
    SubjectGone,
    #[error("backend rejected the transfer: {reason}")]
    Rejected { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RestartError {
    #[error("'{reported}' reported a completed restart but {}", describe_holder(.current))]
    UnexpectedCompletion {
        reported: String,
        current: Option<String>,
    },
}

fn describe_holder(current: &Option<String>) -> String {
    match current {
        Some(name) => format!("'{}' holds the restart slot", name),
        None => "no restart is in progress".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read hub configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse hub configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid hub configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_completion_messages() {
        let held = RestartError::UnexpectedCompletion {
            reported: "RED".to_string(),
            current: Some("BLACK".to_string()),
        };
        assert_eq!(
            held.to_string(),
            "'RED' reported a completed restart but 'BLACK' holds the restart slot"
        );

        let idle = RestartError::UnexpectedCompletion {
            reported: "RED".to_string(),
            current: None,
        };
        assert_eq!(
            idle.to_string(),
            "'RED' reported a completed restart but no restart is in progress"
        );
    }

    #[test]
    fn test_config_error_from_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let config_err: ConfigError = err.into();
        assert!(config_err.to_string().starts_with("failed to parse"));
    }
}
