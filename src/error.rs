//! Error types and exit codes for torrent-mirror

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for mirror operations
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Daemon fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Request queue full ({depth} pending)")]
    QueueFull { depth: usize },

    #[error("Service closed: {service}")]
    ServiceClosed { service: String },

    #[error("Unknown user: {user}")]
    UnknownUser { user: String },

    #[error("Aggregation failed: {message}")]
    Aggregation { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MirrorError {
    /// Whether the error came from talking to the daemon (and is worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Fault { .. } | Self::MalformedResponse { .. }
        )
    }

    /// Convert error to an exit code for the daemon binary:
    /// - 1: IO error
    /// - 2: Configuration error
    /// - 3: Daemon communication error
    /// - 4: Internal error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io(_) => ExitCode::from(1),
            Self::ConfigError { .. } | Self::UnknownUser { .. } => ExitCode::from(2),
            Self::Transport { .. } | Self::Fault { .. } | Self::MalformedResponse { .. } => {
                ExitCode::from(3)
            }
            Self::QueueFull { .. }
            | Self::ServiceClosed { .. }
            | Self::Aggregation { .. }
            | Self::Json(_) => ExitCode::from(4),
        }
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MirrorError::Transport {
            message: "refused".into()
        }
        .is_transient());
        assert!(MirrorError::Fault {
            code: -501,
            message: "bad".into()
        }
        .is_transient());
        assert!(!MirrorError::QueueFull { depth: 3 }.is_transient());
    }
}
