//! Error types for forge-queue operations.
//!
//! Construction errors (bad configuration, unreachable broker) surface from
//! the constructors. Runtime errors inside worker and read loops are logged
//! where they happen and never reach the caller; producers only ever see
//! the `QueueError` returned by `push` and `has`.

use std::path::PathBuf;

use thiserror::Error;

use crate::queue::config::ConfigError;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue configuration is invalid.
    #[error("Invalid queue configuration: {0}")]
    Config(#[from] ConfigError),

    /// Failed to connect to the remote broker.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A remote broker operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a task.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Disk-backed store I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk log could not be read back.
    #[error("Corrupt queue data in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// `has` was called on a queue that does not track identities.
    #[error("Queue '{0}' is not a unique queue")]
    NotUnique(String),

    /// The queue has been terminated and no longer accepts work.
    #[error("Queue '{0}' has been terminated")]
    Terminated(String),

    /// The queue was already started.
    #[error("Queue '{0}' is already running")]
    AlreadyRunning(String),

    /// A queue with this name is already registered.
    #[error("Queue '{0}' is already registered")]
    DuplicateQueue(String),

    /// The registered queue carries a different task type.
    #[error("Queue '{0}' was registered with a different task type")]
    TypeMismatch(String),
}

impl QueueError {
    /// Returns true for errors worth retrying after a short delay.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            QueueError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::NotUnique("push_update".to_string());
        assert!(err.to_string().contains("push_update"));
        assert!(err.to_string().contains("not a unique queue"));

        let err = QueueError::Terminated("mirror".to_string());
        assert!(err.to_string().contains("terminated"));

        let err = QueueError::Corrupt {
            path: PathBuf::from("/tmp/q/queue.log"),
            reason: "short record".to_string(),
        };
        assert!(err.to_string().contains("queue.log"));
    }

    #[test]
    fn test_transient_classification() {
        let io = QueueError::Io(std::io::Error::other("disk hiccup"));
        assert!(io.is_transient());

        assert!(!QueueError::NotUnique("q".to_string()).is_transient());
        assert!(!QueueError::DuplicateQueue("q".to_string()).is_transient());
    }
}
