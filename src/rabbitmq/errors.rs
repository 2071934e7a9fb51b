// src/rabbitmq/errors.rs

use std::path::PathBuf;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("No broker connection and no backup file configured")]
    NotConnected,

    #[error("Backup file error at {path}: {source}")]
    BackupError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub(crate) fn backup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RabbitMQError::BackupError {
            path: path.into(),
            source,
        }
    }

    /// True for failures the broker side caused, as opposed to local ones.
    pub fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::PublishError(_)
                | RabbitMQError::TimeoutError(_)
                | RabbitMQError::NotConnected
        )
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_error_names_the_file() {
        let err = RabbitMQError::backup(
            "/tmp/queue.backup",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("/tmp/queue.backup"));
        assert!(text.contains("denied"));
        assert!(!err.is_broker_failure());
    }

    #[test]
    fn test_broker_failures_are_classified() {
        assert!(RabbitMQError::NotConnected.is_broker_failure());
        assert!(RabbitMQError::PublishError("nack".into()).is_broker_failure());
        assert!(!RabbitMQError::ConfigError("bad".into()).is_broker_failure());
    }
}
