//! Ingestion adapters: turn transport payloads into New notifications in the repository.
use std::path::PathBuf;

use notify_common::repository::RepositoryError;
use thiserror::Error;

pub mod file;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod sftp;

pub use file::FileIngestion;
#[cfg(feature = "kafka")]
pub use kafka::KafkaIngestion;
pub use sftp::SftpIngestion;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("{path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("connecting to {address}: {error}")]
    Connect {
        address: String,
        error: std::io::Error,
    },
    #[error("blocking transfer task failed: {0}")]
    BlockingTask(#[from] tokio::task::JoinError),
    #[error("failed to store notification: {0}")]
    RepositoryError(#[from] RepositoryError),
    #[cfg(feature = "kafka")]
    #[error("kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),
    #[error("kafka ingestion is enabled but the worker was built without the kafka feature")]
    KafkaUnavailable,
    #[error("sftp ingestion is enabled but the worker was built without the sftp feature")]
    SftpUnavailable,
}

impl IngestionError {
    fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        IngestionError::Io {
            path: path.into(),
            error,
        }
    }
}
