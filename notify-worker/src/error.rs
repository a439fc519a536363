use notify_common::pipeline::{ContextError, PipelineError};
use notify_common::queue::QueueError;
use notify_common::repository::{DatabaseError, RepositoryError};
use notify_common::rules::RulesetError;
use thiserror::Error;

use crate::ingest::IngestionError;
use crate::steps::StepSetupError;

/// Enumeration of errors that stop the worker from starting or running.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("a database error occurred: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("failed to load the ruleset: {0}")]
    RulesetError(#[from] RulesetError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to open the audit log: {0}")]
    AuditLogError(std::io::Error),
    #[error("failed to serve http: {0}")]
    ServeError(std::io::Error),
    #[error("failed to set up processing steps: {0}")]
    StepSetupError(#[from] StepSetupError),
    #[error("failed to set up ingestion: {0}")]
    IngestionError(#[from] IngestionError),
    #[error("a background task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// Enumeration of errors in the discovery loop. None of them are fatal to the loop itself.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    RepositoryError(#[from] RepositoryError),
    #[error(transparent)]
    QueueError(#[from] QueueError),
}

/// Enumeration of errors processing a single notification. Any of these schedules a retry.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    ContextError(#[from] ContextError),
    #[error(transparent)]
    PipelineError(#[from] PipelineError),
}
