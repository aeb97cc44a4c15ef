use thiserror::Error;

use crate::runtime::record::ExecutionStatus;

/// Raised synchronously by `Client::start`; never retried automatically.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("workflow id must not be empty")]
    EmptyWorkflowId,

    #[error("task queue name must not be empty")]
    EmptyTaskQueue,

    #[error("workflow type must not be empty")]
    EmptyWorkflowType,

    #[error("workflow type is not registered: {0}")]
    UnknownWorkflowType(String),

    #[error("execution store unavailable: {0:#}")]
    Store(anyhow::Error),

    #[error("task queue unavailable, execution {workflow_id} marked failed: {cause:#}")]
    Enqueue {
        workflow_id: String,
        cause: anyhow::Error,
    },
}

/// Returned by `Handle::result` when no value can be produced.
#[derive(Debug, Error)]
pub enum ResultError {
    /// The workflow logic itself failed; carries the recorded message.
    #[error("workflow failed: {0}")]
    Failed(String),

    #[error("workflow is not finished yet (status: {0})")]
    NotReady(ExecutionStatus),

    #[error("no execution found for workflow id {0}")]
    NotFound(String),

    #[error("execution store unavailable: {0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for workflow type {0}")]
    DuplicateWorkflowType(String),

    #[error("workflow type name must not be empty")]
    EmptyName,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("worker must poll at least one task queue")]
    NoTaskQueues,

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("max_deliveries must be at least 1")]
    NoDeliveries,
}
