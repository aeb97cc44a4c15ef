use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::{ResultError, SubmissionError};
use crate::runtime::record::{ExecutionRecord, ExecutionStatus, NewExecution};
use crate::runtime::storage::{ExecutionStore, TaskQueue};
use crate::runtime::task::Task;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// When set, `start` rejects workflow types outside this set. When unset the
    /// check is deferred to the worker, which fails unknown types.
    pub known_workflow_types: Option<HashSet<String>>,
    /// First sleep between store reads while awaiting a result; doubles up to `max_backoff`.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            known_workflow_types: None,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// What `await_result` observed before returning.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Completed(Value),
    Failed(String),
    /// Timeout elapsed while the execution was still Pending or Running.
    NotReady(ExecutionStatus),
}

impl AwaitOutcome {
    pub fn is_ready(&self) -> bool {
        !matches!(self, AwaitOutcome::NotReady(_))
    }
}

/// Submits workflow executions and looks them up by workflow id.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
    options: ClientOptions,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("options", &self.options).finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(store: Arc<dyn ExecutionStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            store,
            queue,
            options: ClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Records the execution as Pending, then enqueues its task.
    ///
    /// Idempotent on `workflow_id`: if a record already exists (in any status)
    /// its handle is returned and nothing is enqueued. If the enqueue fails the
    /// fresh record is marked Failed so it is never left Pending without a task.
    pub async fn start(
        &self,
        workflow_type: &str,
        args: Vec<Value>,
        task_queue: &str,
        workflow_id: &str,
    ) -> Result<Handle, SubmissionError> {
        if workflow_id.trim().is_empty() {
            return Err(SubmissionError::EmptyWorkflowId);
        }
        if task_queue.trim().is_empty() {
            return Err(SubmissionError::EmptyTaskQueue);
        }
        if workflow_type.trim().is_empty() {
            return Err(SubmissionError::EmptyWorkflowType);
        }
        if let Some(known) = &self.options.known_workflow_types {
            if !known.contains(workflow_type) {
                return Err(SubmissionError::UnknownWorkflowType(workflow_type.to_string()));
            }
        }

        let (record, existed) = self
            .store
            .create(NewExecution {
                workflow_id: workflow_id.to_string(),
                workflow_type: workflow_type.to_string(),
                task_queue: task_queue.to_string(),
            })
            .await
            .map_err(SubmissionError::Store)?;

        if existed {
            info!(workflow_id, status = %record.status, "Workflow id already submitted, returning existing handle");
            return Ok(self.make_handle(workflow_id, true));
        }

        let task = Task::new(workflow_id, workflow_type, args, task_queue);
        if let Err(e) = self.queue.enqueue(task).await {
            error!(workflow_id, error = ?e, "Enqueue failed, marking execution failed");
            let reason = format!("submission failed: task queue unavailable: {:#}", e);
            if let Err(comp) = self.store.fail(workflow_id, &reason).await {
                error!(workflow_id, error = ?comp, "Compensation failed; execution left Pending without a task");
            }
            return Err(SubmissionError::Enqueue {
                workflow_id: workflow_id.to_string(),
                cause: e,
            });
        }

        info!(workflow_id, workflow_type, task_queue, "Workflow submitted");
        Ok(self.make_handle(workflow_id, false))
    }

    /// Submission entry point for external callers; same contract as `start`.
    pub async fn submit(
        &self,
        workflow_type: &str,
        args: Vec<Value>,
        task_queue: &str,
        workflow_id: &str,
    ) -> Result<Handle, SubmissionError> {
        self.start(workflow_type, args, task_queue, workflow_id).await
    }

    /// Handle for an id submitted elsewhere (another process, an earlier run).
    pub fn handle(&self, workflow_id: &str) -> Handle {
        self.make_handle(workflow_id, false)
    }

    pub async fn await_result(
        &self,
        workflow_id: &str,
        timeout: Option<Duration>,
    ) -> Result<AwaitOutcome, ResultError> {
        self.handle(workflow_id).await_outcome(timeout).await
    }

    pub async fn describe(&self, workflow_id: &str) -> Result<Option<ExecutionRecord>> {
        self.store.get(workflow_id).await
    }

    fn make_handle(&self, workflow_id: &str, existing: bool) -> Handle {
        Handle {
            workflow_id: workflow_id.to_string(),
            store: Arc::clone(&self.store),
            initial_backoff: self.options.initial_backoff,
            max_backoff: self.options.max_backoff,
            existing,
        }
    }
}

/// Client-side reference to a submitted workflow.
#[derive(Clone)]
pub struct Handle {
    workflow_id: String,
    store: Arc<dyn ExecutionStore>,
    initial_backoff: Duration,
    max_backoff: Duration,
    existing: bool,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("workflow_id", &self.workflow_id)
            .field("existing", &self.existing)
            .finish_non_exhaustive()
    }
}

impl Handle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// `true` when `start` found an earlier submission with the same id.
    pub fn is_existing(&self) -> bool {
        self.existing
    }

    pub async fn describe(&self) -> Result<Option<ExecutionRecord>> {
        self.store.get(&self.workflow_id).await
    }

    /// Polls the record with exponential backoff until it is terminal or
    /// `timeout` elapses. `None` waits indefinitely.
    pub async fn await_outcome(&self, timeout: Option<Duration>) -> Result<AwaitOutcome, ResultError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = self.initial_backoff;

        loop {
            let record = self
                .store
                .get(&self.workflow_id)
                .await
                .map_err(ResultError::Store)?
                .ok_or_else(|| ResultError::NotFound(self.workflow_id.clone()))?;

            if let Some(outcome) = record.outcome() {
                return Ok(match outcome {
                    Ok(value) => AwaitOutcome::Completed(value),
                    Err(message) => AwaitOutcome::Failed(message),
                });
            }

            let pause = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(AwaitOutcome::NotReady(record.status));
                    }
                    backoff.min(remaining)
                }
                None => backoff,
            };
            tokio::time::sleep(pause).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Waits for the terminal state and returns the workflow's result, or its
    /// failure message as `ResultError::Failed`.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<Value, ResultError> {
        match self.await_outcome(timeout).await? {
            AwaitOutcome::Completed(value) => Ok(value),
            AwaitOutcome::Failed(message) => Err(ResultError::Failed(message)),
            AwaitOutcome::NotReady(status) => Err(ResultError::NotReady(status)),
        }
    }
}
