use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ExecutionStatus::Pending),
            "Running" => Ok(ExecutionStatus::Running),
            "Completed" => Ok(ExecutionStatus::Completed),
            "Failed" => Ok(ExecutionStatus::Failed),
            other => Err(anyhow!("unknown execution status: {}", other)),
        }
    }
}

/// 执行记录 (durable state of one workflow execution)
///
/// `result` is present iff `status == Completed`, `error` iff `status == Failed`.
/// Only the execution store mutates records; everyone else proposes transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of times a worker moved this execution to Running.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn pending(new: &NewExecution) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: new.workflow_id.clone(),
            workflow_type: new.workflow_type.clone(),
            task_queue: new.task_queue.clone(),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal outcome, if any. `Ok` carries the result, `Err` the failure message.
    pub fn outcome(&self) -> Option<Result<Value, String>> {
        match self.status {
            ExecutionStatus::Completed => Some(Ok(self.result.clone().unwrap_or(Value::Null))),
            ExecutionStatus::Failed => Some(Err(self.error.clone().unwrap_or_default())),
            _ => None,
        }
    }

    /// Applies a proposed transition in place. Callers must hold whatever lock
    /// makes the read-check-write atomic for their backend.
    pub(crate) fn apply(&mut self, change: Change) -> Transition {
        if self.status.is_terminal() {
            return Transition::AlreadyTerminal(self.status);
        }
        let now = Utc::now();
        match change {
            Change::Start => {
                self.status = ExecutionStatus::Running;
                self.attempts += 1;
                self.started_at = Some(now);
            }
            Change::Complete(result) => {
                self.status = ExecutionStatus::Completed;
                self.result = Some(result);
                self.finished_at = Some(now);
            }
            Change::Fail(error) => {
                self.status = ExecutionStatus::Failed;
                self.error = Some(error);
                self.finished_at = Some(now);
            }
        }
        self.updated_at = now;
        Transition::Applied
    }
}

pub(crate) enum Change {
    Start,
    Complete(Value),
    Fail(String),
}

/// Request to create a Pending record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
}

/// Outcome of a conditional write against the execution store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record was already Completed or Failed; nothing changed.
    AlreadyTerminal(ExecutionStatus),
    /// No record exists for the workflow id.
    Missing,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}
