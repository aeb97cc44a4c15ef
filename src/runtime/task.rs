use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 任务信封 (queued unit of work dispatching one workflow to a worker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub workflow_id: String,
    pub workflow_type: String,
    pub args: Vec<Value>,
    pub task_queue: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        args: Vec<Value>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            args,
            task_queue: task_queue.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// One delivery of a task to a worker.
///
/// The receipt identifies this delivery only: once the visibility timeout
/// expires and the task is handed out again, acking with the old receipt
/// does nothing.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: Task,
    pub receipt: Uuid,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl Claim {
    pub fn workflow_id(&self) -> &str {
        &self.task.workflow_id
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
