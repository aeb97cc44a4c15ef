use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::runtime::record::{Change, ExecutionRecord, NewExecution, Transition};
use crate::runtime::task::{Claim, Task};

// --- Interfaces ---

/// At-least-once delivery channel, partitioned by task queue name.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably appends a task to `task.task_queue`. Never waits for a consumer.
    async fn enqueue(&self, task: Task) -> Result<()>;

    /// Claims the next visible task of `queue`, waiting up to `timeout`.
    /// The claim stays invisible to other pollers until it is acked or its
    /// visibility timeout expires, after which the task is delivered again.
    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Claim>>;

    /// Removes the claimed task. Returns `false` if the claim is stale
    /// (expired and possibly handed to another worker).
    async fn ack(&self, claim: &Claim) -> Result<bool>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable keyed record of execution status. All writes are conditional:
/// a terminal record is never modified again.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Atomic create-if-absent. The flag is `true` when the record already existed.
    async fn create(&self, new: NewExecution) -> Result<(ExecutionRecord, bool)>;
    async fn transition_to_running(&self, workflow_id: &str) -> Result<Transition>;
    async fn complete(&self, workflow_id: &str, result: Value) -> Result<Transition>;
    async fn fail(&self, workflow_id: &str, error: &str) -> Result<Transition>;
    async fn get(&self, workflow_id: &str) -> Result<Option<ExecutionRecord>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Tasks a poller could claim right now.
    pub ready: usize,
    /// Claimed tasks whose visibility timeout has not expired yet.
    pub in_flight: usize,
}

// --- In-Memory Implementations ---

/// Process-local queue. Not durable; meant for tests and standalone runs.
pub struct InMemoryTaskQueue {
    queues: DashMap<String, Arc<QueueState>>,
    visibility_timeout: Duration,
}

struct QueueState {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    // (task, deliveries so far)
    ready: VecDeque<(Task, u32)>,
    in_flight: HashMap<Uuid, InFlight>,
}

struct InFlight {
    task: Task,
    delivery_count: u32,
    invisible_until: Instant,
}

impl QueueInner {
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.invisible_until <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                debug!(workflow_id = %f.task.workflow_id, deliveries = f.delivery_count, "Claim expired, task visible again");
                self.ready.push_back((f.task, f.delivery_count));
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.invisible_until).min()
    }
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            visibility_timeout,
        }
    }

    fn state(&self, queue: &str) -> Arc<QueueState> {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    inner: Mutex::new(QueueInner::default()),
                    notify: Notify::new(),
                })
            })
            .value()
            .clone()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let state = self.state(&task.task_queue);
        state.inner.lock().await.ready.push_back((task, 0));
        // notify_one stores a permit when nobody is waiting yet
        state.notify.notify_one();
        Ok(())
    }

    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Claim>> {
        let state = self.state(queue);
        let deadline = Instant::now() + timeout;

        loop {
            let next_expiry = {
                let mut inner = state.inner.lock().await;
                let now = Instant::now();
                inner.reap_expired(now);

                if let Some((task, previous)) = inner.ready.pop_front() {
                    let receipt = Uuid::new_v4();
                    let delivery_count = previous + 1;
                    inner.in_flight.insert(
                        receipt,
                        InFlight {
                            task: task.clone(),
                            delivery_count,
                            invisible_until: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(Claim {
                        task,
                        receipt,
                        delivery_count,
                    }));
                }
                inner.next_expiry()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));

            tokio::select! {
                _ = state.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, claim: &Claim) -> Result<bool> {
        let Some(state) = self.queues.get(&claim.task.task_queue).map(|s| s.value().clone()) else {
            return Ok(false);
        };
        let removed = state.inner.lock().await.in_flight.remove(&claim.receipt);
        Ok(removed.is_some())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let state = self.state(queue);
        let mut inner = state.inner.lock().await;
        inner.reap_expired(Instant::now());
        Ok(QueueDepth {
            ready: inner.ready.len(),
            in_flight: inner.in_flight.len(),
        })
    }
}

/// Process-local execution store backed by a `DashMap`; the map's entry
/// locks make create-if-absent and conditional transitions atomic.
pub struct InMemoryExecutionStore {
    records: DashMap<String, ExecutionRecord>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn transition(&self, workflow_id: &str, change: Change) -> Transition {
        match self.records.get_mut(workflow_id) {
            Some(mut record) => record.apply(change),
            None => Transition::Missing,
        }
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, new: NewExecution) -> Result<(ExecutionRecord, bool)> {
        match self.records.entry(new.workflow_id.clone()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), true)),
            Entry::Vacant(slot) => {
                let record = ExecutionRecord::pending(&new);
                slot.insert(record.clone());
                Ok((record, false))
            }
        }
    }

    async fn transition_to_running(&self, workflow_id: &str) -> Result<Transition> {
        Ok(self.transition(workflow_id, Change::Start))
    }

    async fn complete(&self, workflow_id: &str, result: Value) -> Result<Transition> {
        Ok(self.transition(workflow_id, Change::Complete(result)))
    }

    async fn fail(&self, workflow_id: &str, error: &str) -> Result<Transition> {
        Ok(self.transition(workflow_id, Change::Fail(error.to_string())))
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.records.get(workflow_id).map(|r| r.value().clone()))
    }
}
