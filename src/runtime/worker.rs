use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::runtime::record::{ExecutionStatus, Transition};
use crate::runtime::storage::{ExecutionStore, TaskQueue};
use crate::runtime::task::Claim;
use crate::workflows::{WorkflowContext, WorkflowRegistry};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Total time one poll cycle waits for a task across all of the worker's queues.
    pub poll_timeout: Duration,
    /// A claim delivered more often than this is failed instead of executed.
    pub max_deliveries: u32,
    pub execution_timeout: Duration,
    /// Pause after a queue/store error before polling again.
    pub error_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            max_deliveries: 5,
            execution_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// Result of one Idle -> Polling -> Executing -> Reporting cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was delivered before the poll timeout.
    Idle,
    Completed { workflow_id: String },
    Failed { workflow_id: String, error: String },
    /// The execution was already terminal (redelivery or a slower duplicate);
    /// the claim was acked and nothing was overwritten.
    Duplicate { workflow_id: String, status: ExecutionStatus },
    /// Delivered more than `max_deliveries` times; recorded as Failed.
    Exhausted { workflow_id: String, deliveries: u32 },
    /// A task with no execution record. Dropped.
    Orphaned { workflow_id: String },
    /// Queue or store error. Any claim is left unacked and will be redelivered.
    InfrastructureError(String),
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    infrastructure_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub infrastructure_errors: u64,
}

impl WorkerStats {
    fn record(&self, outcome: &CycleOutcome) {
        let counter = match outcome {
            CycleOutcome::Completed { .. } => &self.completed,
            CycleOutcome::Failed { .. } | CycleOutcome::Exhausted { .. } => &self.failed,
            CycleOutcome::Duplicate { .. } => &self.duplicates,
            CycleOutcome::InfrastructureError(_) => &self.infrastructure_errors,
            CycleOutcome::Idle | CycleOutcome::Orphaned { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            infrastructure_errors: self.infrastructure_errors.load(Ordering::Relaxed),
        }
    }
}

/// Polls task queues, runs the registered workflow logic and reports the
/// terminal state to the execution store.
///
/// A `Worker` can be shared by several loops (see `WorkerGroup`); every loop
/// has at most one task in flight.
pub struct Worker {
    name: String,
    task_queues: Vec<String>,
    registry: Arc<WorkflowRegistry>,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn ExecutionStore>,
    options: WorkerOptions,
    stats: Arc<WorkerStats>,
    next_queue: AtomicUsize,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        task_queues: Vec<String>,
        registry: WorkflowRegistry,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn ExecutionStore>,
    ) -> Result<Self, ConfigError> {
        if task_queues.is_empty() {
            return Err(ConfigError::NoTaskQueues);
        }
        Ok(Self {
            name: name.into(),
            task_queues,
            registry: Arc::new(registry),
            queue,
            store,
            options: WorkerOptions::default(),
            stats: Arc::new(WorkerStats::default()),
            next_queue: AtomicUsize::new(0),
        })
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_queues(&self) -> &[String] {
        &self.task_queues
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs cycles until `shutdown` flips to `true` (or its sender is dropped).
    /// Shutdown interrupts polling only; an executing workflow is reported first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.name,
            queues = ?self.task_queues,
            workflow_types = ?self.registry.workflow_types(),
            "Worker started."
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = self.poll_next() => polled,
            };

            let outcome = match polled {
                Ok(Some(claim)) => self.process(claim).await,
                Ok(None) => continue,
                Err(e) => self.poll_failed(e),
            };

            if let CycleOutcome::InfrastructureError(_) = outcome {
                tokio::time::sleep(self.options.error_backoff).await;
            }
        }

        info!(worker = %self.name, stats = ?self.stats(), "Worker stopped.");
    }

    /// One full cycle: poll, and if a task arrives, execute and report it.
    pub async fn run_once(&self) -> CycleOutcome {
        match self.poll_next().await {
            Ok(Some(claim)) => self.process(claim).await,
            Ok(None) => CycleOutcome::Idle,
            Err(e) => self.poll_failed(e),
        }
    }

    fn poll_failed(&self, e: anyhow::Error) -> CycleOutcome {
        let outcome = self.infrastructure_error("poll", None, e);
        self.stats.record(&outcome);
        outcome
    }

    /// Polls each queue in turn, starting from a rotating offset so a busy
    /// queue cannot starve the others.
    async fn poll_next(&self) -> Result<Option<Claim>> {
        let n = self.task_queues.len();
        let slice = self.options.poll_timeout / n as u32;
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed);

        for i in 0..n {
            let queue = &self.task_queues[(start + i) % n];
            if let Some(claim) = self.queue.poll(queue, slice).await? {
                debug!(worker = %self.name, queue = %queue, workflow_id = %claim.workflow_id(), delivery = claim.delivery_count, "Claimed task");
                return Ok(Some(claim));
            }
        }
        Ok(None)
    }

    /// Executes and reports an already claimed task.
    pub async fn process(&self, claim: Claim) -> CycleOutcome {
        let outcome = self.process_claim(&claim).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn process_claim(&self, claim: &Claim) -> CycleOutcome {
        let workflow_id = claim.workflow_id().to_string();

        if claim.delivery_count > self.options.max_deliveries {
            let error = format!(
                "exceeded maximum deliveries ({}) without reporting a result",
                self.options.max_deliveries
            );
            let outcome = match self.store.fail(&workflow_id, &error).await {
                Ok(Transition::Applied) => {
                    error!(worker = %self.name, workflow_id = %workflow_id, deliveries = claim.delivery_count, "Giving up on workflow");
                    CycleOutcome::Exhausted {
                        workflow_id,
                        deliveries: claim.delivery_count,
                    }
                }
                Ok(Transition::AlreadyTerminal(status)) => {
                    info!(worker = %self.name, workflow_id = %workflow_id, %status, deliveries = claim.delivery_count, "Execution already finished, dropping redelivered task");
                    CycleOutcome::Duplicate { workflow_id, status }
                }
                Ok(Transition::Missing) => {
                    error!(worker = %self.name, workflow_id = %workflow_id, "No execution record for task, dropping it");
                    CycleOutcome::Orphaned { workflow_id }
                }
                Err(e) => return self.infrastructure_error("fail", Some(&workflow_id), e),
            };
            self.ack(claim).await;
            return outcome;
        }

        match self.store.transition_to_running(&workflow_id).await {
            Ok(Transition::Applied) => {}
            Ok(Transition::AlreadyTerminal(status)) => {
                info!(worker = %self.name, workflow_id = %workflow_id, %status, "Execution already finished, dropping redelivered task");
                self.ack(claim).await;
                return CycleOutcome::Duplicate { workflow_id, status };
            }
            Ok(Transition::Missing) => {
                error!(worker = %self.name, workflow_id = %workflow_id, "No execution record for task, dropping it");
                self.ack(claim).await;
                return CycleOutcome::Orphaned { workflow_id };
            }
            Err(e) => return self.infrastructure_error("transition_to_running", Some(&workflow_id), e),
        }

        let result = self.execute(claim).await;

        // Reporting
        let written = match &result {
            Ok(value) => self.store.complete(&workflow_id, value.clone()).await,
            Err(message) => self.store.fail(&workflow_id, message).await,
        };
        let written = match written {
            Ok(t) => t,
            Err(e) => return self.infrastructure_error("report", Some(&workflow_id), e),
        };
        self.ack(claim).await;

        match (written, result) {
            (Transition::AlreadyTerminal(status), _) => {
                warn!(worker = %self.name, workflow_id = %workflow_id, %status, "Another delivery already reported this execution; result discarded");
                CycleOutcome::Duplicate { workflow_id, status }
            }
            (Transition::Missing, _) => {
                error!(worker = %self.name, workflow_id = %workflow_id, "Execution record disappeared while running");
                CycleOutcome::Orphaned { workflow_id }
            }
            (Transition::Applied, Ok(_)) => {
                info!(worker = %self.name, workflow_id = %workflow_id, "Workflow completed");
                CycleOutcome::Completed { workflow_id }
            }
            (Transition::Applied, Err(error)) => {
                error!(worker = %self.name, workflow_id = %workflow_id, error = %error, "Workflow failed");
                CycleOutcome::Failed { workflow_id, error }
            }
        }
    }

    /// Runs the workflow logic in its own tokio task so a panic or a hang
    /// cannot take the worker loop down with it.
    async fn execute(&self, claim: &Claim) -> Result<Value, String> {
        let task = &claim.task;
        let Some(handler) = self.registry.get(&task.workflow_type) else {
            return Err(format!(
                "workflow type {} is not registered on worker {}",
                task.workflow_type, self.name
            ));
        };

        let ctx = WorkflowContext {
            workflow_id: task.workflow_id.clone(),
            task_queue: task.task_queue.clone(),
            attempt: claim.delivery_count,
        };
        let args = task.args.clone();
        let mut join: JoinHandle<Result<Value>> = tokio::spawn(async move { handler.execute(args, &ctx).await });

        match tokio::time::timeout(self.options.execution_timeout, &mut join).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(format!("workflow panicked: {}", panic_message(join_err.into_panic())))
            }
            Ok(Err(join_err)) => Err(format!("workflow task aborted: {}", join_err)),
            Err(_) => {
                join.abort();
                Err(format!("workflow timed out after {:?}", self.options.execution_timeout))
            }
        }
    }

    async fn ack(&self, claim: &Claim) {
        match self.queue.ack(claim).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(worker = %self.name, workflow_id = %claim.workflow_id(), "Claim expired before ack; task may be delivered again")
            }
            Err(e) => {
                warn!(worker = %self.name, workflow_id = %claim.workflow_id(), error = ?e, "Ack failed; task will be redelivered")
            }
        }
    }

    fn infrastructure_error(&self, op: &str, workflow_id: Option<&str>, e: anyhow::Error) -> CycleOutcome {
        warn!(worker = %self.name, op, workflow_id = ?workflow_id, error = ?e, "Infrastructure error; relying on redelivery");
        CycleOutcome::InfrastructureError(format!("{}: {:#}", op, e))
    }
}

/// A set of worker loops sharing one `Worker` and one shutdown signal.
/// Dropping the group without calling `shutdown_and_join` stops the loops too.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(worker: Arc<Worker>, loops: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(loops);
        for _ in 0..loops {
            let w = Arc::clone(&worker);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { w.run(rx).await }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}
