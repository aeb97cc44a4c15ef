use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use keel::error::{ResultError, SubmissionError};
use keel::runtime::client::{AwaitOutcome, Client, ClientOptions};
use keel::runtime::record::ExecutionStatus;
use keel::runtime::storage::{ExecutionStore, InMemoryExecutionStore, InMemoryTaskQueue, QueueDepth, TaskQueue};
use keel::runtime::task::{Claim, Task};
use keel::runtime::worker::{Worker, WorkerGroup, WorkerOptions};
use keel::workflows::builtin::EchoWorkflow;
use keel::workflows::{WorkflowContext, WorkflowHandler, WorkflowRegistry};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct BadWorkflow;

#[async_trait]
impl WorkflowHandler for BadWorkflow {
    fn name(&self) -> &str {
        "Bad"
    }

    async fn execute(&self, _args: Vec<Value>, _ctx: &WorkflowContext) -> Result<Value> {
        bail!("division by zero")
    }
}

/// Queue that is down.
#[derive(Debug)]
struct UnavailableQueue;

#[async_trait]
impl TaskQueue for UnavailableQueue {
    async fn enqueue(&self, _task: Task) -> Result<()> {
        Err(anyhow!("connection refused"))
    }

    async fn poll(&self, _task_queue: &str, _timeout: Duration) -> Result<Option<Claim>> {
        Err(anyhow!("connection refused"))
    }

    async fn ack(&self, _claim: &Claim) -> Result<bool> {
        Err(anyhow!("connection refused"))
    }

    async fn depth(&self, _task_queue: &str) -> Result<QueueDepth> {
        Err(anyhow!("connection refused"))
    }
}

fn backends() -> (Arc<InMemoryExecutionStore>, Arc<InMemoryTaskQueue>) {
    (
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(InMemoryTaskQueue::new(Duration::from_secs(30))),
    )
}

fn spawn_workers(store: Arc<InMemoryExecutionStore>, queue: Arc<InMemoryTaskQueue>, task_queue: &str) -> WorkerGroup {
    let registry = WorkflowRegistry::new()
        .with(Arc::new(EchoWorkflow))
        .and_then(|r| r.with(Arc::new(BadWorkflow)))
        .unwrap();
    let worker = Worker::new("client-test", vec![task_queue.to_string()], registry, queue, store)
        .unwrap()
        .with_options(WorkerOptions {
            poll_timeout: Duration::from_millis(100),
            ..WorkerOptions::default()
        });
    WorkerGroup::spawn(Arc::new(worker), 2)
}

#[tokio::test]
async fn test_submit_and_await_echo() {
    let (store, queue) = backends();
    let group = spawn_workers(store.clone(), queue.clone(), "q1");
    let client = Client::new(store, queue);

    let handle = client.start("Echo", vec![json!("hi")], "q1", "w1").await.unwrap();
    assert_eq!(handle.workflow_id(), "w1");
    assert!(!handle.is_existing());

    let result = handle.result(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(result, json!("hi"));

    let outcome = client.await_result("w1", Some(Duration::from_millis(10))).await.unwrap();
    assert_eq!(outcome, AwaitOutcome::Completed(json!("hi")));

    group.shutdown_and_join().await;
}

#[tokio::test]
async fn test_failure_surfaces_through_result() {
    let (store, queue) = backends();
    let group = spawn_workers(store.clone(), queue.clone(), "q1");
    let client = Client::new(store, queue);

    let handle = client.start("Bad", vec![], "q1", "bad-1").await.unwrap();
    match handle.result(Some(Duration::from_secs(5))).await {
        Err(ResultError::Failed(message)) => assert!(message.contains("division by zero"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }

    group.shutdown_and_join().await;
}

#[tokio::test]
async fn test_resubmitting_existing_id_returns_prior_result() {
    let (store, queue) = backends();
    let group = spawn_workers(store.clone(), queue.clone(), "q1");
    let client = Client::new(store, queue.clone());

    let first = client.start("Echo", vec![json!("one")], "q1", "w1").await.unwrap();
    first.result(Some(Duration::from_secs(5))).await.unwrap();
    group.shutdown_and_join().await;

    let second = client.start("Echo", vec![json!("two")], "q1", "w1").await.unwrap();
    assert!(second.is_existing());
    assert_eq!(queue.depth("q1").await.unwrap(), QueueDepth::default());

    // already terminal, so a zero timeout is enough
    let outcome = second.await_outcome(Some(Duration::ZERO)).await.unwrap();
    assert_eq!(outcome, AwaitOutcome::Completed(json!("one")));
}

#[tokio::test]
async fn test_duplicate_submissions_enqueue_once() {
    let (store, queue) = backends();
    let client = Client::new(store, queue.clone());

    let a = client.start("Echo", vec![json!(1)], "q1", "w1").await.unwrap();
    let b = client.submit("Echo", vec![json!(1)], "q1", "w1").await.unwrap();
    assert!(!a.is_existing());
    assert!(b.is_existing());
    assert_eq!(queue.depth("q1").await.unwrap().ready, 1);
}

#[tokio::test]
async fn test_await_times_out_with_not_ready() {
    let (store, queue) = backends();
    let client = Client::new(store, queue);
    let handle = client.start("Echo", vec![], "nobody-polls", "w1").await.unwrap();

    let started = tokio::time::Instant::now();
    let outcome = handle.await_outcome(Some(Duration::from_millis(100))).await.unwrap();
    assert_eq!(outcome, AwaitOutcome::NotReady(ExecutionStatus::Pending));
    assert!(!outcome.is_ready());
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert!(matches!(
        handle.result(Some(Duration::from_millis(10))).await,
        Err(ResultError::NotReady(ExecutionStatus::Pending))
    ));
}

#[tokio::test]
async fn test_await_unknown_id_is_not_found() {
    let (store, queue) = backends();
    let client = Client::new(store, queue);
    assert!(matches!(
        client.await_result("missing", Some(Duration::from_millis(10))).await,
        Err(ResultError::NotFound(id)) if id == "missing"
    ));
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let (store, queue) = backends();
    let client = Client::new(store.clone(), queue);

    assert!(matches!(
        client.start("Echo", vec![], "q1", "").await,
        Err(SubmissionError::EmptyWorkflowId)
    ));
    assert!(matches!(
        client.start("Echo", vec![], " ", "w1").await,
        Err(SubmissionError::EmptyTaskQueue)
    ));
    assert!(matches!(
        client.start("", vec![], "q1", "w1").await,
        Err(SubmissionError::EmptyWorkflowType)
    ));
    assert!(store.get("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_known_workflow_types_are_enforced_when_configured() {
    let (store, queue) = backends();
    let client = Client::new(store, queue).with_options(ClientOptions {
        known_workflow_types: Some(HashSet::from(["Echo".to_string()])),
        ..ClientOptions::default()
    });

    assert!(client.start("Echo", vec![], "q1", "w1").await.is_ok());
    assert!(matches!(
        client.start("Mystery", vec![], "q1", "w2").await,
        Err(SubmissionError::UnknownWorkflowType(t)) if t == "Mystery"
    ));
}

#[tokio::test]
async fn test_enqueue_failure_marks_execution_failed() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let client = Client::new(store.clone(), Arc::new(UnavailableQueue));

    match client.start("Echo", vec![], "q1", "w1").await {
        Err(SubmissionError::Enqueue { workflow_id, .. }) => assert_eq!(workflow_id, "w1"),
        other => panic!("expected enqueue error, got {:?}", other),
    }

    let record = store.get("w1").await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().contains("task queue unavailable"));

    // later awaits see the failure instead of waiting forever
    let outcome = client.await_result("w1", Some(Duration::from_millis(10))).await.unwrap();
    assert!(matches!(outcome, AwaitOutcome::Failed(_)));
}

#[tokio::test]
async fn test_nested_json_survives_the_round_trip() {
    let (store, queue) = backends();
    let group = spawn_workers(store.clone(), queue.clone(), "q1");
    let client = Client::new(store, queue);

    let args = vec![json!("text"), json!(42), json!({"list": [1.5, true, null], "map": {"k": "v"}})];
    let handle = client.start("Echo", args.clone(), "q1", "nested").await.unwrap();
    let result = handle.result(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(result, Value::Array(args));

    group.shutdown_and_join().await;
}
