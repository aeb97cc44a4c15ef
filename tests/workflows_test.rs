use keel::error::RegistryError;
use keel::workflows::builtin::{EchoWorkflow, EvalWorkflow, SleepWorkflow};
use keel::workflows::{WorkflowContext, WorkflowHandler, WorkflowRegistry, standard_registry};
use serde_json::{Value, json};
use std::sync::Arc;

fn ctx() -> WorkflowContext {
    WorkflowContext {
        workflow_id: "wf".to_string(),
        task_queue: "q".to_string(),
        attempt: 1,
    }
}

#[tokio::test]
async fn test_echo_shapes() {
    let echo = EchoWorkflow;
    assert_eq!(echo.execute(vec![], &ctx()).await.unwrap(), Value::Null);
    assert_eq!(echo.execute(vec![json!("hi")], &ctx()).await.unwrap(), json!("hi"));
    assert_eq!(
        echo.execute(vec![json!(1), json!("two")], &ctx()).await.unwrap(),
        json!([1, "two"])
    );
}

#[tokio::test]
async fn test_eval_with_variables() {
    let eval = EvalWorkflow;
    let result = eval
        .execute(vec![json!("a * 2 + 1"), json!({"a": 20})], &ctx())
        .await
        .unwrap();
    assert_eq!(result, json!(41));

    let result = eval.execute(vec![json!("\"x\" == name"), json!({"name": "x"})], &ctx()).await.unwrap();
    assert_eq!(result, json!(true));
}

#[tokio::test]
async fn test_eval_errors() {
    let eval = EvalWorkflow;
    assert!(eval.execute(vec![], &ctx()).await.is_err());
    assert!(eval.execute(vec![json!("missing_var + 1")], &ctx()).await.is_err());
    assert!(eval.execute(vec![json!("a"), json!({"a": [1, 2]})], &ctx()).await.is_err());
}

#[tokio::test]
async fn test_sleep_reports_duration() {
    let result = SleepWorkflow.execute(vec![json!(5)], &ctx()).await.unwrap();
    assert_eq!(result, json!({ "slept_ms": 5 }));
}

#[test]
fn test_registry_rejects_duplicate_type() {
    let mut registry = WorkflowRegistry::new();
    registry.register(Arc::new(EchoWorkflow)).unwrap();
    match registry.register(Arc::new(EchoWorkflow)) {
        Err(RegistryError::DuplicateWorkflowType(name)) => assert_eq!(name, "Echo"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_standard_registry_contents() {
    let registry = standard_registry();
    assert_eq!(registry.workflow_types(), vec!["Echo", "Eval", "Http", "Sleep"]);
    assert!(registry.contains("Echo"));
    assert!(registry.get("Bad").is_none());
}
