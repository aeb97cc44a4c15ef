use keel::config::{KeelConfig, load_config};
use std::fs;
use std::time::Duration;

#[test]
fn test_load_partial_yaml_config() {
    let yaml_content = r#"
namespace: "staging"
redis:
  url: "redis://cache:6379/2"
worker:
  name: "billing-worker"
  task_queues: ["billing", "emails"]
  concurrency: 4
  max_deliveries: 3
client:
  known_workflow_types: ["Echo"]
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("keel.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let config = load_config(&file_path).expect("Failed to load config");
    assert_eq!(config.namespace, "staging");
    assert_eq!(config.key_prefix(), "keel:staging");
    assert_eq!(config.redis.url, "redis://cache:6379/2");
    assert_eq!(config.redis.poll_interval_ms, 100);
    assert_eq!(config.worker.task_queues, vec!["billing", "emails"]);
    assert_eq!(config.worker.concurrency, 4);

    let options = config.worker.options();
    assert_eq!(options.max_deliveries, 3);
    assert_eq!(options.poll_timeout, Duration::from_secs(1));
    assert_eq!(config.worker.visibility_timeout(), Duration::from_secs(30));

    let client = config.client.options();
    assert!(client.known_workflow_types.unwrap().contains("Echo"));
}

#[test]
fn test_defaults_are_valid() {
    let config = KeelConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.key_prefix(), "keel:default");
    assert!(config.client.options().known_workflow_types.is_none());
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");

    let file_path = temp_dir.path().join("zero.yaml");
    fs::write(&file_path, "worker:\n  concurrency: 0\n").unwrap();
    let err = load_config(&file_path).unwrap_err();
    assert!(format!("{:#}", err).contains("worker.concurrency"));

    let file_path = temp_dir.path().join("queues.yaml");
    fs::write(&file_path, "worker:\n  task_queues: []\n").unwrap();
    assert!(load_config(&file_path).is_err());

    let file_path = temp_dir.path().join("broken.yaml");
    fs::write(&file_path, "worker: [not, a, map\n").unwrap();
    assert!(load_config(&file_path).is_err());

    assert!(load_config(temp_dir.path().join("absent.yaml")).is_err());
}

#[test]
fn test_zero_wait_intervals_are_rejected() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cases = [
        ("worker:\n  poll_timeout_ms: 0\n", "worker.poll_timeout_ms"),
        ("client:\n  await_initial_backoff_ms: 0\n", "client.await_initial_backoff_ms"),
        ("client:\n  await_max_backoff_ms: 0\n", "client.await_max_backoff_ms"),
        ("redis:\n  poll_interval_ms: 0\n", "redis.poll_interval_ms"),
    ];

    for (i, (yaml, field)) in cases.iter().enumerate() {
        let file_path = temp_dir.path().join(format!("case{}.yaml", i));
        fs::write(&file_path, yaml).unwrap();
        let err = load_config(&file_path).expect_err(field);
        assert!(format!("{:#}", err).contains(field), "{:#}", err);
    }

    let file_path = temp_dir.path().join("backoff.yaml");
    fs::write(&file_path, "client:\n  await_initial_backoff_ms: 5\n  await_max_backoff_ms: 50\n").unwrap();
    let config = load_config(&file_path).expect("positive backoffs are valid");
    assert_eq!(config.client.options().initial_backoff, Duration::from_millis(5));
    assert_eq!(config.client.options().max_backoff, Duration::from_millis(50));
}
