use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runtime::client::ClientOptions;
use crate::runtime::redis_storage::key_prefix;
use crate::runtime::worker::WorkerOptions;

/// 配置文件 (YAML). Every field has a default; a file only lists what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Isolates the keys of independent deployments sharing one Redis.
    pub namespace: String,
    pub redis: RedisSettings,
    pub worker: WorkerSettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    /// How often an idle poll re-checks the queue.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub name: String,
    pub task_queues: Vec<String>,
    /// Number of independent poll loops.
    pub concurrency: usize,
    pub poll_timeout_ms: u64,
    pub visibility_timeout_ms: u64,
    pub max_deliveries: u32,
    pub execution_timeout_ms: u64,
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub known_workflow_types: Option<Vec<String>>,
    pub await_initial_backoff_ms: Option<u64>,
    pub await_max_backoff_ms: Option<u64>,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            redis: RedisSettings::default(),
            worker: WorkerSettings::default(),
            client: ClientSettings::default(),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            poll_interval_ms: 100,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let defaults = WorkerOptions::default();
        Self {
            name: "worker".to_string(),
            task_queues: vec!["default".to_string()],
            concurrency: 1,
            poll_timeout_ms: defaults.poll_timeout.as_millis() as u64,
            visibility_timeout_ms: 30_000,
            max_deliveries: defaults.max_deliveries,
            execution_timeout_ms: defaults.execution_timeout.as_millis() as u64,
            error_backoff_ms: defaults.error_backoff.as_millis() as u64,
        }
    }
}

impl KeelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.task_queues.iter().all(|q| q.trim().is_empty()) {
            return Err(ConfigError::NoTaskQueues);
        }
        if w.concurrency == 0 {
            return Err(ConfigError::ZeroValue("worker.concurrency"));
        }
        if w.poll_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("worker.poll_timeout_ms"));
        }
        if w.visibility_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("worker.visibility_timeout_ms"));
        }
        if w.execution_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("worker.execution_timeout_ms"));
        }
        if w.max_deliveries == 0 {
            return Err(ConfigError::NoDeliveries);
        }
        if self.redis.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("redis.poll_interval_ms"));
        }
        // doubling a zero backoff keeps it zero
        if self.client.await_initial_backoff_ms == Some(0) {
            return Err(ConfigError::ZeroValue("client.await_initial_backoff_ms"));
        }
        if self.client.await_max_backoff_ms == Some(0) {
            return Err(ConfigError::ZeroValue("client.await_max_backoff_ms"));
        }
        Ok(())
    }

    pub fn key_prefix(&self) -> String {
        key_prefix(&self.namespace)
    }
}

impl WorkerSettings {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_deliveries: self.max_deliveries,
            execution_timeout: Duration::from_millis(self.execution_timeout_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

impl ClientSettings {
    pub fn options(&self) -> ClientOptions {
        let defaults = ClientOptions::default();
        ClientOptions {
            known_workflow_types: self
                .known_workflow_types
                .as_ref()
                .map(|types| types.iter().cloned().collect::<HashSet<_>>()),
            initial_backoff: self
                .await_initial_backoff_ms
                .map_or(defaults.initial_backoff, Duration::from_millis),
            max_backoff: self
                .await_max_backoff_ms
                .map_or(defaults.max_backoff, Duration::from_millis),
        }
    }
}

pub fn load_config(file_path: impl AsRef<Path>) -> Result<KeelConfig> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path.display()))?;

    let config: KeelConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid config in {}", file_path.display()))?;
    Ok(config)
}
