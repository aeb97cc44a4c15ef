use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::RegistryError;

pub mod builtin;
pub mod http;

/// 执行上下文 (what a workflow knows about the delivery it is running under)
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub task_queue: String,
    /// Delivery count of the claim being executed; greater than 1 means the
    /// task was redelivered after an earlier claim expired.
    pub attempt: u32,
}

/// 插件接口：每个 workflow type 必须实现此 Trait
#[async_trait]
pub trait WorkflowHandler: Send + Sync + Debug {
    /// The workflow type name tasks are routed by.
    fn name(&self) -> &str;
    async fn execute(&self, args: Vec<Value>, ctx: &WorkflowContext) -> Result<Value>;
}

/// Workflow type -> handler table, fixed when a worker is built.
#[derive(Debug, Default, Clone)]
pub struct WorkflowRegistry {
    handlers: HashMap<String, Arc<dyn WorkflowHandler>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn WorkflowHandler>) -> Result<(), RegistryError> {
        let name = handler.name().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateWorkflowType(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, handler: Arc<dyn WorkflowHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.handlers.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.handlers.contains_key(workflow_type)
    }

    pub fn workflow_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Registry with every built-in workflow, as served by the `keel worker` binary.
pub fn standard_registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    let handlers: Vec<Arc<dyn WorkflowHandler>> = vec![
        Arc::new(builtin::EchoWorkflow),
        Arc::new(builtin::EvalWorkflow),
        Arc::new(builtin::SleepWorkflow),
        Arc::new(http::HttpWorkflow::new()),
    ];
    for handler in handlers {
        // names are distinct constants
        let _ = registry.register(handler);
    }
    registry
}
