use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Value, json};
use tracing::info;

use crate::workflows::{WorkflowContext, WorkflowHandler};

/// Returns its argument unchanged (all arguments as a list when given several).
#[derive(Debug)]
pub struct EchoWorkflow;

#[async_trait]
impl WorkflowHandler for EchoWorkflow {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn execute(&self, mut args: Vec<Value>, ctx: &WorkflowContext) -> Result<Value> {
        info!(workflow_id = %ctx.workflow_id, "[ECHO] {:?}", args);
        Ok(match args.len() {
            0 => Value::Null,
            1 => args.remove(0),
            _ => Value::Array(args),
        })
    }
}

/// Evaluates an expression: `args[0]` is the expression, `args[1]` an optional
/// object of variables, e.g. `["a * 2 + 1", {"a": 20}]`.
#[derive(Debug)]
pub struct EvalWorkflow;

fn to_eval_value(v: &Value) -> Option<evalexpr::Value> {
    match v {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    }
}

fn from_eval_value(v: evalexpr::Value) -> Value {
    match v {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => json!(i),
        evalexpr::Value::Float(f) => json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => Value::Array(items.into_iter().map(from_eval_value).collect()),
        _ => Value::Null,
    }
}

#[async_trait]
impl WorkflowHandler for EvalWorkflow {
    fn name(&self) -> &str {
        "Eval"
    }

    async fn execute(&self, args: Vec<Value>, _ctx: &WorkflowContext) -> Result<Value> {
        let expr = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Eval expects an expression string as its first argument"))?;

        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        if let Some(vars) = args.get(1).and_then(|v| v.as_object()) {
            for (k, v) in vars {
                let ev = to_eval_value(v).ok_or_else(|| anyhow!("Unsupported value for variable {}: {}", k, v))?;
                eval_ctx
                    .set_value(k.clone(), ev)
                    .map_err(|e| anyhow!("Cannot bind variable {}: {}", k, e))?;
            }
        }

        let result = eval_with_context(expr, &eval_ctx)
            .map_err(|e| anyhow!("Expression evaluation failed: {} -> {}", expr, e))?;
        Ok(from_eval_value(result))
    }
}

/// Sleeps for `args[0]` milliseconds (default 10).
#[derive(Debug)]
pub struct SleepWorkflow;

#[async_trait]
impl WorkflowHandler for SleepWorkflow {
    fn name(&self) -> &str {
        "Sleep"
    }

    async fn execute(&self, args: Vec<Value>, _ctx: &WorkflowContext) -> Result<Value> {
        let ms = args.first().and_then(|v| v.as_u64()).unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}
