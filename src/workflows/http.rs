use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::workflows::{WorkflowContext, WorkflowHandler};

/// Request described by the workflow's first argument.
#[derive(Debug, Deserialize)]
struct HttpRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    headers: HashMap<String, String>,
    timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// JSON bodies are returned parsed, anything else as text (null when empty).
fn decode_body(text: String) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// Performs one HTTP request:
/// `{"url": "...", "method": "POST", "body": {...}, "headers": {...}, "timeout_ms": 5000}`.
///
/// Returns `{"status": 200, "ok": true, "data": ...}`. A non-2xx status is a
/// result, not a failure; only transport errors fail the workflow.
#[derive(Debug)]
pub struct HttpWorkflow {
    client: Client,
}

impl HttpWorkflow {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowHandler for HttpWorkflow {
    fn name(&self) -> &str {
        "Http"
    }

    async fn execute(&self, mut args: Vec<Value>, ctx: &WorkflowContext) -> Result<Value> {
        if args.is_empty() {
            return Err(anyhow!("Http expects a request object argument"));
        }
        let request: HttpRequest =
            serde_json::from_value(args.swap_remove(0)).context("Invalid Http request argument")?;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| anyhow!("Invalid HTTP method: {}", request.method))?;

        info!(workflow_id = %ctx.workflow_id, %method, url = %request.url, "[HTTP] request");
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Request to {} failed", request.url))?;
        let status = response.status();
        let text = response.text().await.context("Failed to read response body")?;

        Ok(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "data": decode_body(text),
        }))
    }
}
