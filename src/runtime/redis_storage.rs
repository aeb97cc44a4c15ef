use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use uuid::Uuid;

use crate::runtime::record::{ExecutionRecord, ExecutionStatus, NewExecution, Transition};
use crate::runtime::storage::{ExecutionStore, QueueDepth, TaskQueue};
use crate::runtime::task::{Claim, Task};

/// Builds `keel:{namespace}` style key prefixes.
pub fn key_prefix(namespace: &str) -> String {
    format!("keel:{}", namespace)
}

async fn shared_connection(
    client: &redis::Client,
    cell: &OnceCell<MultiplexedConnection>,
) -> Result<MultiplexedConnection> {
    let conn = cell
        .get_or_try_init(|| client.get_multiplexed_async_connection())
        .await
        .context("Failed to connect to Redis")?;
    Ok(conn.clone())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Redis-backed task queue.
///
/// Per queue name:
/// - `{prefix}:queue:{name}:visible`    ZSET workflow_id -> visible-at (ms)
/// - `{prefix}:queue:{name}:tasks`      HASH workflow_id -> task JSON
/// - `{prefix}:queue:{name}:deliveries` HASH workflow_id -> delivery count
/// - `{prefix}:queue:{name}:receipts`   HASH workflow_id -> receipt of the live claim
///
/// Claiming pushes the score into the future by the visibility timeout, so an
/// unacked claim simply becomes visible again.
pub struct RedisTaskQueue {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    prefix: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    claim_script: redis::Script,
    ack_script: redis::Script,
}

struct QueueKeys {
    visible: String,
    tasks: String,
    deliveries: String,
    receipts: String,
}

impl RedisTaskQueue {
    pub fn new(client: redis::Client, prefix: impl Into<String>, visibility_timeout: Duration) -> Self {
        let claim_script = redis::Script::new(
            r#"
            local visible = KEYS[1]
            local tasks = KEYS[2]
            local deliveries = KEYS[3]
            local receipts = KEYS[4]
            local now = tonumber(ARGV[1])
            local invisible_until = tonumber(ARGV[2])

            local ids = redis.call("ZRANGEBYSCORE", visible, "-inf", now, "LIMIT", 0, 1)
            if #ids == 0 then
                return false
            end
            local id = ids[1]
            local payload = redis.call("HGET", tasks, id)
            if not payload then
                -- payload already gone, drop the orphaned entry
                redis.call("ZREM", visible, id)
                return false
            end
            redis.call("ZADD", visible, invisible_until, id)
            local count = redis.call("HINCRBY", deliveries, id, 1)
            redis.call("HSET", receipts, id, ARGV[3])
            return {payload, count}
        "#,
        );

        let ack_script = redis::Script::new(
            r#"
            local id = ARGV[1]
            if redis.call("HGET", KEYS[4], id) ~= ARGV[2] then
                return 0
            end
            redis.call("ZREM", KEYS[1], id)
            redis.call("HDEL", KEYS[2], id)
            redis.call("HDEL", KEYS[3], id)
            redis.call("HDEL", KEYS[4], id)
            return 1
        "#,
        );

        Self {
            client,
            conn: OnceCell::new(),
            prefix: prefix.into(),
            visibility_timeout,
            poll_interval: Duration::from_millis(100),
            claim_script,
            ack_script,
        }
    }

    /// How often an idle `poll` re-checks Redis while waiting.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        let base = format!("{}:queue:{}", self.prefix, queue);
        QueueKeys {
            visible: format!("{}:visible", base),
            tasks: format!("{}:tasks", base),
            deliveries: format!("{}:deliveries", base),
            receipts: format!("{}:receipts", base),
        }
    }

    async fn try_claim(&self, queue: &str) -> Result<Option<Claim>> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let keys = self.keys(queue);
        let now = now_millis();
        let timeout_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let invisible_until = now.saturating_add(timeout_ms);
        let receipt = Uuid::new_v4();

        let claimed: Option<(String, u32)> = self
            .claim_script
            .key(&keys.visible)
            .key(&keys.tasks)
            .key(&keys.deliveries)
            .key(&keys.receipts)
            .arg(now)
            .arg(invisible_until)
            .arg(receipt.to_string())
            .invoke_async(&mut conn)
            .await?;

        let Some((payload, delivery_count)) = claimed else {
            return Ok(None);
        };
        let task: Task = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt task payload in queue {}", queue))?;
        Ok(Some(Claim {
            task,
            receipt,
            delivery_count,
        }))
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let keys = self.keys(&task.task_queue);
        let serialized = serde_json::to_string(&task)?;

        let _: () = redis::pipe()
            .atomic()
            .hset(&keys.tasks, &task.workflow_id, serialized)
            .ignore()
            .hset(&keys.deliveries, &task.workflow_id, 0)
            .ignore()
            .hdel(&keys.receipts, &task.workflow_id)
            .ignore()
            .zadd(&keys.visible, &task.workflow_id, now_millis())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Claim>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(claim) = self.try_claim(queue).await? {
                return Ok(Some(claim));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    async fn ack(&self, claim: &Claim) -> Result<bool> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let keys = self.keys(&claim.task.task_queue);

        let removed: i64 = self
            .ack_script
            .key(&keys.visible)
            .key(&keys.tasks)
            .key(&keys.deliveries)
            .key(&keys.receipts)
            .arg(claim.workflow_id())
            .arg(claim.receipt.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let keys = self.keys(queue);
        let now = now_millis();

        let ready: usize = conn.zcount(&keys.visible, "-inf", now).await?;
        let in_flight: usize = conn
            .zcount(&keys.visible, format!("({}", now), "+inf")
            .await?;
        Ok(QueueDepth { ready, in_flight })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Redis-backed execution store: one hash per workflow id at
/// `{prefix}:exec:{workflow_id}`. Every write is a Lua script, so the
/// status check and the update happen atomically on the server.
pub struct RedisExecutionStore {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    prefix: String,
    create_script: redis::Script,
    transition_script: redis::Script,
}

impl RedisExecutionStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        let create_script = redis::Script::new(
            r#"
            if redis.call("EXISTS", KEYS[1]) == 1 then
                return 0
            end
            redis.call("HSET", KEYS[1],
                "workflow_id", ARGV[1],
                "workflow_type", ARGV[2],
                "task_queue", ARGV[3],
                "status", "Pending",
                "attempts", 0,
                "created_at", ARGV[4],
                "updated_at", ARGV[4])
            return 1
        "#,
        );

        // ARGV: target status, now, payload field, payload value
        let transition_script = redis::Script::new(
            r#"
            local status = redis.call("HGET", KEYS[1], "status")
            if not status then
                return {"missing", ""}
            end
            if status == "Completed" or status == "Failed" then
                return {"terminal", status}
            end
            local target = ARGV[1]
            redis.call("HSET", KEYS[1], "status", target, "updated_at", ARGV[2])
            if target == "Running" then
                redis.call("HINCRBY", KEYS[1], "attempts", 1)
                redis.call("HSET", KEYS[1], "started_at", ARGV[2])
            else
                redis.call("HSET", KEYS[1], ARGV[3], ARGV[4], "finished_at", ARGV[2])
            end
            return {"applied", target}
        "#,
        );

        Self {
            client,
            conn: OnceCell::new(),
            prefix: prefix.into(),
            create_script,
            transition_script,
        }
    }

    fn record_key(&self, workflow_id: &str) -> String {
        format!("{}:exec:{}", self.prefix, workflow_id)
    }

    async fn transition(
        &self,
        workflow_id: &str,
        target: ExecutionStatus,
        field: &str,
        value: &str,
    ) -> Result<Transition> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let (outcome, status): (String, String) = self
            .transition_script
            .key(self.record_key(workflow_id))
            .arg(target.as_str())
            .arg(now_millis())
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "applied" => Ok(Transition::Applied),
            "terminal" => Ok(Transition::AlreadyTerminal(status.parse()?)),
            "missing" => Ok(Transition::Missing),
            other => Err(anyhow!("Unexpected transition reply from Redis: {}", other)),
        }
    }
}

fn parse_millis(fields: &HashMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = fields.get(name) else {
        return Ok(None);
    };
    let millis: i64 = raw
        .parse()
        .with_context(|| format!("Invalid {} timestamp: {}", name, raw))?;
    let ts = DateTime::from_timestamp_millis(millis).ok_or_else(|| anyhow!("{} out of range: {}", name, millis))?;
    Ok(Some(ts))
}

fn record_from_hash(mut fields: HashMap<String, String>) -> Result<ExecutionRecord> {
    let mut take = |name: &str| fields.remove(name).ok_or_else(|| anyhow!("Execution record missing field {}", name));
    let workflow_id = take("workflow_id")?;
    let workflow_type = take("workflow_type")?;
    let task_queue = take("task_queue")?;
    let status: ExecutionStatus = take("status")?.parse()?;

    let result = match fields.get("result") {
        Some(raw) => Some(serde_json::from_str::<Value>(raw).context("Corrupt result payload")?),
        None => None,
    };
    let attempts = match fields.get("attempts") {
        Some(raw) => raw.parse().context("Invalid attempts counter")?,
        None => 0,
    };
    let created_at = parse_millis(&fields, "created_at")?.ok_or_else(|| anyhow!("Execution record missing created_at"))?;
    let updated_at = parse_millis(&fields, "updated_at")?.unwrap_or(created_at);

    Ok(ExecutionRecord {
        workflow_id,
        workflow_type,
        task_queue,
        status,
        result,
        error: fields.get("error").cloned(),
        attempts,
        created_at,
        updated_at,
        started_at: parse_millis(&fields, "started_at")?,
        finished_at: parse_millis(&fields, "finished_at")?,
    })
}

#[async_trait]
impl ExecutionStore for RedisExecutionStore {
    async fn create(&self, new: NewExecution) -> Result<(ExecutionRecord, bool)> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let key = self.record_key(&new.workflow_id);

        let created: i64 = self
            .create_script
            .key(&key)
            .arg(&new.workflow_id)
            .arg(&new.workflow_type)
            .arg(&new.task_queue)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;

        // Records are never deleted, so the hash is guaranteed to be there.
        let record = self
            .get(&new.workflow_id)
            .await?
            .ok_or_else(|| anyhow!("Execution record vanished after create: {}", new.workflow_id))?;
        Ok((record, created == 0))
    }

    async fn transition_to_running(&self, workflow_id: &str) -> Result<Transition> {
        self.transition(workflow_id, ExecutionStatus::Running, "", "").await
    }

    async fn complete(&self, workflow_id: &str, result: Value) -> Result<Transition> {
        let serialized = serde_json::to_string(&result)?;
        self.transition(workflow_id, ExecutionStatus::Completed, "result", &serialized)
            .await
    }

    async fn fail(&self, workflow_id: &str, error: &str) -> Result<Transition> {
        self.transition(workflow_id, ExecutionStatus::Failed, "error", error)
            .await
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<ExecutionRecord>> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let fields: HashMap<String, String> = conn.hgetall(self.record_key(workflow_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_hash(fields).map(Some)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = shared_connection(&self.client, &self.conn).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
