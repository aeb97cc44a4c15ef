use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use keel::config::{KeelConfig, load_config};
use keel::runtime::client::{AwaitOutcome, Client};
use keel::runtime::redis_storage::{RedisExecutionStore, RedisTaskQueue};
use keel::runtime::storage::{ExecutionStore, InMemoryExecutionStore, InMemoryTaskQueue, TaskQueue};
use keel::runtime::worker::{Worker, WorkerGroup};
use keel::workflows::standard_registry;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Durable workflow execution on Redis", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Redis connection URL (overrides the config file)
    #[arg(long, global = true)]
    redis: Option<String>,

    /// Key namespace (overrides the config file)
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a worker polling task queues on Redis
    Worker {
        /// Worker name (for logging)
        #[arg(long)]
        name: Option<String>,

        /// Task queue to poll; repeat for several
        #[arg(long = "queue", short)]
        queues: Vec<String>,

        /// Number of concurrent poll loops
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Submit a workflow execution to Redis
    Submit {
        /// Workflow type, e.g. Echo
        #[arg(long = "type", short = 't')]
        workflow_type: String,

        /// Workflow argument (JSON, plain strings allowed); repeat for several
        #[arg(long = "arg", short, value_parser = parse_json_arg)]
        args: Vec<Value>,

        #[arg(long, short, default_value = "default")]
        queue: String,

        /// Workflow id; generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Wait for the result after submitting
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Wait for the result of a workflow execution
    Result {
        #[arg(long)]
        id: String,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the execution record of a workflow, or the depth of a task queue
    Status {
        #[arg(long, required_unless_present = "queue")]
        id: Option<String>,

        #[arg(long)]
        queue: Option<String>,
    },

    /// Run workers, submit and await in one process (in memory, nothing is persisted)
    Run {
        #[arg(long = "type", short = 't', default_value = "Echo")]
        workflow_type: String,

        #[arg(long = "arg", short, value_parser = parse_json_arg)]
        args: Vec<Value>,

        #[arg(long, short, default_value = "hello-world")]
        queue: String,

        #[arg(long)]
        id: Option<String>,

        #[arg(long, default_value_t = 2)]
        workers: usize,

        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Check that Redis is reachable
    Health,
}

fn parse_json_arg(s: &str) -> Result<Value, String> {
    // Try parsing as JSON, otherwise treat as string
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}

fn generated_workflow_id() -> String {
    format!("hello-workflow-{}", Utc::now().timestamp_millis())
}

fn load_settings(cli: &Cli) -> Result<KeelConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => KeelConfig::default(),
    };
    if let Some(url) = &cli.redis {
        config.redis.url = url.clone();
    }
    if let Some(ns) = &cli.namespace {
        config.namespace = ns.clone();
    }
    Ok(config)
}

fn redis_backends(config: &KeelConfig) -> Result<(Arc<dyn ExecutionStore>, Arc<dyn TaskQueue>)> {
    let client = redis::Client::open(config.redis.url.as_str())
        .map_err(|e| anyhow!("Invalid Redis URL {}: {}", config.redis.url, e))?;
    let prefix = config.key_prefix();
    let store = Arc::new(RedisExecutionStore::new(client.clone(), prefix.clone()));
    let queue = Arc::new(
        RedisTaskQueue::new(client, prefix, config.worker.visibility_timeout())
            .with_poll_interval(Duration::from_millis(config.redis.poll_interval_ms)),
    );
    Ok((store, queue))
}

fn print_outcome(workflow_id: &str, outcome: &AwaitOutcome) {
    let body = match outcome {
        AwaitOutcome::Completed(value) => json!({ "workflow_id": workflow_id, "status": "Completed", "result": value }),
        AwaitOutcome::Failed(error) => json!({ "workflow_id": workflow_id, "status": "Failed", "error": error }),
        AwaitOutcome::NotReady(status) => json!({ "workflow_id": workflow_id, "status": status, "ready": false }),
    };
    println!("{}", body);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let mut config = load_settings(&cli)?;

    match cli.command {
        Commands::Worker {
            name,
            queues,
            concurrency,
        } => {
            if let Some(name) = name {
                config.worker.name = name;
            }
            if !queues.is_empty() {
                config.worker.task_queues = queues;
            }
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            config.validate()?;
            if config.worker.execution_timeout_ms >= config.worker.visibility_timeout_ms {
                warn!("execution_timeout_ms >= visibility_timeout_ms: long workflows may be redelivered while still running");
            }

            let (store, queue) = redis_backends(&config)?;
            let task_queues: Vec<String> = config
                .worker
                .task_queues
                .iter()
                .filter(|q| !q.trim().is_empty())
                .cloned()
                .collect();

            let worker = Worker::new(config.worker.name.clone(), task_queues, standard_registry(), queue, store)?
                .with_options(config.worker.options());
            let worker = Arc::new(worker);

            info!(worker = %worker.name(), redis = %config.redis.url, namespace = %config.namespace, "Starting worker...");
            let group = WorkerGroup::spawn(Arc::clone(&worker), config.worker.concurrency);

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested, waiting for in-flight workflows...");
            group.shutdown_and_join().await;
            info!(stats = ?worker.stats(), "Worker exited.");
        }

        Commands::Submit {
            workflow_type,
            args,
            queue,
            id,
            wait,
            timeout_ms,
        } => {
            let (store, task_queue) = redis_backends(&config)?;
            let client = Client::new(store, task_queue).with_options(config.client.options());
            let workflow_id = id.unwrap_or_else(generated_workflow_id);

            let handle = client.start(&workflow_type, args, &queue, &workflow_id).await?;
            if handle.is_existing() {
                println!("Workflow {} already exists", handle.workflow_id());
            } else {
                println!("Started workflow {}", handle.workflow_id());
            }

            if wait {
                info!("Waiting for result...");
                let outcome = handle.await_outcome(timeout_ms.map(Duration::from_millis)).await?;
                print_outcome(handle.workflow_id(), &outcome);
            }
        }

        Commands::Result { id, timeout_ms } => {
            let (store, task_queue) = redis_backends(&config)?;
            let client = Client::new(store, task_queue).with_options(config.client.options());
            let outcome = client
                .await_result(&id, timeout_ms.map(Duration::from_millis))
                .await?;
            print_outcome(&id, &outcome);
        }

        Commands::Status { id, queue } => {
            let (store, task_queue) = redis_backends(&config)?;
            if let Some(id) = id {
                match store.get(&id).await? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => bail!("No execution found for workflow id {}", id),
                }
            }
            if let Some(queue) = queue {
                let depth = task_queue.depth(&queue).await?;
                println!("{}", json!({ "queue": queue, "ready": depth.ready, "in_flight": depth.in_flight }));
            }
        }

        Commands::Run {
            workflow_type,
            args,
            queue,
            id,
            workers,
            timeout_ms,
        } => {
            info!("Running in Standalone Memory Mode");
            let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
            let task_queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(config.worker.visibility_timeout()));

            let worker = Worker::new("local", vec![queue.clone()], standard_registry(), Arc::clone(&task_queue), Arc::clone(&store))?
                .with_options(config.worker.options());
            let group = WorkerGroup::spawn(Arc::new(worker), workers.max(1));

            let client = Client::new(store, task_queue).with_options(config.client.options());
            let workflow_id = id.unwrap_or_else(generated_workflow_id);
            let handle = client.start(&workflow_type, args, &queue, &workflow_id).await?;
            info!(workflow_id = %handle.workflow_id(), "Started workflow, waiting for result...");

            let outcome = handle.await_outcome(Some(Duration::from_millis(timeout_ms))).await;
            group.shutdown_and_join().await;
            print_outcome(handle.workflow_id(), &outcome?);
        }

        Commands::Health => {
            let (store, task_queue) = redis_backends(&config)?;
            store.ping().await?;
            task_queue.ping().await?;
            println!("{}", json!({ "status": "healthy", "redis": config.redis.url, "namespace": config.namespace }));
        }
    }

    Ok(())
}
