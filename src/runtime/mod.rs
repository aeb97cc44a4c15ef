pub mod task;
pub mod record;
pub mod storage;
pub mod redis_storage;
pub mod worker;
pub mod client;

pub use self::client::{AwaitOutcome, Client, ClientOptions, Handle};
pub use self::record::{ExecutionRecord, ExecutionStatus, NewExecution, Transition};
pub use self::storage::{ExecutionStore, InMemoryExecutionStore, InMemoryTaskQueue, QueueDepth, TaskQueue};
pub use self::redis_storage::{RedisExecutionStore, RedisTaskQueue};
pub use self::task::{Claim, Task};
pub use self::worker::{CycleOutcome, Worker, WorkerGroup, WorkerOptions, WorkerStatsSnapshot};
