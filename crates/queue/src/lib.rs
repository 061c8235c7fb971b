//! Durable FIFO-with-priority queue of typed tasks.
//!
//! The queue hands each task to exactly one consumer at a time, across
//! any number of processes. Eligible tasks (`pending`, due) are ordered
//! by priority descending then enqueue time ascending. Failed attempts
//! retry with exponential backoff until the task's attempt budget is
//! spent, after which it lands in `failed`.
//!
//! Backends: Postgres (`FOR UPDATE SKIP LOCKED` claim), Redis streams
//! (consumer group with delayed-set promotion and abandoned-entry
//! claims), and an in-memory queue for single-process use and tests.

use std::time::Duration;

use async_trait::async_trait;
use sercha_types::{Task, TaskFilter, TaskId};
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::MemoryQueue;
pub use self::postgres::PostgresQueue;
pub use self::redis::RedisStreamQueue;

/// Cap on the exponential retry backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Idle time after which another consumer may claim a processing task.
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Pause after a transport error before retrying a dequeue.
pub const TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors from queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("task not found")]
	NotFound,

	/// The operation is invalid for the task's current status, e.g.
	/// cancelling a task that is already processing.
	#[error("invalid task state: {0}")]
	InvalidState(String),

	#[error("queue closed")]
	Closed,

	/// Stored payload could not be decoded.
	#[error("task codec: {0}")]
	Codec(String),

	/// The backing store failed or is unreachable.
	#[error("queue backend: {0}")]
	Backend(String),
}

/// Consumer-group member name unique to this process.
pub(crate) fn redis_consumer_name() -> String {
	let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
	let suffix = uuid::Uuid::new_v4().simple().to_string();
	format!("{host}:{}:{}", std::process::id(), &suffix[..8])
}

/// Retry delay after `attempts` failed deliveries: `min(2^attempts, 300)` seconds.
pub fn retry_backoff(attempts: i32) -> Duration {
	let attempts = attempts.clamp(0, 31) as u32;
	Duration::from_secs(2u64.saturating_pow(attempts)).min(MAX_BACKOFF)
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
	/// Pending tasks, eligible and delayed alike.
	pub pending: u64,
	pub processing: u64,
	pub completed: u64,
	pub failed: u64,
	/// Age of the oldest pending task, if any.
	pub oldest_pending_age_secs: Option<u64>,
}

/// A durable task queue safe for concurrent consumers across processes.
#[async_trait]
pub trait TaskQueue: Send + Sync {
	async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

	/// Enqueue all tasks atomically: either every task lands or none.
	async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), QueueError>;

	/// Claim the next eligible task, transitioning it to `processing`
	/// and incrementing its attempt counter. Returns `None` when the
	/// queue has nothing eligible.
	async fn dequeue(&self) -> Result<Option<Task>, QueueError>;

	/// Like [`TaskQueue::dequeue`], but wait up to `timeout` for a task
	/// to become available. Transport errors inside the wait back off
	/// for one second and retry.
	async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError>;

	/// Mark a processing task done.
	async fn ack(&self, id: TaskId) -> Result<(), QueueError>;

	/// Report a failed delivery. Retries with backoff while attempts
	/// remain, otherwise marks the task `failed` with `reason`.
	async fn nack(&self, id: TaskId, reason: &str) -> Result<(), QueueError>;

	async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError>;

	async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError>;

	/// Remove a task that has not started; fails for any other status.
	async fn cancel(&self, id: TaskId) -> Result<(), QueueError>;

	/// Delete completed and failed tasks older than `older_than`.
	/// Returns how many were removed.
	async fn purge(&self, older_than: Duration) -> Result<u64, QueueError>;

	async fn stats(&self) -> Result<QueueStats, QueueError>;

	async fn ping(&self) -> Result<(), QueueError>;

	/// Stop accepting work and wake any blocked consumers.
	async fn close(&self) -> Result<(), QueueError>;
}
