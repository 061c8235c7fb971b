//! Redis streams queue backend.
//!
//! Layout: a consumer-group stream carries only task ids; the full task
//! record lives in a string key per task, updated on every transition.
//! Future-dated tasks wait in a sorted set scored by their due time and
//! are promoted into the stream by a Lua step that runs ahead of every
//! read. Entries left pending by a dead consumer are taken over with
//! `XAUTOCLAIM` once their idle time passes the claim timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use sercha_types::{Task, TaskFilter, TaskId, TaskStatus};
use tokio::time::Instant;

use crate::{CLAIM_TIMEOUT, QueueError, QueueStats, TRANSPORT_BACKOFF, TaskQueue, retry_backoff};

const STREAM: &str = "sercha:tasks:stream";
const GROUP: &str = "sercha:tasks:workers";
const DELAYED: &str = "sercha:tasks:delayed";
const TASK_PREFIX: &str = "sercha:task:";

/// Moves due delayed tasks into the stream atomically.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
	redis.call('ZREM', KEYS[1], id)
	redis.call('XADD', KEYS[2], '*', 'id', id)
end
return #due
";

/// Queue over Redis streams with a consumer group per deployment.
pub struct RedisStreamQueue {
	conn: ConnectionManager,
	consumer: String,
	/// Stream entry id for each task this consumer holds in flight.
	inflight: Mutex<HashMap<TaskId, String>>,
	group_ready: AtomicBool,
	/// Last abandoned-entry claim sweep.
	last_claim: Mutex<Option<Instant>>,
	closed: AtomicBool,
}

impl RedisStreamQueue {
	/// Wrap an established connection manager.
	pub fn new(conn: ConnectionManager) -> Self {
		Self {
			conn,
			consumer: crate::redis_consumer_name(),
			inflight: Mutex::new(HashMap::new()),
			group_ready: AtomicBool::new(false),
			last_claim: Mutex::new(None),
			closed: AtomicBool::new(false),
		}
	}

	/// Connect to `url` and build a queue.
	pub async fn connect(url: &str) -> Result<Self, QueueError> {
		let client = ::redis::Client::open(url).map_err(backend)?;
		let conn = ConnectionManager::new(client).await.map_err(backend)?;
		Ok(Self::new(conn))
	}

	fn task_key(id: TaskId) -> String {
		format!("{TASK_PREFIX}{id}")
	}

	async fn ensure_group(&self) -> Result<(), QueueError> {
		if self.group_ready.load(Ordering::Relaxed) {
			return Ok(());
		}

		let mut conn = self.conn.clone();
		let created: Result<String, ::redis::RedisError> =
			conn.xgroup_create_mkstream(STREAM, GROUP, "0").await;

		match created {
			Ok(_) => {}
			Err(err) if err.to_string().contains("BUSYGROUP") => {}
			Err(err) => return Err(backend(err)),
		}
		self.group_ready.store(true, Ordering::Relaxed);
		Ok(())
	}

	async fn promote_due(&self) -> Result<(), QueueError> {
		let mut conn = self.conn.clone();
		let _promoted: i64 = Script::new(PROMOTE_SCRIPT)
			.key(DELAYED)
			.key(STREAM)
			.arg(Utc::now().timestamp_millis())
			.invoke_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(())
	}

	/// Take over one entry abandoned by a dead consumer, if any is past
	/// the claim timeout. Runs at most every half claim-timeout.
	async fn claim_abandoned(&self) -> Result<Option<Task>, QueueError> {
		{
			let mut last = self.last_claim.lock().unwrap();
			let now = Instant::now();
			if last.is_some_and(|t| now.duration_since(t) < CLAIM_TIMEOUT / 2) {
				return Ok(None);
			}
			*last = Some(now);
		}

		let mut conn = self.conn.clone();
		let reply: StreamAutoClaimReply = conn
			.xautoclaim_options(
				STREAM,
				GROUP,
				&self.consumer,
				CLAIM_TIMEOUT.as_millis() as usize,
				"0-0",
				StreamAutoClaimOptions::default().count(1),
			)
			.await
			.map_err(backend)?;

		for entry in reply.claimed {
			if let Some(task) = self.deliver(&entry).await? {
				tracing::info!(task_id = %task.id, "claimed abandoned task");
				return Ok(Some(task));
			}
		}
		Ok(None)
	}

	/// Load and transition the task behind a stream entry. Returns
	/// `None` (and drops the entry) when the payload is gone or already
	/// terminal.
	async fn deliver(&self, entry: &StreamId) -> Result<Option<Task>, QueueError> {
		let Some(id_value) = entry.map.get("id") else {
			self.drop_entry(&entry.id).await?;
			return Ok(None);
		};
		let id: String = ::redis::from_redis_value(id_value).map_err(backend)?;

		let mut conn = self.conn.clone();
		let key = format!("{TASK_PREFIX}{id}");
		let raw: Option<String> = conn.get(&key).await.map_err(backend)?;

		let Some(raw) = raw else {
			// Cancelled or purged while queued.
			self.drop_entry(&entry.id).await?;
			return Ok(None);
		};

		let mut task: Task = serde_json::from_str(&raw).map_err(|e| QueueError::Codec(e.to_string()))?;
		if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
			self.drop_entry(&entry.id).await?;
			return Ok(None);
		}

		task.status = TaskStatus::Processing;
		task.attempts += 1;
		task.started_at = Some(Utc::now());
		task.updated_at = Utc::now();

		let json = serde_json::to_string(&task).map_err(|e| QueueError::Codec(e.to_string()))?;
		let _: () = conn.set(&key, json).await.map_err(backend)?;

		self.inflight.lock().unwrap().insert(task.id, entry.id.clone());
		Ok(Some(task))
	}

	async fn drop_entry(&self, entry_id: &str) -> Result<(), QueueError> {
		let mut conn = self.conn.clone();
		::redis::pipe()
			.atomic()
			.xack(STREAM, GROUP, &[entry_id])
			.ignore()
			.xdel(STREAM, &[entry_id])
			.ignore()
			.query_async::<()>(&mut conn)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn read_one(&self, block: Option<Duration>) -> Result<Option<Task>, QueueError> {
		let mut conn = self.conn.clone();
		let mut opts = StreamReadOptions::default().group(GROUP, &self.consumer).count(1);
		if let Some(block) = block {
			// Short blocks only: the multiplexed connection is shared.
			opts = opts.block(block.as_millis().clamp(1, 1000) as usize);
		}

		let reply: StreamReadReply = conn
			.xread_options(&[STREAM], &[">"], &opts)
			.await
			.map_err(backend)?;

		for key in reply.keys {
			for entry in key.ids {
				if let Some(task) = self.deliver(&entry).await? {
					return Ok(Some(task));
				}
			}
		}
		Ok(None)
	}

	/// Update a task's stored record and settle its stream entry.
	async fn settle(&self, task: &Task, redeliver_at: Option<i64>) -> Result<(), QueueError> {
		let json = serde_json::to_string(task).map_err(|e| QueueError::Codec(e.to_string()))?;
		let entry = self.inflight.lock().unwrap().remove(&task.id);

		let mut conn = self.conn.clone();
		let mut pipe = ::redis::pipe();
		pipe.atomic().set(Self::task_key(task.id), json).ignore();
		if let Some(due_ms) = redeliver_at {
			pipe.zadd(DELAYED, task.id.to_string(), due_ms).ignore();
		}
		if let Some(entry_id) = &entry {
			pipe.xack(STREAM, GROUP, &[entry_id]).ignore();
			pipe.xdel(STREAM, &[entry_id]).ignore();
		}
		pipe.query_async::<()>(&mut conn).await.map_err(backend)?;
		Ok(())
	}

	async fn load(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
		let mut conn = self.conn.clone();
		let raw: Option<String> = conn.get(Self::task_key(id)).await.map_err(backend)?;
		raw.map(|r| serde_json::from_str(&r).map_err(|e| QueueError::Codec(e.to_string())))
			.transpose()
	}

	async fn scan_tasks(&self) -> Result<Vec<Task>, QueueError> {
		let mut conn = self.conn.clone();
		let mut tasks = Vec::new();
		let mut cursor: u64 = 0;

		loop {
			let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
				.arg(cursor)
				.arg("MATCH")
				.arg(format!("{TASK_PREFIX}*"))
				.arg("COUNT")
				.arg(100)
				.query_async(&mut conn)
				.await
				.map_err(backend)?;

			for key in keys {
				let raw: Option<String> = conn.get(&key).await.map_err(backend)?;
				if let Some(raw) = raw
					&& let Ok(task) = serde_json::from_str::<Task>(&raw)
				{
					tasks.push(task);
				}
			}

			cursor = next;
			if cursor == 0 {
				break;
			}
		}

		Ok(tasks)
	}
}

fn backend(err: ::redis::RedisError) -> QueueError {
	QueueError::Backend(err.to_string())
}

impl std::fmt::Debug for RedisStreamQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisStreamQueue")
			.field("consumer", &self.consumer)
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl TaskQueue for RedisStreamQueue {
	async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
		self.enqueue_batch(vec![task]).await
	}

	async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(QueueError::Closed);
		}

		let now = Utc::now();
		let mut pipe = ::redis::pipe();
		pipe.atomic();

		for task in &tasks {
			let json = serde_json::to_string(task).map_err(|e| QueueError::Codec(e.to_string()))?;
			pipe.set(Self::task_key(task.id), json).ignore();
			if task.scheduled_for <= now {
				pipe.cmd("XADD")
					.arg(STREAM)
					.arg("*")
					.arg("id")
					.arg(task.id.to_string())
					.ignore();
			} else {
				pipe.zadd(DELAYED, task.id.to_string(), task.scheduled_for.timestamp_millis())
					.ignore();
			}
		}

		let mut conn = self.conn.clone();
		pipe.query_async::<()>(&mut conn).await.map_err(backend)
	}

	async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
		if self.closed.load(Ordering::Relaxed) {
			return Ok(None);
		}

		self.ensure_group().await?;
		self.promote_due().await?;

		if let Some(task) = self.claim_abandoned().await? {
			return Ok(Some(task));
		}
		self.read_one(None).await
	}

	async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
		let deadline = Instant::now() + timeout;

		loop {
			if self.closed.load(Ordering::Relaxed) {
				return Ok(None);
			}

			let attempt = async {
				self.ensure_group().await?;
				self.promote_due().await?;
				if let Some(task) = self.claim_abandoned().await? {
					return Ok(Some(task));
				}
				let remaining = deadline.saturating_duration_since(Instant::now());
				self.read_one(Some(remaining)).await
			};

			match attempt.await {
				Ok(Some(task)) => return Ok(Some(task)),
				Ok(None) => {
					if Instant::now() >= deadline {
						return Ok(None);
					}
				}
				Err(err) => {
					tracing::warn!(error = %err, "dequeue transport error");
					if Instant::now() + TRANSPORT_BACKOFF >= deadline {
						return Ok(None);
					}
					tokio::time::sleep(TRANSPORT_BACKOFF).await;
				}
			}
		}
	}

	async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
		let mut task = self.load(id).await?.ok_or(QueueError::NotFound)?;
		task.status = TaskStatus::Completed;
		task.completed_at = Some(Utc::now());
		task.updated_at = Utc::now();
		self.settle(&task, None).await
	}

	async fn nack(&self, id: TaskId, reason: &str) -> Result<(), QueueError> {
		let mut task = self.load(id).await?.ok_or(QueueError::NotFound)?;
		task.last_error = Some(reason.to_string());
		task.updated_at = Utc::now();

		if task.attempts < task.max_attempts {
			let backoff = retry_backoff(task.attempts);
			task.status = TaskStatus::Pending;
			task.scheduled_for =
				Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(300));
			let due_ms = task.scheduled_for.timestamp_millis();
			self.settle(&task, Some(due_ms)).await
		} else {
			task.status = TaskStatus::Failed;
			task.completed_at = Some(Utc::now());
			self.settle(&task, None).await
		}
	}

	async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
		self.load(id).await
	}

	async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError> {
		let mut tasks: Vec<Task> = self
			.scan_tasks()
			.await?
			.into_iter()
			.filter(|t| filter.status.is_none_or(|s| t.status == s))
			.filter(|t| filter.task_type.as_deref().is_none_or(|ty| t.task_type == ty))
			.collect();

		tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
		if let Some(limit) = filter.limit {
			tasks.truncate(limit);
		}
		Ok(tasks)
	}

	async fn cancel(&self, id: TaskId) -> Result<(), QueueError> {
		let task = self.load(id).await?.ok_or(QueueError::NotFound)?;
		if task.status != TaskStatus::Pending {
			return Err(QueueError::InvalidState(format!(
				"cannot cancel {} task",
				task.status.as_str()
			)));
		}

		// The payload is the source of truth: a lingering stream entry
		// is dropped at delivery time once the payload is gone.
		let mut conn = self.conn.clone();
		::redis::pipe()
			.atomic()
			.del(Self::task_key(id))
			.ignore()
			.zrem(DELAYED, id.to_string())
			.ignore()
			.query_async::<()>(&mut conn)
			.await
			.map_err(backend)
	}

	async fn purge(&self, older_than: Duration) -> Result<u64, QueueError> {
		let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
		let mut purged = 0u64;
		let mut conn = self.conn.clone();

		for task in self.scan_tasks().await? {
			if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
				&& task.updated_at < cutoff
			{
				let _: () = conn.del(Self::task_key(task.id)).await.map_err(backend)?;
				purged += 1;
			}
		}
		Ok(purged)
	}

	async fn stats(&self) -> Result<QueueStats, QueueError> {
		let mut stats = QueueStats::default();
		let mut oldest_pending = None;
		let now = Utc::now();

		for task in self.scan_tasks().await? {
			match task.status {
				TaskStatus::Pending => {
					stats.pending += 1;
					let age = (now - task.created_at).num_seconds().max(0) as u64;
					oldest_pending = Some(oldest_pending.map_or(age, |o: u64| o.max(age)));
				}
				TaskStatus::Processing => stats.processing += 1,
				TaskStatus::Completed => stats.completed += 1,
				TaskStatus::Failed => stats.failed += 1,
			}
		}

		stats.oldest_pending_age_secs = oldest_pending;
		Ok(stats)
	}

	async fn ping(&self) -> Result<(), QueueError> {
		let mut conn = self.conn.clone();
		::redis::cmd("PING").query_async::<()>(&mut conn).await.map_err(backend)
	}

	async fn close(&self) -> Result<(), QueueError> {
		self.closed.store(true, Ordering::Relaxed);
		Ok(())
	}
}
