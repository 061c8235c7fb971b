//! Postgres queue backend.
//!
//! Claiming relies on `FOR UPDATE SKIP LOCKED`: concurrent consumers
//! each select-and-lock a different eligible row, so a task is handed
//! to exactly one of them. The partial index on
//! `(status, scheduled_for, priority DESC, created_at)` keeps the claim
//! query on the eligible subset.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sercha_types::{Task, TaskFilter, TaskId, TaskStatus};
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::{QueueError, QueueStats, TRANSPORT_BACKOFF, TaskQueue};

const CLAIM_SQL: &str = "\
SELECT id FROM tasks \
WHERE status = 'pending' AND scheduled_for <= now() \
ORDER BY priority DESC, created_at ASC \
LIMIT 1 \
FOR UPDATE SKIP LOCKED";

const MARK_PROCESSING_SQL: &str = "\
UPDATE tasks SET status = 'processing', attempts = attempts + 1, \
	started_at = now(), updated_at = now() \
WHERE id = $1 \
RETURNING id, task_type, tenant_id, payload, status, priority, attempts, \
	max_attempts, last_error, created_at, updated_at, started_at, \
	completed_at, scheduled_for";

const NACK_SQL: &str = "\
UPDATE tasks SET \
	last_error = $2, \
	updated_at = now(), \
	status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END, \
	scheduled_for = CASE WHEN attempts < max_attempts \
		THEN now() + make_interval(secs => LEAST(POWER(2, attempts), 300)) \
		ELSE scheduled_for END, \
	completed_at = CASE WHEN attempts < max_attempts THEN completed_at ELSE now() END \
WHERE id = $1 AND status = 'processing'";

#[derive(FromRow)]
struct TaskRow {
	id: Uuid,
	task_type: String,
	tenant_id: String,
	payload: serde_json::Value,
	status: String,
	priority: i32,
	attempts: i32,
	max_attempts: i32,
	last_error: Option<String>,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
	started_at: Option<DateTime<Utc>>,
	completed_at: Option<DateTime<Utc>>,
	scheduled_for: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
	type Error = QueueError;

	fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
		let status = TaskStatus::parse(&row.status)
			.ok_or_else(|| QueueError::Codec(format!("unknown task status {:?}", row.status)))?;
		Ok(Task {
			id: TaskId(row.id),
			task_type: row.task_type,
			tenant_id: row.tenant_id,
			payload: row.payload,
			status,
			priority: row.priority,
			attempts: row.attempts,
			max_attempts: row.max_attempts,
			last_error: row.last_error,
			created_at: row.created_at,
			updated_at: row.updated_at,
			started_at: row.started_at,
			completed_at: row.completed_at,
			scheduled_for: row.scheduled_for,
		})
	}
}

/// Durable queue over the metadata database.
#[derive(Debug, Clone)]
pub struct PostgresQueue {
	pool: PgPool,
}

impl PostgresQueue {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	async fn insert(tx: &mut sqlx::PgTransaction<'_>, task: &Task) -> Result<(), QueueError> {
		sqlx::query(
			"INSERT INTO tasks (id, task_type, tenant_id, payload, status, priority, \
				attempts, max_attempts, last_error, created_at, updated_at, \
				started_at, completed_at, scheduled_for) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
		)
		.bind(task.id.0)
		.bind(&task.task_type)
		.bind(&task.tenant_id)
		.bind(&task.payload)
		.bind(task.status.as_str())
		.bind(task.priority)
		.bind(task.attempts)
		.bind(task.max_attempts)
		.bind(&task.last_error)
		.bind(task.created_at)
		.bind(task.updated_at)
		.bind(task.started_at)
		.bind(task.completed_at)
		.bind(task.scheduled_for)
		.execute(&mut **tx)
		.await
		.map_err(backend)?;

		Ok(())
	}
}

fn backend(err: sqlx::Error) -> QueueError {
	QueueError::Backend(err.to_string())
}

#[async_trait]
impl TaskQueue for PostgresQueue {
	async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
		self.enqueue_batch(vec![task]).await
	}

	async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
		let mut tx = self.pool.begin().await.map_err(backend)?;
		for task in &tasks {
			Self::insert(&mut tx, task).await?;
		}
		tx.commit().await.map_err(backend)
	}

	async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
		let mut tx = self.pool.begin().await.map_err(backend)?;

		let claimed: Option<(Uuid,)> = sqlx::query_as(CLAIM_SQL)
			.fetch_optional(&mut *tx)
			.await
			.map_err(backend)?;

		let Some((id,)) = claimed else {
			return Ok(None);
		};

		let row: TaskRow = sqlx::query_as(MARK_PROCESSING_SQL)
			.bind(id)
			.fetch_one(&mut *tx)
			.await
			.map_err(backend)?;

		tx.commit().await.map_err(backend)?;
		Ok(Some(row.try_into()?))
	}

	async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
		let deadline = tokio::time::Instant::now() + timeout;
		// Row-store queues poll; the interval trades latency for load.
		let poll = Duration::from_millis(250);

		loop {
			match self.dequeue().await {
				Ok(Some(task)) => return Ok(Some(task)),
				Ok(None) => {
					if tokio::time::Instant::now() + poll > deadline {
						return Ok(None);
					}
					tokio::time::sleep(poll).await;
				}
				Err(err) => {
					tracing::warn!(error = %err, "dequeue transport error");
					if tokio::time::Instant::now() + TRANSPORT_BACKOFF > deadline {
						return Ok(None);
					}
					tokio::time::sleep(TRANSPORT_BACKOFF).await;
				}
			}
		}
	}

	async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
		let result = sqlx::query(
			"UPDATE tasks SET status = 'completed', completed_at = now(), updated_at = now() \
			WHERE id = $1 AND status = 'processing'",
		)
		.bind(id.0)
		.execute(&self.pool)
		.await
		.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(QueueError::NotFound);
		}
		Ok(())
	}

	async fn nack(&self, id: TaskId, reason: &str) -> Result<(), QueueError> {
		let result = sqlx::query(NACK_SQL)
			.bind(id.0)
			.bind(reason)
			.execute(&self.pool)
			.await
			.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(QueueError::NotFound);
		}
		Ok(())
	}

	async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
		let row: Option<TaskRow> = sqlx::query_as(
			"SELECT id, task_type, tenant_id, payload, status, priority, attempts, \
				max_attempts, last_error, created_at, updated_at, started_at, \
				completed_at, scheduled_for \
			FROM tasks WHERE id = $1",
		)
		.bind(id.0)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;

		row.map(Task::try_from).transpose()
	}

	async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError> {
		let mut builder = QueryBuilder::new(
			"SELECT id, task_type, tenant_id, payload, status, priority, attempts, \
				max_attempts, last_error, created_at, updated_at, started_at, \
				completed_at, scheduled_for \
			FROM tasks WHERE true",
		);

		if let Some(status) = filter.status {
			builder.push(" AND status = ").push_bind(status.as_str());
		}
		if let Some(task_type) = &filter.task_type {
			builder.push(" AND task_type = ").push_bind(task_type.clone());
		}
		builder.push(" ORDER BY created_at DESC");
		builder
			.push(" LIMIT ")
			.push_bind(filter.limit.unwrap_or(100) as i64);

		let rows: Vec<TaskRow> = builder
			.build_query_as()
			.fetch_all(&self.pool)
			.await
			.map_err(backend)?;

		rows.into_iter().map(Task::try_from).collect()
	}

	async fn cancel(&self, id: TaskId) -> Result<(), QueueError> {
		let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND status = 'pending'")
			.bind(id.0)
			.execute(&self.pool)
			.await
			.map_err(backend)?;

		if result.rows_affected() == 0 {
			let status: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = $1")
				.bind(id.0)
				.fetch_optional(&self.pool)
				.await
				.map_err(backend)?;

			return match status {
				None => Err(QueueError::NotFound),
				Some((s,)) => Err(QueueError::InvalidState(format!("cannot cancel {s} task"))),
			};
		}
		Ok(())
	}

	async fn purge(&self, older_than: Duration) -> Result<u64, QueueError> {
		let result = sqlx::query(
			"DELETE FROM tasks \
			WHERE status IN ('completed', 'failed') \
				AND updated_at < now() - make_interval(secs => $1)",
		)
		.bind(older_than.as_secs_f64())
		.execute(&self.pool)
		.await
		.map_err(backend)?;

		Ok(result.rows_affected())
	}

	async fn stats(&self) -> Result<QueueStats, QueueError> {
		let row = sqlx::query(
			"SELECT \
				count(*) FILTER (WHERE status = 'pending') AS pending, \
				count(*) FILTER (WHERE status = 'processing') AS processing, \
				count(*) FILTER (WHERE status = 'completed') AS completed, \
				count(*) FILTER (WHERE status = 'failed') AS failed, \
				EXTRACT(EPOCH FROM now() - min(created_at) FILTER (WHERE status = 'pending'))::float8 AS oldest \
			FROM tasks",
		)
		.fetch_one(&self.pool)
		.await
		.map_err(backend)?;

		let oldest: Option<f64> = row.try_get("oldest").map_err(backend)?;
		Ok(QueueStats {
			pending: row.try_get::<i64, _>("pending").map_err(backend)? as u64,
			processing: row.try_get::<i64, _>("processing").map_err(backend)? as u64,
			completed: row.try_get::<i64, _>("completed").map_err(backend)? as u64,
			failed: row.try_get::<i64, _>("failed").map_err(backend)? as u64,
			oldest_pending_age_secs: oldest.map(|s| s.max(0.0) as u64),
		})
	}

	async fn ping(&self) -> Result<(), QueueError> {
		sqlx::query("SELECT 1")
			.execute(&self.pool)
			.await
			.map(|_| ())
			.map_err(backend)
	}

	async fn close(&self) -> Result<(), QueueError> {
		// The pool is shared with the metadata store; its lifecycle is
		// owned by the process, not the queue.
		Ok(())
	}
}
