//! Durable task and schedule records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{SourceId, TaskId};

/// Task type tag for syncing a single source.
pub const TASK_SYNC_SOURCE: &str = "sync_source";
/// Task type tag for syncing every enabled source.
pub const TASK_SYNC_ALL: &str = "sync_all";

/// The single logical tenant used throughout the core.
pub const DEFAULT_TENANT: &str = "default";

/// Default retry budget for a task.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
	Pending,
	Processing,
	Completed,
	Failed,
}

impl TaskStatus {
	/// Storage representation, also used in list filters.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Processing => "processing",
			Self::Completed => "completed",
			Self::Failed => "failed",
		}
	}

	/// Parse the storage representation.
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(Self::Pending),
			"processing" => Some(Self::Processing),
			"completed" => Some(Self::Completed),
			"failed" => Some(Self::Failed),
			_ => None,
		}
	}
}

/// A durable unit of work.
///
/// Tasks are owned by the queue; at any instant at most one worker holds
/// a task in [`TaskStatus::Processing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	pub id: TaskId,
	/// Dispatch tag, e.g. [`TASK_SYNC_SOURCE`].
	pub task_type: String,
	pub tenant_id: String,
	/// Opaque JSON payload; unknown keys are preserved.
	pub payload: serde_json::Value,
	pub status: TaskStatus,
	/// Higher first.
	pub priority: i32,
	/// Incremented on each dequeue.
	pub attempts: i32,
	pub max_attempts: i32,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
	/// Tasks are eligible for dequeue once this instant has passed.
	pub scheduled_for: DateTime<Utc>,
}

impl Task {
	/// Create a pending task scheduled for immediate execution.
	pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
		let now = Utc::now();
		Self {
			id: TaskId(Uuid::new_v4()),
			task_type: task_type.into(),
			tenant_id: DEFAULT_TENANT.to_string(),
			payload,
			status: TaskStatus::Pending,
			priority: 0,
			attempts: 0,
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			last_error: None,
			created_at: now,
			updated_at: now,
			started_at: None,
			completed_at: None,
			scheduled_for: now,
		}
	}

	/// Set the priority (higher dequeues first).
	#[must_use]
	pub fn with_priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	/// Override the retry budget.
	#[must_use]
	pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
		self.max_attempts = max_attempts;
		self
	}

	/// Delay the task until `at`.
	#[must_use]
	pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
		self.scheduled_for = at;
		self
	}
}

/// Payload of a [`TASK_SYNC_SOURCE`] task.
///
/// Extra keys survive a decode/encode round trip so ad-hoc triggers can
/// attach context the core does not interpret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSourcePayload {
	pub source_id: SourceId,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SyncSourcePayload {
	pub fn new(source_id: SourceId) -> Self {
		Self {
			source_id,
			extra: serde_json::Map::new(),
		}
	}
}

/// Filter for queue listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
	pub status: Option<TaskStatus>,
	pub task_type: Option<String>,
	pub limit: Option<usize>,
}

/// Configuration for a recurring job emitted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
	pub id: TaskId,
	pub name: String,
	/// Task type tag enqueued on every due tick.
	pub task_type: String,
	pub tenant_id: String,
	/// Interval between runs, in seconds.
	pub interval_secs: i64,
	pub enabled: bool,
	pub next_run: DateTime<Utc>,
	pub last_run: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	/// Copied verbatim into each enqueued task.
	pub payload: serde_json::Value,
}

impl ScheduledTask {
	/// Create an enabled schedule that first fires immediately.
	pub fn new(name: impl Into<String>, task_type: impl Into<String>, interval_secs: i64) -> Self {
		Self {
			id: TaskId(Uuid::new_v4()),
			name: name.into(),
			task_type: task_type.into(),
			tenant_id: DEFAULT_TENANT.to_string(),
			interval_secs,
			enabled: true,
			next_run: Utc::now(),
			last_run: None,
			last_error: None,
			payload: serde_json::Value::Object(serde_json::Map::new()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_round_trips() {
		for status in [
			TaskStatus::Pending,
			TaskStatus::Processing,
			TaskStatus::Completed,
			TaskStatus::Failed,
		] {
			assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
		}
		assert_eq!(TaskStatus::parse("cancelled"), None);
	}

	#[test]
	fn sync_source_payload_preserves_unknown_keys() {
		let json = serde_json::json!({
			"source_id": "4f5cde31-7db2-45ce-8f42-00a9f4f702b5",
			"requested_by": "admin",
		});

		let payload: SyncSourcePayload = serde_json::from_value(json).unwrap();
		let back = serde_json::to_value(&payload).unwrap();

		assert_eq!(back.get("requested_by").and_then(|v| v.as_str()), Some("admin"));
	}

	#[test]
	fn new_task_is_immediately_eligible() {
		let task = Task::new(TASK_SYNC_ALL, serde_json::json!({}));
		assert_eq!(task.status, TaskStatus::Pending);
		assert!(task.scheduled_for <= Utc::now());
		assert_eq!(task.attempts, 0);
	}
}
