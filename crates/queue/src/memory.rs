//! In-process queue backend for single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sercha_types::{Task, TaskFilter, TaskId, TaskStatus};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{QueueError, QueueStats, TaskQueue, retry_backoff};

struct Entry {
	task: Task,
	/// Monotonic eligibility instant; lets delayed tasks fire under the
	/// runtime clock rather than the wall clock.
	eligible_at: Instant,
	/// Insertion tiebreaker for equal priority and creation time.
	seq: u64,
}

/// A queue living entirely in process memory.
///
/// Semantically equivalent to the durable backends minus durability;
/// used by the worker/scheduler tests and single-process deployments.
#[derive(Default)]
pub struct MemoryQueue {
	entries: Mutex<HashMap<TaskId, Entry>>,
	notify: Notify,
	seq: AtomicU64,
	closed: AtomicBool,
}

impl MemoryQueue {
	pub fn new() -> Self {
		Self::default()
	}

	fn insert(&self, entries: &mut HashMap<TaskId, Entry>, task: Task) {
		let delay = (task.scheduled_for - Utc::now()).to_std().unwrap_or(Duration::ZERO);
		entries.insert(
			task.id,
			Entry {
				task,
				eligible_at: Instant::now() + delay,
				seq: self.seq.fetch_add(1, Ordering::Relaxed),
			},
		);
	}

	fn try_claim(&self) -> Option<Task> {
		let mut entries = self.entries.lock().unwrap();
		let now = Instant::now();

		let id = entries
			.values()
			.filter(|e| e.task.status == TaskStatus::Pending && e.eligible_at <= now)
			.min_by(|a, b| {
				b.task
					.priority
					.cmp(&a.task.priority)
					.then(a.task.created_at.cmp(&b.task.created_at))
					.then(a.seq.cmp(&b.seq))
			})
			.map(|e| e.task.id)?;

		let entry = entries.get_mut(&id).unwrap_or_else(|| unreachable!("claimed id exists"));
		entry.task.status = TaskStatus::Processing;
		entry.task.attempts += 1;
		entry.task.started_at = Some(Utc::now());
		entry.task.updated_at = Utc::now();
		Some(entry.task.clone())
	}

	/// Earliest instant a delayed pending task becomes eligible.
	fn next_eligible_at(&self) -> Option<Instant> {
		let entries = self.entries.lock().unwrap();
		entries
			.values()
			.filter(|e| e.task.status == TaskStatus::Pending)
			.map(|e| e.eligible_at)
			.min()
	}
}

#[async_trait]
impl TaskQueue for MemoryQueue {
	async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(QueueError::Closed);
		}
		let mut entries = self.entries.lock().unwrap();
		self.insert(&mut entries, task);
		drop(entries);
		self.notify.notify_waiters();
		Ok(())
	}

	async fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(QueueError::Closed);
		}
		let mut entries = self.entries.lock().unwrap();
		for task in tasks {
			self.insert(&mut entries, task);
		}
		drop(entries);
		self.notify.notify_waiters();
		Ok(())
	}

	async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
		if self.closed.load(Ordering::Relaxed) {
			return Ok(None);
		}
		Ok(self.try_claim())
	}

	async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
		let deadline = Instant::now() + timeout;

		loop {
			if self.closed.load(Ordering::Relaxed) {
				return Ok(None);
			}
			if let Some(task) = self.try_claim() {
				return Ok(Some(task));
			}

			let now = Instant::now();
			if now >= deadline {
				return Ok(None);
			}

			// Wake on enqueue, on the next delayed task coming due, or at
			// the caller's deadline, whichever is first.
			let wake_at = self.next_eligible_at().map_or(deadline, |t| t.min(deadline));
			let notified = self.notify.notified();
			tokio::select! {
				_ = notified => {}
				_ = tokio::time::sleep_until(wake_at) => {}
			}
		}
	}

	async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
		let mut entries = self.entries.lock().unwrap();
		let entry = entries.get_mut(&id).ok_or(QueueError::NotFound)?;

		entry.task.status = TaskStatus::Completed;
		entry.task.completed_at = Some(Utc::now());
		entry.task.updated_at = Utc::now();
		Ok(())
	}

	async fn nack(&self, id: TaskId, reason: &str) -> Result<(), QueueError> {
		let mut entries = self.entries.lock().unwrap();
		let entry = entries.get_mut(&id).ok_or(QueueError::NotFound)?;

		entry.task.last_error = Some(reason.to_string());
		entry.task.updated_at = Utc::now();

		if entry.task.attempts < entry.task.max_attempts {
			let backoff = retry_backoff(entry.task.attempts);
			entry.task.status = TaskStatus::Pending;
			entry.task.scheduled_for = Utc::now()
				+ chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(300));
			entry.eligible_at = Instant::now() + backoff;
		} else {
			entry.task.status = TaskStatus::Failed;
			entry.task.completed_at = Some(Utc::now());
		}

		drop(entries);
		self.notify.notify_waiters();
		Ok(())
	}

	async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
		Ok(self.entries.lock().unwrap().get(&id).map(|e| e.task.clone()))
	}

	async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError> {
		let entries = self.entries.lock().unwrap();
		let mut tasks: Vec<Task> = entries
			.values()
			.filter(|e| filter.status.is_none_or(|s| e.task.status == s))
			.filter(|e| {
				filter
					.task_type
					.as_deref()
					.is_none_or(|t| e.task.task_type == t)
			})
			.map(|e| e.task.clone())
			.collect();

		tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
		if let Some(limit) = filter.limit {
			tasks.truncate(limit);
		}
		Ok(tasks)
	}

	async fn cancel(&self, id: TaskId) -> Result<(), QueueError> {
		let mut entries = self.entries.lock().unwrap();
		match entries.get(&id) {
			None => Err(QueueError::NotFound),
			Some(e) if e.task.status == TaskStatus::Pending => {
				entries.remove(&id);
				Ok(())
			}
			Some(e) => Err(QueueError::InvalidState(format!(
				"cannot cancel {} task",
				e.task.status.as_str()
			))),
		}
	}

	async fn purge(&self, older_than: Duration) -> Result<u64, QueueError> {
		let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
		let mut entries = self.entries.lock().unwrap();
		let before = entries.len();

		entries.retain(|_, e| {
			!(matches!(e.task.status, TaskStatus::Completed | TaskStatus::Failed)
				&& e.task.updated_at < cutoff)
		});

		Ok((before - entries.len()) as u64)
	}

	async fn stats(&self) -> Result<QueueStats, QueueError> {
		let entries = self.entries.lock().unwrap();
		let mut stats = QueueStats::default();
		let mut oldest_pending = None;

		for e in entries.values() {
			match e.task.status {
				TaskStatus::Pending => {
					stats.pending += 1;
					let age = (Utc::now() - e.task.created_at).num_seconds().max(0) as u64;
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
		Ok(())
	}

	async fn close(&self) -> Result<(), QueueError> {
		self.closed.store(true, Ordering::Relaxed);
		self.notify.notify_waiters();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use sercha_types::TASK_SYNC_ALL;

	use super::*;

	fn task() -> Task {
		Task::new(TASK_SYNC_ALL, serde_json::json!({}))
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn dequeue_orders_by_priority_then_age() {
		let queue = MemoryQueue::new();

		let low = task();
		let high = task().with_priority(5);
		let low2 = task();

		queue.enqueue(low.clone()).await.unwrap();
		queue.enqueue(high.clone()).await.unwrap();
		queue.enqueue(low2.clone()).await.unwrap();

		assert_eq!(queue.dequeue().await.unwrap().unwrap().id, high.id);
		assert_eq!(queue.dequeue().await.unwrap().unwrap().id, low.id);
		assert_eq!(queue.dequeue().await.unwrap().unwrap().id, low2.id);
		assert!(queue.dequeue().await.unwrap().is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn dequeue_increments_attempts_and_marks_processing() {
		let queue = MemoryQueue::new();
		queue.enqueue(task()).await.unwrap();

		let claimed = queue.dequeue().await.unwrap().unwrap();
		assert_eq!(claimed.status, TaskStatus::Processing);
		assert_eq!(claimed.attempts, 1);
		assert!(claimed.started_at.is_some());

		// Processing tasks are not handed out again.
		assert!(queue.dequeue().await.unwrap().is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn nack_retries_with_exponential_backoff_then_fails() {
		let queue = MemoryQueue::new();
		let t = task().with_max_attempts(3);
		let id = t.id;
		queue.enqueue(t).await.unwrap();

		// Attempt 1.
		let claimed = queue.dequeue().await.unwrap().unwrap();
		assert_eq!(claimed.attempts, 1);
		queue.nack(id, "boom").await.unwrap();

		// Not yet eligible; becomes eligible after ~2s.
		assert!(queue.dequeue().await.unwrap().is_none());
		tokio::time::advance(Duration::from_millis(2100)).await;
		let claimed = queue.dequeue().await.unwrap().unwrap();
		assert_eq!(claimed.attempts, 2);
		queue.nack(id, "boom").await.unwrap();

		// Attempt 3 after ~4s.
		tokio::time::advance(Duration::from_millis(4100)).await;
		let claimed = queue.dequeue().await.unwrap().unwrap();
		assert_eq!(claimed.attempts, 3);
		queue.nack(id, "boom").await.unwrap();

		// Budget spent: failed, never re-delivered.
		let stored = queue.get(id).await.unwrap().unwrap();
		assert_eq!(stored.status, TaskStatus::Failed);
		assert_eq!(stored.last_error.as_deref(), Some("boom"));

		tokio::time::advance(Duration::from_secs(600)).await;
		assert!(queue.dequeue().await.unwrap().is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn dequeue_with_timeout_waits_for_enqueue() {
		let queue = std::sync::Arc::new(MemoryQueue::new());

		let consumer = {
			let queue = queue.clone();
			tokio::spawn(async move { queue.dequeue_with_timeout(Duration::from_secs(5)).await })
		};
		tokio::task::yield_now().await;

		tokio::time::advance(Duration::from_secs(1)).await;
		queue.enqueue(task()).await.unwrap();

		let got = consumer.await.unwrap().unwrap();
		assert!(got.is_some());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn dequeue_with_timeout_returns_none_on_deadline() {
		let queue = MemoryQueue::new();
		let got = queue.dequeue_with_timeout(Duration::from_secs(2)).await.unwrap();
		assert!(got.is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn dequeue_with_timeout_picks_up_due_delayed_task() {
		let queue = MemoryQueue::new();
		let delayed = task().scheduled_at(Utc::now() + chrono::Duration::seconds(3));
		queue.enqueue(delayed).await.unwrap();

		assert!(queue.dequeue().await.unwrap().is_none());

		let got = queue.dequeue_with_timeout(Duration::from_secs(10)).await.unwrap();
		assert!(got.is_some());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn cancel_only_touches_pending_tasks() {
		let queue = MemoryQueue::new();
		let t = task();
		let id = t.id;
		queue.enqueue(t).await.unwrap();

		queue.dequeue().await.unwrap().unwrap();
		assert!(matches!(
			queue.cancel(id).await,
			Err(QueueError::InvalidState(_))
		));

		let t2 = task();
		let id2 = t2.id;
		queue.enqueue(t2).await.unwrap();
		queue.cancel(id2).await.unwrap();
		assert!(queue.get(id2).await.unwrap().is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn purge_removes_only_old_terminal_tasks() {
		let queue = MemoryQueue::new();

		let done = task();
		let done_id = done.id;
		queue.enqueue(done).await.unwrap();
		queue.dequeue().await.unwrap();
		queue.ack(done_id).await.unwrap();

		let live = task();
		queue.enqueue(live).await.unwrap();

		// Nothing old enough yet.
		assert_eq!(queue.purge(Duration::from_secs(3600)).await.unwrap(), 0);
		// Zero-age cutoff sweeps the completed task but not the pending one.
		assert_eq!(queue.purge(Duration::ZERO).await.unwrap(), 1);
		assert!(queue.get(done_id).await.unwrap().is_none());

		let stats = queue.stats().await.unwrap();
		assert_eq!(stats.pending, 1);
		assert_eq!(stats.completed, 0);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn stats_count_by_status() {
		let queue = MemoryQueue::new();

		queue.enqueue(task()).await.unwrap();
		queue.enqueue(task()).await.unwrap();
		let processing = queue.dequeue().await.unwrap().unwrap();
		queue.ack(processing.id).await.unwrap();
		queue.dequeue().await.unwrap().unwrap();

		let stats = queue.stats().await.unwrap();
		assert_eq!(stats.pending, 0);
		assert_eq!(stats.processing, 1);
		assert_eq!(stats.completed, 1);
		assert_eq!(stats.failed, 0);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn close_wakes_blocked_consumers() {
		let queue = std::sync::Arc::new(MemoryQueue::new());

		let consumer = {
			let queue = queue.clone();
			tokio::spawn(async move { queue.dequeue_with_timeout(Duration::from_secs(60)).await })
		};
		tokio::task::yield_now().await;

		queue.close().await.unwrap();
		let got = consumer.await.unwrap().unwrap();
		assert!(got.is_none());

		assert!(matches!(queue.enqueue(task()).await, Err(QueueError::Closed)));
	}
}
