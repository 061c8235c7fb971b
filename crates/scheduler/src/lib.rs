//! Recurring-task scheduler.
//!
//! Every tick, one instance across the deployment loads the enabled
//! schedules whose `next_run` has passed, enqueues a task per schedule,
//! and pushes `next_run` forward by the schedule's interval. Ticks are
//! serialized across instances by the global `scheduler` lock; a
//! crashed holder frees it when the lock TTL elapses. Single-instance
//! deployments may run unguarded with `lock_required = false`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sercha_lock::{DistributedLock, LockError};
use sercha_queue::{QueueError, TaskQueue};
use sercha_store::{MetadataStore, StoreError};
use sercha_types::Task;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Name of the global scheduler lock.
pub const SCHEDULER_LOCK: &str = "scheduler";

/// Errors from a scheduler tick.
#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Queue(#[from] QueueError),

	#[error(transparent)]
	Lock(#[from] LockError),
}

/// Scheduler knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
	/// Time between ticks.
	pub tick_interval: Duration,
	/// TTL on the scheduler lock; must outlive a tick.
	pub lock_ttl: Duration,
	/// When false, tick without taking the lock (single instance).
	pub lock_required: bool,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			tick_interval: Duration::from_secs(30),
			lock_ttl: Duration::from_secs(60),
			lock_required: true,
		}
	}
}

/// Emits due recurring tasks into the queue.
pub struct Scheduler {
	store: Arc<dyn MetadataStore>,
	queue: Arc<dyn TaskQueue>,
	lock: Arc<dyn DistributedLock>,
	config: SchedulerConfig,
}

impl Scheduler {
	pub fn new(
		store: Arc<dyn MetadataStore>,
		queue: Arc<dyn TaskQueue>,
		lock: Arc<dyn DistributedLock>,
		config: SchedulerConfig,
	) -> Self {
		Self {
			store,
			queue,
			lock,
			config,
		}
	}

	/// Tick until cancelled.
	pub async fn run(&self, cancel: CancellationToken) {
		let mut interval = tokio::time::interval(self.config.tick_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = interval.tick() => {}
			}

			match self.tick().await {
				Ok(enqueued) if enqueued > 0 => {
					tracing::debug!(enqueued, "scheduler tick");
				}
				Ok(_) => {}
				Err(err) => tracing::warn!(error = %err, "scheduler tick failed"),
			}
		}

		tracing::debug!("scheduler stopped");
	}

	/// One tick: take the lock (when required), emit due schedules,
	/// release. Returns how many tasks were enqueued; zero when
	/// another instance holds the lock.
	pub async fn tick(&self) -> Result<u64, SchedulerError> {
		if self.config.lock_required {
			if !self.lock.acquire(SCHEDULER_LOCK, self.config.lock_ttl).await? {
				return Ok(0);
			}

			let result = self.emit_due().await;
			if let Err(err) = self.lock.release(SCHEDULER_LOCK).await {
				tracing::warn!(error = %err, "scheduler lock release failed");
			}
			result
		} else {
			self.emit_due().await
		}
	}

	async fn emit_due(&self) -> Result<u64, SchedulerError> {
		let now = Utc::now();
		let due = self.store.list_due_scheduled_tasks(now).await?;
		let mut enqueued = 0u64;

		for schedule in due {
			let mut task = Task::new(schedule.task_type.clone(), schedule.payload.clone());
			task.tenant_id = schedule.tenant_id.clone();

			// Enqueue failure is recorded on the schedule, and next_run
			// still advances: a broken queue must not cause a burst of
			// duplicates once it heals.
			let outcome = self.queue.enqueue(task).await;
			let last_error = outcome.as_ref().err().map(|e| e.to_string());
			if outcome.is_ok() {
				enqueued += 1;
			} else {
				tracing::warn!(
					schedule = %schedule.name,
					error = %last_error.as_deref().unwrap_or_default(),
					"scheduled enqueue failed"
				);
			}

			let next_run = now + chrono::Duration::seconds(schedule.interval_secs.max(1));
			self.store
				.record_scheduled_run(schedule.id, now, next_run, last_error.as_deref())
				.await?;
		}

		// Opportunistic maintenance while this instance holds the tick.
		match self.store.purge_expired_oauth_states(now).await {
			Ok(0) | Err(_) => {}
			Ok(purged) => tracing::debug!(purged, "expired oauth states purged"),
		}

		Ok(enqueued)
	}
}

impl std::fmt::Debug for Scheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scheduler").field("config", &self.config).finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use sercha_lock::{MemoryLock, MemoryLockBackend};
	use sercha_queue::MemoryQueue;
	use sercha_store::MemoryStore;
	use sercha_types::{ScheduledTask, TASK_SYNC_ALL, TaskFilter};

	use super::*;

	struct Fixture {
		store: Arc<MemoryStore>,
		queue: Arc<MemoryQueue>,
		scheduler: Scheduler,
	}

	fn fixture(lock: MemoryLock, lock_required: bool) -> Fixture {
		let store = Arc::new(MemoryStore::new());
		let queue = Arc::new(MemoryQueue::new());
		let scheduler = Scheduler::new(
			Arc::clone(&store) as Arc<dyn MetadataStore>,
			Arc::clone(&queue) as Arc<dyn TaskQueue>,
			Arc::new(lock),
			SchedulerConfig {
				lock_required,
				..SchedulerConfig::default()
			},
		);
		Fixture {
			store,
			queue,
			scheduler,
		}
	}

	async fn seed_schedule(store: &MemoryStore, interval_secs: i64) -> ScheduledTask {
		let mut schedule = ScheduledTask::new("sync everything", TASK_SYNC_ALL, interval_secs);
		schedule.payload = serde_json::json!({ "requested_by": "schedule" });
		store.create_scheduled_task(&schedule).await.unwrap();
		schedule
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn tick_enqueues_due_schedules_and_advances_next_run() {
		let f = fixture(MemoryLock::new(), true);
		seed_schedule(&f.store, 300).await;

		assert_eq!(f.scheduler.tick().await.unwrap(), 1);

		let tasks = f.queue.list(TaskFilter::default()).await.unwrap();
		assert_eq!(tasks.len(), 1);
		assert_eq!(tasks[0].task_type, TASK_SYNC_ALL);
		assert_eq!(
			tasks[0].payload.get("requested_by").and_then(|v| v.as_str()),
			Some("schedule")
		);

		// The schedule is no longer due.
		let due = f.store.list_due_scheduled_tasks(Utc::now()).await.unwrap();
		assert!(due.is_empty());
		assert_eq!(f.scheduler.tick().await.unwrap(), 0);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn only_one_instance_schedules_per_tick() {
		let backend = MemoryLockBackend::new();
		let f1 = fixture(backend.handle(), true);

		// Second scheduler instance sharing the same lock backend,
		// store, and queue.
		let scheduler2 = Scheduler::new(
			Arc::clone(&f1.store) as Arc<dyn MetadataStore>,
			Arc::clone(&f1.queue) as Arc<dyn TaskQueue>,
			Arc::new(backend.handle()),
			SchedulerConfig::default(),
		);

		seed_schedule(&f1.store, 300).await;

		// Both tick "simultaneously": the loser of the lock does
		// nothing, so exactly one task lands per interval.
		let (a, b) = tokio::join!(f1.scheduler.tick(), scheduler2.tick());
		assert_eq!(a.unwrap() + b.unwrap(), 1);
		assert_eq!(f1.queue.list(TaskFilter::default()).await.unwrap().len(), 1);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn held_lock_skips_the_tick_entirely() {
		let backend = MemoryLockBackend::new();
		let other = backend.handle();
		let f = fixture(backend.handle(), true);
		seed_schedule(&f.store, 300).await;

		assert!(other.acquire(SCHEDULER_LOCK, Duration::from_secs(60)).await.unwrap());
		assert_eq!(f.scheduler.tick().await.unwrap(), 0);
		assert!(f.queue.list(TaskFilter::default()).await.unwrap().is_empty());

		// The schedule stayed due for the next holder.
		assert_eq!(f.store.list_due_scheduled_tasks(Utc::now()).await.unwrap().len(), 1);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn unguarded_mode_runs_without_the_lock() {
		let backend = MemoryLockBackend::new();
		let other = backend.handle();
		let f = fixture(backend.handle(), false);
		seed_schedule(&f.store, 300).await;

		// Even with the lock held elsewhere, lock_required=false ticks.
		assert!(other.acquire(SCHEDULER_LOCK, Duration::from_secs(60)).await.unwrap());
		assert_eq!(f.scheduler.tick().await.unwrap(), 1);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn tick_purges_expired_oauth_states() {
		let f = fixture(MemoryLock::new(), true);
		let now = Utc::now();

		f.store
			.put_oauth_state(&sercha_types::OAuthState {
				state: "stale".into(),
				provider: "github".into(),
				code_verifier: "v".into(),
				redirect_uri: "http://localhost/cb".into(),
				created_at: now - chrono::Duration::minutes(20),
				expires_at: now - chrono::Duration::minutes(10),
			})
			.await
			.unwrap();

		f.scheduler.tick().await.unwrap();
		assert!(f.store.take_oauth_state("stale").await.unwrap().is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn disabled_schedules_are_skipped() {
		let f = fixture(MemoryLock::new(), true);
		let mut schedule = ScheduledTask::new("disabled", TASK_SYNC_ALL, 300);
		schedule.enabled = false;
		f.store.create_scheduled_task(&schedule).await.unwrap();

		assert_eq!(f.scheduler.tick().await.unwrap(), 0);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn enqueue_failure_is_recorded_and_next_run_still_advances() {
		let f = fixture(MemoryLock::new(), true);
		seed_schedule(&f.store, 300).await;
		f.queue.close().await.unwrap();

		assert_eq!(f.scheduler.tick().await.unwrap(), 0);

		// Not due again immediately, and the failure is on record.
		let due = f.store.list_due_scheduled_tasks(Utc::now()).await.unwrap();
		assert!(due.is_empty());

		let later = Utc::now() + chrono::Duration::seconds(301);
		let due = f.store.list_due_scheduled_tasks(later).await.unwrap();
		assert_eq!(due.len(), 1);
		assert!(due[0].last_error.as_deref().unwrap_or_default().contains("closed"));
		assert!(due[0].last_run.is_some());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn run_loop_ticks_on_the_interval_until_cancelled() {
		let f = fixture(MemoryLock::new(), true);
		seed_schedule(&f.store, 3600).await;

		let scheduler = Arc::new(f.scheduler);
		let cancel = CancellationToken::new();
		let handle = {
			let scheduler = Arc::clone(&scheduler);
			let cancel = cancel.clone();
			tokio::spawn(async move { scheduler.run(cancel).await })
		};

		// The first tick fires immediately.
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(f.queue.list(TaskFilter::default()).await.unwrap().len(), 1);

		// Work that becomes due later is picked up by a later tick.
		let mut second = ScheduledTask::new("second", TASK_SYNC_ALL, 3600);
		second.payload = serde_json::json!({});
		f.store.create_scheduled_task(&second).await.unwrap();

		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(f.queue.list(TaskFilter::default()).await.unwrap().len(), 2);

		cancel.cancel();
		handle.await.unwrap();
	}
}
