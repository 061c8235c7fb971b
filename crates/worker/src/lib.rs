//! Worker runtime: concurrent consumers of the task queue.
//!
//! `start` launches the scheduler (when configured) and N worker
//! loops. Each loop dequeues with a timeout, dispatches by task type to
//! the sync service, and acks or nacks the task. Stopping is two
//! phased: new dequeues are refused immediately, in-flight work drains
//! within a bounded timeout, then outstanding handlers are cancelled —
//! cancelled work is nacked and retried by the queue's backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sercha_queue::{TRANSPORT_BACKOFF, TaskQueue};
use sercha_scheduler::Scheduler;
use sercha_sync::{SyncError, SyncOrchestrator};
use sercha_types::{SourceId, SyncResult, SyncSourcePayload, TASK_SYNC_ALL, TASK_SYNC_SOURCE, Task};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The sync operations workers dispatch to.
///
/// The orchestrator is the production implementation; tests use fakes.
#[async_trait]
pub trait SyncService: Send + Sync {
	async fn sync_source(
		&self,
		source_id: SourceId,
		cancel: &CancellationToken,
	) -> Result<SyncResult, SyncError>;

	async fn sync_all(&self, cancel: &CancellationToken) -> Result<SyncResult, SyncError>;
}

#[async_trait]
impl SyncService for SyncOrchestrator {
	async fn sync_source(
		&self,
		source_id: SourceId,
		cancel: &CancellationToken,
	) -> Result<SyncResult, SyncError> {
		SyncOrchestrator::sync_source(self, source_id, cancel).await
	}

	async fn sync_all(&self, cancel: &CancellationToken) -> Result<SyncResult, SyncError> {
		SyncOrchestrator::sync_all(self, cancel).await
	}
}

/// Worker knobs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
	/// Parallel worker loops, at least one.
	pub concurrency: usize,
	/// How long one dequeue waits before looping.
	pub dequeue_timeout: Duration,
	/// Grace period for in-flight tasks on stop.
	pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			concurrency: 1,
			dequeue_timeout: Duration::from_secs(5),
			drain_timeout: Duration::from_secs(30),
		}
	}
}

/// Worker health snapshot.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
	pub running: bool,
	pub queue_healthy: bool,
	pub error: Option<String>,
}

/// The worker pool plus its optional scheduler.
pub struct Worker {
	queue: Arc<dyn TaskQueue>,
	service: Arc<dyn SyncService>,
	scheduler: Option<Arc<Scheduler>>,
	config: WorkerConfig,
	/// Refuses new dequeues once triggered.
	stopping: CancellationToken,
	/// Aborts in-flight handlers; triggered by the caller's context or
	/// after the drain timeout.
	hard_cancel: CancellationToken,
	loops: Mutex<Option<JoinSet<()>>>,
	running: AtomicBool,
}

impl Worker {
	pub fn new(
		queue: Arc<dyn TaskQueue>,
		service: Arc<dyn SyncService>,
		scheduler: Option<Arc<Scheduler>>,
		config: WorkerConfig,
	) -> Self {
		Self {
			queue,
			service,
			scheduler,
			config: WorkerConfig {
				concurrency: config.concurrency.max(1),
				..config
			},
			stopping: CancellationToken::new(),
			hard_cancel: CancellationToken::new(),
			loops: Mutex::new(None),
			running: AtomicBool::new(false),
		}
	}

	/// Launch the scheduler and worker loops. `ctx` cancellation
	/// propagates into every in-flight handler.
	pub async fn start(self: &Arc<Self>, ctx: CancellationToken) {
		let mut loops = self.loops.lock().await;
		if loops.is_some() {
			return;
		}

		// The caller's context hard-cancels everything.
		let hard = self.hard_cancel.clone();
		let parent = ctx.clone();
		tokio::spawn(async move {
			parent.cancelled().await;
			hard.cancel();
		});

		let mut set = JoinSet::new();

		if let Some(scheduler) = &self.scheduler {
			let scheduler = Arc::clone(scheduler);
			let cancel = self.stopping.clone();
			set.spawn(async move { scheduler.run(cancel).await });
		}

		for worker_id in 0..self.config.concurrency {
			let this = Arc::clone(self);
			set.spawn(async move { this.worker_loop(worker_id).await });
		}

		*loops = Some(set);
		self.running.store(true, Ordering::Relaxed);
		tracing::info!(concurrency = self.config.concurrency, "worker started");
	}

	/// Stop accepting work, drain in-flight tasks up to the drain
	/// timeout, then cancel whatever remains.
	pub async fn stop(&self) {
		// The stopping token also stops the scheduler loop.
		self.stopping.cancel();

		let Some(mut set) = self.loops.lock().await.take() else {
			return;
		};

		let drained = tokio::time::timeout(self.config.drain_timeout, async {
			while set.join_next().await.is_some() {}
		})
		.await;

		if drained.is_err() {
			tracing::warn!("drain timeout elapsed; cancelling in-flight tasks");
			self.hard_cancel.cancel();
			while set.join_next().await.is_some() {}
		}

		self.running.store(false, Ordering::Relaxed);
		tracing::info!("worker stopped");
	}

	pub async fn health(&self) -> WorkerHealth {
		let queue = self.queue.ping().await;
		WorkerHealth {
			running: self.running.load(Ordering::Relaxed),
			queue_healthy: queue.is_ok(),
			error: queue.err().map(|e| e.to_string()),
		}
	}

	async fn worker_loop(&self, worker_id: usize) {
		tracing::debug!(worker_id, "worker loop started");

		loop {
			if self.stopping.is_cancelled() || self.hard_cancel.is_cancelled() {
				break;
			}

			let dequeued = tokio::select! {
				result = self.queue.dequeue_with_timeout(self.config.dequeue_timeout) => result,
				_ = self.stopping.cancelled() => break,
				_ = self.hard_cancel.cancelled() => break,
			};

			let task = match dequeued {
				Ok(Some(task)) => task,
				Ok(None) => continue,
				Err(err) => {
					tracing::warn!(worker_id, error = %err, "dequeue failed");
					tokio::select! {
						_ = tokio::time::sleep(TRANSPORT_BACKOFF) => {}
						_ = self.stopping.cancelled() => break,
					}
					continue;
				}
			};

			self.handle(worker_id, task).await;
		}

		tracing::debug!(worker_id, "worker loop exited");
	}

	async fn handle(&self, worker_id: usize, task: Task) {
		let task_id = task.id;
		tracing::debug!(worker_id, task_id = %task_id, task_type = %task.task_type, "task started");

		let outcome = self.dispatch(&task).await;

		match outcome {
			Ok(result) if result.success => {
				if let Err(err) = self.queue.ack(task_id).await {
					tracing::warn!(task_id = %task_id, error = %err, "ack failed");
				}
			}
			Ok(result) => {
				let reason = result.error.unwrap_or_else(|| "sync reported failure".to_string());
				self.nack(task_id, &reason).await;
			}
			Err(reason) => self.nack(task_id, &reason).await,
		}
	}

	async fn dispatch(&self, task: &Task) -> Result<SyncResult, String> {
		match task.task_type.as_str() {
			TASK_SYNC_SOURCE => {
				let payload: SyncSourcePayload = serde_json::from_value(task.payload.clone())
					.map_err(|e| format!("invalid sync_source payload: {e}"))?;
				self.service
					.sync_source(payload.source_id, &self.hard_cancel)
					.await
					.map_err(|e| e.to_string())
			}
			TASK_SYNC_ALL => self
				.service
				.sync_all(&self.hard_cancel)
				.await
				.map_err(|e| e.to_string()),
			other => Err(format!("unknown task type {other:?}")),
		}
	}

	async fn nack(&self, task_id: sercha_types::TaskId, reason: &str) {
		tracing::warn!(task_id = %task_id, reason, "task failed");
		if let Err(err) = self.queue.nack(task_id, reason).await {
			tracing::warn!(task_id = %task_id, error = %err, "nack failed");
		}
	}
}

impl std::fmt::Debug for Worker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Worker")
			.field("config", &self.config)
			.field("running", &self.running.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests;
