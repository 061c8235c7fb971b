//! Worker runtime tests against an in-memory queue and a fake sync
//! service.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sercha_queue::{MemoryQueue, TaskQueue};
use sercha_types::{
	SourceId, SyncResult, SyncStats, SyncSourcePayload, TASK_SYNC_ALL, TASK_SYNC_SOURCE, Task,
	TaskStatus,
};
use tokio_util::sync::CancellationToken;

use super::{SyncService, Worker, WorkerConfig};
use sercha_sync::SyncError;

/// Scripted sync service: succeeds, fails, or blocks until cancelled.
#[derive(Default)]
struct FakeSync {
	source_calls: AtomicU32,
	all_calls: AtomicU32,
	fail: bool,
	block_until_cancelled: bool,
}

#[async_trait]
impl SyncService for FakeSync {
	async fn sync_source(
		&self,
		_source_id: SourceId,
		cancel: &CancellationToken,
	) -> Result<SyncResult, SyncError> {
		self.source_calls.fetch_add(1, Ordering::Relaxed);

		if self.block_until_cancelled {
			cancel.cancelled().await;
			return Err(SyncError::Cancelled);
		}
		if self.fail {
			return Ok(SyncResult::failed(SyncStats::default(), "provider down"));
		}
		Ok(SyncResult::ok(SyncStats {
			docs_added: 1,
			..SyncStats::default()
		}))
	}

	async fn sync_all(&self, _cancel: &CancellationToken) -> Result<SyncResult, SyncError> {
		self.all_calls.fetch_add(1, Ordering::Relaxed);
		Ok(SyncResult::ok(SyncStats::default()))
	}
}

fn worker_with(service: FakeSync, config: WorkerConfig) -> (Arc<Worker>, Arc<MemoryQueue>, Arc<FakeSync>) {
	let queue = Arc::new(MemoryQueue::new());
	let service = Arc::new(service);
	let worker = Arc::new(Worker::new(
		Arc::clone(&queue) as Arc<dyn TaskQueue>,
		Arc::clone(&service) as Arc<dyn SyncService>,
		None,
		config,
	));
	(worker, queue, service)
}

fn config() -> WorkerConfig {
	WorkerConfig {
		concurrency: 1,
		dequeue_timeout: Duration::from_millis(100),
		drain_timeout: Duration::from_secs(5),
	}
}

fn sync_source_task(source_id: SourceId) -> Task {
	Task::new(
		TASK_SYNC_SOURCE,
		serde_json::to_value(SyncSourcePayload::new(source_id)).unwrap(),
	)
}

async fn wait_for_status(queue: &MemoryQueue, task: &Task, status: TaskStatus) {
	for _ in 0..200 {
		tokio::time::sleep(Duration::from_millis(20)).await;
		if queue.get(task.id).await.unwrap().unwrap().status == status {
			return;
		}
	}
	panic!("task never reached {status:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn successful_sync_acks_the_task() {
	let (worker, queue, service) = worker_with(FakeSync::default(), config());
	let ctx = CancellationToken::new();
	worker.start(ctx).await;

	let task = sync_source_task(SourceId::generate());
	queue.enqueue(task.clone()).await.unwrap();

	wait_for_status(&queue, &task, TaskStatus::Completed).await;
	assert_eq!(service.source_calls.load(Ordering::Relaxed), 1);

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sync_all_tasks_dispatch_to_the_sweep() {
	let (worker, queue, service) = worker_with(FakeSync::default(), config());
	worker.start(CancellationToken::new()).await;

	let task = Task::new(TASK_SYNC_ALL, serde_json::json!({}));
	queue.enqueue(task.clone()).await.unwrap();

	wait_for_status(&queue, &task, TaskStatus::Completed).await;
	assert_eq!(service.all_calls.load(Ordering::Relaxed), 1);

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_sync_nacks_for_retry() {
	let (worker, queue, _service) = worker_with(
		FakeSync {
			fail: true,
			..FakeSync::default()
		},
		config(),
	);
	worker.start(CancellationToken::new()).await;

	let task = sync_source_task(SourceId::generate()).with_max_attempts(2);
	queue.enqueue(task.clone()).await.unwrap();

	// Attempt 1 nacks; the retry dequeues after backoff and exhausts
	// the budget.
	wait_for_status(&queue, &task, TaskStatus::Failed).await;

	let stored = queue.get(task.id).await.unwrap().unwrap();
	assert_eq!(stored.attempts, 2);
	assert_eq!(stored.last_error.as_deref(), Some("provider down"));

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unknown_task_types_are_nacked() {
	let (worker, queue, _service) = worker_with(FakeSync::default(), config());
	worker.start(CancellationToken::new()).await;

	let task = Task::new("reticulate_splines", serde_json::json!({})).with_max_attempts(1);
	queue.enqueue(task.clone()).await.unwrap();

	wait_for_status(&queue, &task, TaskStatus::Failed).await;
	let stored = queue.get(task.id).await.unwrap().unwrap();
	assert!(stored.last_error.as_deref().unwrap_or_default().contains("unknown task type"));

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn malformed_payload_is_nacked() {
	let (worker, queue, service) = worker_with(FakeSync::default(), config());
	worker.start(CancellationToken::new()).await;

	let task = Task::new(TASK_SYNC_SOURCE, serde_json::json!({ "nope": true })).with_max_attempts(1);
	queue.enqueue(task.clone()).await.unwrap();

	wait_for_status(&queue, &task, TaskStatus::Failed).await;
	assert_eq!(service.source_calls.load(Ordering::Relaxed), 0);

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn context_cancellation_nacks_in_flight_work() {
	let (worker, queue, service) = worker_with(
		FakeSync {
			block_until_cancelled: true,
			..FakeSync::default()
		},
		config(),
	);
	let ctx = CancellationToken::new();
	worker.start(ctx.clone()).await;

	let task = sync_source_task(SourceId::generate());
	queue.enqueue(task.clone()).await.unwrap();

	// Let the handler pick the task up and block.
	for _ in 0..100 {
		tokio::time::sleep(Duration::from_millis(10)).await;
		if service.source_calls.load(Ordering::Relaxed) > 0 {
			break;
		}
	}
	assert_eq!(service.source_calls.load(Ordering::Relaxed), 1);

	// Cancel the context: the handler unwinds, the task nacks back to
	// pending with the cancellation recorded.
	ctx.cancel();
	wait_for_status(&queue, &task, TaskStatus::Pending).await;

	let stored = queue.get(task.id).await.unwrap().unwrap();
	assert!(stored.last_error.as_deref().unwrap_or_default().contains("cancelled"));

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stop_drains_in_flight_work_before_returning() {
	let (worker, queue, _service) = worker_with(FakeSync::default(), config());
	worker.start(CancellationToken::new()).await;

	let task = sync_source_task(SourceId::generate());
	queue.enqueue(task.clone()).await.unwrap();
	wait_for_status(&queue, &task, TaskStatus::Completed).await;

	worker.stop().await;

	// No new work is consumed after stop.
	let late = sync_source_task(SourceId::generate());
	queue.enqueue(late.clone()).await.unwrap();
	tokio::time::sleep(Duration::from_secs(1)).await;
	assert_eq!(queue.get(late.id).await.unwrap().unwrap().status, TaskStatus::Pending);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrency_runs_tasks_in_parallel() {
	let (worker, queue, service) = worker_with(
		FakeSync::default(),
		WorkerConfig {
			concurrency: 4,
			..config()
		},
	);
	worker.start(CancellationToken::new()).await;

	let tasks: Vec<Task> = (0..8).map(|_| sync_source_task(SourceId::generate())).collect();
	queue.enqueue_batch(tasks.clone()).await.unwrap();

	for task in &tasks {
		wait_for_status(&queue, task, TaskStatus::Completed).await;
	}
	assert_eq!(service.source_calls.load(Ordering::Relaxed), 8);

	worker.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn health_reflects_running_state() {
	let (worker, _queue, _service) = worker_with(FakeSync::default(), config());

	let health = worker.health().await;
	assert!(!health.running);
	assert!(health.queue_healthy);

	worker.start(CancellationToken::new()).await;
	assert!(worker.health().await.running);

	worker.stop().await;
	assert!(!worker.health().await.running);
}
