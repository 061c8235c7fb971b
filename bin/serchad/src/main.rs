//! Sercha daemon: wires the stores, queue, lock, connectors, and
//! worker runtime according to the environment, then runs until
//! SIGINT/SIGTERM.

mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sercha_connector::{ConnectorFactory, GithubIssueNormaliser};
use sercha_credentials::InstallationManager;
use sercha_index::{SearchIndex, VespaIndex};
use sercha_lock::{DistributedLock, PgAdvisoryLock, RedisLock};
use sercha_pipeline::{NormaliserRegistry, Pipeline};
use sercha_queue::{PostgresQueue, RedisStreamQueue, TaskQueue};
use sercha_scheduler::{Scheduler, SchedulerConfig};
use sercha_secrets::SecretBox;
use sercha_store::{MetadataStore, PgStore, connect_pool};
use sercha_sync::SyncOrchestrator;
use sercha_types::{ScheduledTask, TASK_SYNC_ALL};
use sercha_worker::{Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, RunMode};

/// Hourly full sweep seeded on first start.
const DEFAULT_SYNC_ALL_INTERVAL_SECS: i64 = 3600;

#[derive(Parser, Debug)]
#[command(name = "serchad")]
#[command(about = "Sercha background execution plane")]
#[command(version)]
struct Cli {
	/// Run mode: api, worker, or all (overrides RUN_MODE)
	mode: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let cli = Cli::parse();
	let config = Config::from_env(cli.mode.as_deref())?;
	tracing::info!(mode = ?config.run_mode, "serchad starting");

	run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
	let pool = connect_pool(&config.database_url, &config.pool).await?;
	let store = Arc::new(PgStore::new(pool.clone()));
	store.migrate().await?;
	let store: Arc<dyn MetadataStore> = store;

	let secrets = build_secret_box(&config)?;

	let connectors = Arc::new(ConnectorFactory::with_defaults());
	let installations = Arc::new(InstallationManager::new(Arc::clone(&store), secrets));
	for provider in connectors.providers() {
		if let Ok(builder) = connectors.get(&provider)
			&& let Some(handler) = builder.oauth_handler()
		{
			installations.register_handler(handler);
		}
	}

	let normalisers = Arc::new(NormaliserRegistry::with_defaults());
	normalisers.register(Arc::new(GithubIssueNormaliser::new()));
	let pipeline = Arc::new(Pipeline::with_defaults());

	let index: Arc<dyn SearchIndex> = Arc::new(VespaIndex::new(
		config.vespa_config_url.clone(),
		config.vespa_container_url.clone(),
	)?);

	let (queue, lock) = build_queue_and_lock(&config, &pool).await?;

	let orchestrator = Arc::new(SyncOrchestrator::new(
		Arc::clone(&store),
		installations,
		connectors,
		normalisers,
		pipeline,
		Arc::clone(&index),
	));

	let root = CancellationToken::new();
	spawn_signal_handler(root.clone());

	match config.run_mode {
		RunMode::Api => {
			// The HTTP collaborator mounts over these stores in the
			// enterprise distribution; this process just holds them.
			tracing::info!(
				oauth_callback = %config.oauth_callback_url(),
				"api mode: stores ready, execution plane idle"
			);
			root.cancelled().await;
		}
		RunMode::Worker | RunMode::All => {
			seed_default_schedule(store.as_ref()).await;

			let scheduler = config.scheduler_enabled.then(|| {
				Arc::new(Scheduler::new(
					Arc::clone(&store),
					Arc::clone(&queue),
					Arc::clone(&lock),
					SchedulerConfig {
						lock_required: config.scheduler_lock_required,
						..SchedulerConfig::default()
					},
				))
			});

			let worker = Arc::new(Worker::new(
				Arc::clone(&queue),
				orchestrator,
				scheduler,
				WorkerConfig {
					concurrency: config.worker_concurrency,
					dequeue_timeout: config.dequeue_timeout,
					drain_timeout: Duration::from_secs(30),
				},
			));

			worker.start(root.clone()).await;
			root.cancelled().await;

			tracing::info!("shutdown signal received; draining");
			worker.stop().await;
			queue.close().await.ok();
		}
	}

	tracing::info!("serchad stopped");
	Ok(())
}

fn build_secret_box(config: &Config) -> anyhow::Result<SecretBox> {
	match &config.master_key {
		Some(key) => Ok(SecretBox::from_hex(key)?),
		None => {
			tracing::warn!("MASTER_KEY not set; deriving a key from APP_SECRET (not for production)");
			Ok(SecretBox::derive(&config.app_secret))
		}
	}
}

async fn build_queue_and_lock(
	config: &Config,
	pool: &sercha_store::PgPool,
) -> anyhow::Result<(Arc<dyn TaskQueue>, Arc<dyn DistributedLock>)> {
	match &config.redis_url {
		Some(url) => {
			tracing::info!("using redis queue and lock backends");
			// Separate connections: the queue's blocking reads must not
			// stall lock traffic.
			let queue = RedisStreamQueue::connect(url).await?;
			let lock = RedisLock::connect(url).await?;
			Ok((Arc::new(queue), Arc::new(lock)))
		}
		None => {
			tracing::info!("using postgres queue and advisory-lock backends");
			Ok((
				Arc::new(PostgresQueue::new(pool.clone())),
				Arc::new(PgAdvisoryLock::new(pool.clone())),
			))
		}
	}
}

/// Make sure a periodic full sweep exists. Later starts find it and do
/// nothing.
async fn seed_default_schedule(store: &dyn MetadataStore) {
	let schedule = ScheduledTask::new("sync-all", TASK_SYNC_ALL, DEFAULT_SYNC_ALL_INTERVAL_SECS);
	match store.create_scheduled_task(&schedule).await {
		Ok(()) => tracing::info!(interval_secs = schedule.interval_secs, "seeded sync-all schedule"),
		Err(sercha_store::StoreError::Conflict(_)) => {}
		Err(err) => tracing::warn!(error = %err, "seeding sync-all schedule failed"),
	}
}

fn spawn_signal_handler(root: CancellationToken) {
	tokio::spawn(async move {
		let ctrl_c = tokio::signal::ctrl_c();

		#[cfg(unix)]
		{
			let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
				Ok(signal) => signal,
				Err(err) => {
					tracing::warn!(error = %err, "SIGTERM handler unavailable");
					let _ = ctrl_c.await;
					root.cancel();
					return;
				}
			};

			tokio::select! {
				_ = ctrl_c => {}
				_ = sigterm.recv() => {}
			}
		}

		#[cfg(not(unix))]
		{
			let _ = ctrl_c.await;
		}

		root.cancel();
	});
}
