//! Transactional metadata store.
//!
//! Everything the execution plane persists outside the search engine
//! goes through [`MetadataStore`]: sources and their sync state,
//! documents and chunks, recurring schedules, installations, provider
//! configs, and single-use OAuth states. The production backend is
//! Postgres; [`MemoryStore`] mirrors its semantics for tests and
//! single-process runs.
//!
//! Writes within one sync are ordered document by document; a
//! document's chunk replacement is all-or-nothing, but there is no
//! global transaction across documents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sercha_types::{
	Chunk, Document, DocumentId, Installation, InstallationId, OAuthState, ProviderConfig,
	ScheduledTask, Source, SourceId, SyncState, TaskId,
};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::{PgStore, PoolConfig, connect_pool};
pub use sqlx::PgPool;

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("not found")]
	NotFound,

	/// A uniqueness constraint was violated.
	#[error("conflict: {0}")]
	Conflict(String),

	/// Stored value could not be decoded into its domain type.
	#[error("store codec: {0}")]
	Codec(String),

	/// The database failed or is unreachable.
	#[error("store backend: {0}")]
	Backend(String),
}

/// The transactional operations the execution plane requires.
#[async_trait]
pub trait MetadataStore: Send + Sync {
	// Sources.
	async fn create_source(&self, source: &Source) -> Result<(), StoreError>;
	async fn get_source(&self, id: SourceId) -> Result<Option<Source>, StoreError>;
	/// All sources, optionally restricted to enabled ones.
	async fn list_sources(&self, enabled_only: bool) -> Result<Vec<Source>, StoreError>;
	async fn update_source(&self, source: &Source) -> Result<(), StoreError>;
	async fn delete_source(&self, id: SourceId) -> Result<(), StoreError>;

	// Sync state.
	async fn get_sync_state(&self, source_id: SourceId) -> Result<Option<SyncState>, StoreError>;
	/// Atomically move a source's sync state to `running`. Returns
	/// `false` when a run is already in flight, in which case nothing
	/// changes.
	async fn try_mark_sync_running(
		&self,
		source_id: SourceId,
		started_at: DateTime<Utc>,
	) -> Result<bool, StoreError>;
	async fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError>;

	// Documents.
	/// Insert or update by `(source_id, external_id)`, preserving the
	/// existing document id and creation time on update. Returns the
	/// persisted row.
	async fn upsert_document(&self, document: &Document) -> Result<Document, StoreError>;
	async fn get_document(
		&self,
		source_id: SourceId,
		external_id: &str,
	) -> Result<Option<Document>, StoreError>;
	async fn delete_document(&self, id: DocumentId) -> Result<(), StoreError>;
	async fn count_documents(&self, source_id: SourceId) -> Result<u64, StoreError>;

	// Chunks.
	/// Replace every chunk of a document in one transaction.
	async fn replace_chunks(
		&self,
		document_id: DocumentId,
		chunks: &[Chunk],
	) -> Result<(), StoreError>;
	async fn delete_chunks(&self, document_id: DocumentId) -> Result<(), StoreError>;
	async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError>;

	// Recurring schedules.
	async fn create_scheduled_task(&self, task: &ScheduledTask) -> Result<(), StoreError>;
	async fn list_due_scheduled_tasks(
		&self,
		now: DateTime<Utc>,
	) -> Result<Vec<ScheduledTask>, StoreError>;
	/// Record the outcome of one scheduler tick for a schedule.
	async fn record_scheduled_run(
		&self,
		id: TaskId,
		last_run: DateTime<Utc>,
		next_run: DateTime<Utc>,
		last_error: Option<&str>,
	) -> Result<(), StoreError>;

	// Installations.
	async fn create_installation(&self, installation: &Installation) -> Result<(), StoreError>;
	async fn get_installation(&self, id: InstallationId) -> Result<Option<Installation>, StoreError>;
	async fn find_installation_by_account(
		&self,
		provider: &str,
		account_id: &str,
	) -> Result<Option<Installation>, StoreError>;
	async fn update_installation(&self, installation: &Installation) -> Result<(), StoreError>;
	/// Delete an installation; referring sources keep existing but have
	/// their installation reference nulled.
	async fn delete_installation(&self, id: InstallationId) -> Result<(), StoreError>;
	async fn touch_installation(&self, id: InstallationId, at: DateTime<Utc>) -> Result<(), StoreError>;

	// Provider configs.
	async fn upsert_provider_config(&self, config: &ProviderConfig) -> Result<(), StoreError>;
	async fn get_provider_config(&self, provider: &str) -> Result<Option<ProviderConfig>, StoreError>;

	// OAuth states.
	async fn put_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError>;
	/// Atomic get-and-delete: across every process, each state is
	/// returned at most once.
	async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, StoreError>;
	async fn purge_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

	async fn ping(&self) -> Result<(), StoreError>;
}
