//! In-process metadata store for single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sercha_types::{
	Chunk, Document, DocumentId, Installation, InstallationId, OAuthState, ProviderConfig,
	ScheduledTask, Source, SourceId, SyncState, SyncStatus, TaskId,
};

use crate::{MetadataStore, StoreError};

#[derive(Default)]
struct Inner {
	sources: HashMap<SourceId, Source>,
	sync_states: HashMap<SourceId, SyncState>,
	documents: HashMap<DocumentId, Document>,
	/// `(source_id, external_id)` uniqueness index.
	documents_by_key: HashMap<(SourceId, String), DocumentId>,
	chunks: HashMap<DocumentId, Vec<Chunk>>,
	scheduled: HashMap<TaskId, ScheduledTask>,
	installations: HashMap<InstallationId, Installation>,
	provider_configs: HashMap<String, ProviderConfig>,
	oauth_states: HashMap<String, OAuthState>,
}

/// A metadata store living entirely in process memory.
///
/// Mirrors the Postgres implementation's semantics method for method,
/// including the `(source_id, external_id)` uniqueness rule, the
/// atomic running transition, and single-use OAuth states.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl MetadataStore for MemoryStore {
	async fn create_source(&self, source: &Source) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if inner.sources.contains_key(&source.id) {
			return Err(StoreError::Conflict(format!("source {} exists", source.id)));
		}
		inner.sources.insert(source.id, source.clone());
		Ok(())
	}

	async fn get_source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
		Ok(self.inner.lock().unwrap().sources.get(&id).cloned())
	}

	async fn list_sources(&self, enabled_only: bool) -> Result<Vec<Source>, StoreError> {
		let inner = self.inner.lock().unwrap();
		let mut sources: Vec<Source> = inner
			.sources
			.values()
			.filter(|s| !enabled_only || s.enabled)
			.cloned()
			.collect();
		sources.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(sources)
	}

	async fn update_source(&self, source: &Source) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if !inner.sources.contains_key(&source.id) {
			return Err(StoreError::NotFound);
		}
		let mut updated = source.clone();
		updated.updated_at = Utc::now();
		inner.sources.insert(source.id, updated);
		Ok(())
	}

	async fn delete_source(&self, id: SourceId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if inner.sources.remove(&id).is_none() {
			return Err(StoreError::NotFound);
		}
		inner.sync_states.remove(&id);

		let doc_ids: Vec<DocumentId> = inner
			.documents
			.values()
			.filter(|d| d.source_id == id)
			.map(|d| d.id)
			.collect();
		for doc_id in doc_ids {
			if let Some(doc) = inner.documents.remove(&doc_id) {
				inner.documents_by_key.remove(&(doc.source_id, doc.external_id));
			}
			inner.chunks.remove(&doc_id);
		}
		Ok(())
	}

	async fn get_sync_state(&self, source_id: SourceId) -> Result<Option<SyncState>, StoreError> {
		Ok(self.inner.lock().unwrap().sync_states.get(&source_id).cloned())
	}

	async fn try_mark_sync_running(
		&self,
		source_id: SourceId,
		started_at: DateTime<Utc>,
	) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().unwrap();
		let state = inner
			.sync_states
			.entry(source_id)
			.or_insert_with(|| SyncState::initial(source_id));

		if state.status == SyncStatus::Running {
			return Ok(false);
		}
		state.status = SyncStatus::Running;
		state.started_at = Some(started_at);
		state.error = None;
		Ok(true)
	}

	async fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
		self.inner
			.lock()
			.unwrap()
			.sync_states
			.insert(state.source_id, state.clone());
		Ok(())
	}

	async fn upsert_document(&self, document: &Document) -> Result<Document, StoreError> {
		let mut inner = self.inner.lock().unwrap();
		let key = (document.source_id, document.external_id.clone());

		let persisted = if let Some(existing_id) = inner.documents_by_key.get(&key).copied() {
			let existing = inner
				.documents
				.get(&existing_id)
				.cloned()
				.unwrap_or_else(|| document.clone());
			let mut updated = document.clone();
			updated.id = existing.id;
			updated.created_at = existing.created_at;
			inner.documents.insert(existing.id, updated.clone());
			updated
		} else {
			inner.documents_by_key.insert(key, document.id);
			inner.documents.insert(document.id, document.clone());
			document.clone()
		};

		Ok(persisted)
	}

	async fn get_document(
		&self,
		source_id: SourceId,
		external_id: &str,
	) -> Result<Option<Document>, StoreError> {
		let inner = self.inner.lock().unwrap();
		let id = inner.documents_by_key.get(&(source_id, external_id.to_string()));
		Ok(id.and_then(|id| inner.documents.get(id)).cloned())
	}

	async fn delete_document(&self, id: DocumentId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(doc) = inner.documents.remove(&id) {
			inner.documents_by_key.remove(&(doc.source_id, doc.external_id));
		}
		inner.chunks.remove(&id);
		Ok(())
	}

	async fn count_documents(&self, source_id: SourceId) -> Result<u64, StoreError> {
		let inner = self.inner.lock().unwrap();
		Ok(inner.documents.values().filter(|d| d.source_id == source_id).count() as u64)
	}

	async fn replace_chunks(
		&self,
		document_id: DocumentId,
		chunks: &[Chunk],
	) -> Result<(), StoreError> {
		self.inner
			.lock()
			.unwrap()
			.chunks
			.insert(document_id, chunks.to_vec());
		Ok(())
	}

	async fn delete_chunks(&self, document_id: DocumentId) -> Result<(), StoreError> {
		self.inner.lock().unwrap().chunks.remove(&document_id);
		Ok(())
	}

	async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError> {
		Ok(self
			.inner
			.lock()
			.unwrap()
			.chunks
			.get(&document_id)
			.cloned()
			.unwrap_or_default())
	}

	async fn create_scheduled_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if inner.scheduled.values().any(|t| t.name == task.name) {
			return Err(StoreError::Conflict(format!("schedule {:?} exists", task.name)));
		}
		inner.scheduled.insert(task.id, task.clone());
		Ok(())
	}

	async fn list_due_scheduled_tasks(
		&self,
		now: DateTime<Utc>,
	) -> Result<Vec<ScheduledTask>, StoreError> {
		let inner = self.inner.lock().unwrap();
		let mut due: Vec<ScheduledTask> = inner
			.scheduled
			.values()
			.filter(|t| t.enabled && t.next_run <= now)
			.cloned()
			.collect();
		due.sort_by(|a, b| a.next_run.cmp(&b.next_run));
		Ok(due)
	}

	async fn record_scheduled_run(
		&self,
		id: TaskId,
		last_run: DateTime<Utc>,
		next_run: DateTime<Utc>,
		last_error: Option<&str>,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		let task = inner.scheduled.get_mut(&id).ok_or(StoreError::NotFound)?;
		task.last_run = Some(last_run);
		task.next_run = next_run;
		task.last_error = last_error.map(String::from);
		Ok(())
	}

	async fn create_installation(&self, installation: &Installation) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(account) = &installation.account_id
			&& inner
				.installations
				.values()
				.any(|i| i.provider == installation.provider && i.account_id.as_ref() == Some(account))
		{
			return Err(StoreError::Conflict(format!(
				"installation for {}/{account} exists",
				installation.provider
			)));
		}
		inner.installations.insert(installation.id, installation.clone());
		Ok(())
	}

	async fn get_installation(&self, id: InstallationId) -> Result<Option<Installation>, StoreError> {
		Ok(self.inner.lock().unwrap().installations.get(&id).cloned())
	}

	async fn find_installation_by_account(
		&self,
		provider: &str,
		account_id: &str,
	) -> Result<Option<Installation>, StoreError> {
		let inner = self.inner.lock().unwrap();
		Ok(inner
			.installations
			.values()
			.find(|i| i.provider == provider && i.account_id.as_deref() == Some(account_id))
			.cloned())
	}

	async fn update_installation(&self, installation: &Installation) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if !inner.installations.contains_key(&installation.id) {
			return Err(StoreError::NotFound);
		}
		let mut updated = installation.clone();
		updated.updated_at = Utc::now();
		inner.installations.insert(installation.id, updated);
		Ok(())
	}

	async fn delete_installation(&self, id: InstallationId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().unwrap();
		if inner.installations.remove(&id).is_none() {
			return Err(StoreError::NotFound);
		}
		// Null the reference, never cascade.
		for source in inner.sources.values_mut() {
			if source.installation_id == Some(id) {
				source.installation_id = None;
			}
		}
		Ok(())
	}

	async fn touch_installation(
		&self,
		id: InstallationId,
		at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		if let Some(installation) = self.inner.lock().unwrap().installations.get_mut(&id) {
			installation.last_used_at = Some(at);
		}
		Ok(())
	}

	async fn upsert_provider_config(&self, config: &ProviderConfig) -> Result<(), StoreError> {
		self.inner
			.lock()
			.unwrap()
			.provider_configs
			.insert(config.provider.clone(), config.clone());
		Ok(())
	}

	async fn get_provider_config(&self, provider: &str) -> Result<Option<ProviderConfig>, StoreError> {
		Ok(self.inner.lock().unwrap().provider_configs.get(provider).cloned())
	}

	async fn put_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError> {
		self.inner
			.lock()
			.unwrap()
			.oauth_states
			.insert(state.state.clone(), state.clone());
		Ok(())
	}

	async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, StoreError> {
		Ok(self.inner.lock().unwrap().oauth_states.remove(state))
	}

	async fn purge_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock().unwrap();
		let before = inner.oauth_states.len();
		inner.oauth_states.retain(|_, s| s.expires_at > now);
		Ok((before - inner.oauth_states.len()) as u64)
	}

	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}
}
