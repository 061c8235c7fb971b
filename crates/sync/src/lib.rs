//! Sync orchestrator.
//!
//! One entry point per source: build a connector from the source's
//! installation, pull incremental changes, push each document through
//! the normaliser and post-processor pipeline, and reconcile the
//! metadata store and search index. Within a source the stages are
//! strictly sequential; across sources runs are independent.
//!
//! Cursor discipline: a successful run persists the latest cursor the
//! connector returned; a failed run never advances it. Re-running with
//! the same cursor converges to the same indexed state because
//! documents key on `(source_id, external_id)` and chunk ids derive
//! from stable offsets.

use std::sync::Arc;

use chrono::Utc;
use sercha_connector::{Connector, ConnectorError, ConnectorFactory};
use sercha_credentials::{CredentialError, InstallationManager};
use sercha_index::{EmbeddingProvider, IndexError, SearchIndex};
use sercha_pipeline::{NormaliserRegistry, Pipeline};
use sercha_store::{MetadataStore, StoreError};
use sercha_types::{
	Change, ChangeKind, Document, Source, SourceId, SyncResult, SyncState, SyncStats, SyncStatus,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

/// Errors that abort a source sync.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("source not found")]
	SourceNotFound,

	#[error("source is disabled")]
	SourceDisabled,

	/// Another run holds this source; refused, nothing changed.
	#[error("sync already running")]
	AlreadyRunning,

	/// The source has no installation to authenticate with.
	#[error("source has no installation")]
	MissingInstallation,

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Credential(#[from] CredentialError),

	#[error(transparent)]
	Connector(#[from] ConnectorError),

	#[error(transparent)]
	Index(#[from] IndexError),

	/// The run observed cancellation. Never rewrapped.
	#[error("cancelled")]
	Cancelled,
}

impl SyncError {
	fn is_cancellation(&self) -> bool {
		matches!(
			self,
			SyncError::Cancelled | SyncError::Connector(ConnectorError::Cancelled)
		)
	}
}

/// Everything a sync run needs, assembled once at startup.
pub struct SyncOrchestrator {
	store: Arc<dyn MetadataStore>,
	installations: Arc<InstallationManager>,
	connectors: Arc<ConnectorFactory>,
	normalisers: Arc<NormaliserRegistry>,
	pipeline: Arc<Pipeline>,
	index: Arc<dyn SearchIndex>,
	embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SyncOrchestrator {
	pub fn new(
		store: Arc<dyn MetadataStore>,
		installations: Arc<InstallationManager>,
		connectors: Arc<ConnectorFactory>,
		normalisers: Arc<NormaliserRegistry>,
		pipeline: Arc<Pipeline>,
		index: Arc<dyn SearchIndex>,
	) -> Self {
		Self {
			store,
			installations,
			connectors,
			normalisers,
			pipeline,
			index,
			embedder: None,
		}
	}

	/// Attach an embedding provider; chunks are indexed with vectors.
	#[must_use]
	pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
		self.embedder = Some(embedder);
		self
	}

	/// Sync one source end to end.
	pub async fn sync_source(
		&self,
		source_id: SourceId,
		cancel: &CancellationToken,
	) -> Result<SyncResult, SyncError> {
		let source = self
			.store
			.get_source(source_id)
			.await?
			.ok_or(SyncError::SourceNotFound)?;

		if !source.enabled {
			return Err(SyncError::SourceDisabled);
		}

		let started_at = Utc::now();
		if !self.store.try_mark_sync_running(source_id, started_at).await? {
			return Err(SyncError::AlreadyRunning);
		}

		tracing::info!(source_id = %source_id, provider = %source.provider, "sync started");
		let outcome = self.run(&source, cancel).await;

		let mut state = self
			.store
			.get_sync_state(source_id)
			.await?
			.unwrap_or_else(|| SyncState::initial(source_id));
		state.started_at = Some(started_at);

		match outcome {
			Ok((cursor, stats)) => {
				let now = Utc::now();
				state.status = SyncStatus::Idle;
				state.cursor = cursor;
				state.stats = stats;
				state.error = None;
				state.last_sync_at = Some(now);
				state.completed_at = Some(now);
				self.store.save_sync_state(&state).await?;

				tracing::info!(
					source_id = %source_id,
					docs_added = stats.docs_added,
					docs_updated = stats.docs_updated,
					docs_deleted = stats.docs_deleted,
					chunks_indexed = stats.chunks_indexed,
					errors = stats.errors,
					"sync completed"
				);
				Ok(SyncResult::ok(stats))
			}
			Err(err) => {
				// The cursor is deliberately left untouched.
				state.status = SyncStatus::Failed;
				state.error = Some(err.to_string());
				state.completed_at = Some(Utc::now());
				self.store.save_sync_state(&state).await?;

				tracing::warn!(source_id = %source_id, error = %err, "sync failed");
				Err(err)
			}
		}
	}

	/// Sync every enabled source, sequentially.
	///
	/// Per-source failures are recorded in that source's sync state and
	/// counted; only cancellation aborts the sweep.
	pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<SyncResult, SyncError> {
		let sources = self.store.list_sources(true).await?;
		let mut stats = SyncStats::default();

		for source in sources {
			if cancel.is_cancelled() {
				return Err(SyncError::Cancelled);
			}

			match self.sync_source(source.id, cancel).await {
				Ok(result) => stats.merge(&result.stats),
				Err(err) if err.is_cancellation() => return Err(err),
				Err(SyncError::AlreadyRunning) => {
					tracing::debug!(source_id = %source.id, "skipping source with a run in flight");
				}
				Err(err) => {
					tracing::warn!(source_id = %source.id, error = %err, "source sync failed");
					stats.errors += 1;
				}
			}
		}

		Ok(SyncResult::ok(stats))
	}

	async fn run(
		&self,
		source: &Source,
		cancel: &CancellationToken,
	) -> Result<(Option<String>, SyncStats), SyncError> {
		let installation_id = source.installation_id.ok_or(SyncError::MissingInstallation)?;
		let token = self.installations.token_provider(installation_id).await?;
		let builder = self.connectors.get(&source.provider)?;

		// Sources keep their container list even when the connector
		// cannot act on it; such sources run once with no container.
		let containers: Vec<String> =
			if builder.supports_containers() && !source.selected_containers.is_empty() {
				source.selected_containers.clone()
			} else {
				vec![String::new()]
			};

		let prev_cursor = self
			.store
			.get_sync_state(source.id)
			.await?
			.and_then(|s| s.cursor);

		let mut stats = SyncStats::default();
		let mut merged_cursor = prev_cursor.clone();

		for container in &containers {
			let connector = builder.build(Arc::clone(&token), container).await?;
			connector.validate_config(&source.config)?;

			let mut cursor = prev_cursor.clone();
			loop {
				if cancel.is_cancelled() {
					return Err(SyncError::Cancelled);
				}

				let (changes, new_cursor) =
					connector.fetch_changes(source, cursor.as_deref(), cancel).await?;

				let drained = changes.is_empty() || new_cursor == cursor;

				for change in changes {
					match self.apply_change(source, connector.as_ref(), &change).await {
						Ok(chunks_indexed) => {
							stats.chunks_indexed += chunks_indexed;
							match change.kind {
								ChangeKind::Added => stats.docs_added += 1,
								ChangeKind::Modified => stats.docs_updated += 1,
								ChangeKind::Deleted => stats.docs_deleted += 1,
							}
						}
						Err(err) if err.is_cancellation() => return Err(err),
						Err(err) => {
							stats.errors += 1;
							tracing::warn!(
								source_id = %source.id,
								external_id = %change.external_id,
								error = %err,
								"change failed; continuing"
							);
						}
					}
				}

				if let Some(new_cursor) = new_cursor
					&& Some(&new_cursor) != cursor.as_ref()
				{
					cursor = Some(new_cursor);
					merged_cursor = cursor.clone();
				}

				if drained {
					break;
				}
			}
		}

		Ok((merged_cursor, stats))
	}

	/// Apply one change; returns how many chunks were indexed.
	async fn apply_change(
		&self,
		source: &Source,
		connector: &dyn Connector,
		change: &Change,
	) -> Result<u64, SyncError> {
		match change.kind {
			ChangeKind::Deleted => self.apply_delete(source, &change.external_id).await,
			ChangeKind::Added | ChangeKind::Modified => {
				self.apply_upsert(source, connector, change).await
			}
		}
	}

	async fn apply_delete(&self, source: &Source, external_id: &str) -> Result<u64, SyncError> {
		let Some(document) = self.store.get_document(source.id, external_id).await? else {
			// Unknown document: the delete already happened.
			return Ok(0);
		};

		self.index.delete_by_document(document.id).await?;
		self.store.delete_chunks(document.id).await?;
		self.store.delete_document(document.id).await?;
		Ok(0)
	}

	async fn apply_upsert(
		&self,
		source: &Source,
		connector: &dyn Connector,
		change: &Change,
	) -> Result<u64, SyncError> {
		let info = change.document.clone().ok_or_else(|| {
			SyncError::Connector(ConnectorError::Codec(format!(
				"{} change for {:?} carried no document",
				connector.provider(),
				change.external_id
			)))
		})?;
		let content = change.content.clone().unwrap_or_default();

		let mut document = Document::from_info(source.id, &change.external_id, info);
		document.indexed_at = Some(Utc::now());
		let document = self.store.upsert_document(&document).await?;

		// The registry's catch-all makes this infallible in practice,
		// but a stripped-down registry may genuinely have no match.
		let text = match self.normalisers.get(&document.mime_type) {
			Some(normaliser) => normaliser.normalise(&content, &document.mime_type),
			None => content,
		};

		let chunks = self.pipeline.process(vec![Pipeline::seed(&document, text)]);

		// Old chunks leave the index first so shrinking documents do
		// not strand tail chunks.
		self.index.delete_by_document(document.id).await?;
		self.store.replace_chunks(document.id, &chunks).await?;

		if chunks.is_empty() {
			return Ok(0);
		}

		match &self.embedder {
			Some(embedder) => {
				let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
				let embeddings = embedder.embed(&texts).await?;
				self.index.index(&chunks, Some(&embeddings)).await?;
			}
			None => self.index.index(&chunks, None).await?,
		}

		Ok(chunks.len() as u64)
	}
}

impl std::fmt::Debug for SyncOrchestrator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SyncOrchestrator").finish_non_exhaustive()
	}
}
