//! Orchestrator tests against scripted connectors and in-memory backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sercha_connector::{
	Connector, ConnectorBuilder, ConnectorError, ConnectorFactory, ContainerLister,
};
use sercha_credentials::{InstallationManager, NewInstallation, OAuthHandler, TokenProvider};
use sercha_index::{HashingEmbedder, MemoryIndex, SearchIndex};
use sercha_pipeline::{NormaliserRegistry, Pipeline};
use sercha_secrets::SecretBox;
use sercha_store::{MemoryStore, MetadataStore};
use sercha_types::{
	AuthMethod, Change, ChangeKind, DocumentInfo, SearchOptions, Source, SyncStatus,
};
use tokio_util::sync::CancellationToken;

use super::{SyncError, SyncOrchestrator};

/// Scripted change batches keyed by `(container, cursor)`.
#[derive(Default)]
struct ScriptedProvider {
	batches: Mutex<HashMap<(String, String), (Vec<Change>, Option<String>)>>,
	fail_fetch: Mutex<Option<String>>,
	supports_containers: bool,
}

impl ScriptedProvider {
	fn new(supports_containers: bool) -> Arc<Self> {
		Arc::new(Self {
			supports_containers,
			..Self::default()
		})
	}

	fn stage(&self, container: &str, cursor: &str, changes: Vec<Change>, new_cursor: Option<&str>) {
		self.batches.lock().unwrap().insert(
			(container.to_string(), cursor.to_string()),
			(changes, new_cursor.map(String::from)),
		);
	}

	fn fail_next_fetch(&self, message: &str) {
		*self.fail_fetch.lock().unwrap() = Some(message.to_string());
	}
}

struct ScriptedConnector {
	script: Arc<ScriptedProvider>,
	container: String,
}

#[async_trait]
impl Connector for ScriptedConnector {
	fn provider(&self) -> &str {
		"scripted"
	}

	fn validate_config(
		&self,
		_config: &serde_json::Map<String, serde_json::Value>,
	) -> Result<(), ConnectorError> {
		Ok(())
	}

	async fn fetch_changes(
		&self,
		_source: &Source,
		cursor: Option<&str>,
		_cancel: &CancellationToken,
	) -> Result<(Vec<Change>, Option<String>), ConnectorError> {
		if let Some(message) = self.script.fail_fetch.lock().unwrap().take() {
			return Err(ConnectorError::Transient(message));
		}

		let key = (self.container.clone(), cursor.unwrap_or_default().to_string());
		let staged = self.script.batches.lock().unwrap().get(&key).cloned();

		match staged {
			Some((changes, new_cursor)) => Ok((changes, new_cursor)),
			None => Ok((Vec::new(), cursor.map(String::from))),
		}
	}

	async fn fetch_document(
		&self,
		_source: &Source,
		_external_id: &str,
		_cancel: &CancellationToken,
	) -> Result<Option<(DocumentInfo, String)>, ConnectorError> {
		Ok(None)
	}

	async fn test_connection(
		&self,
		_source: &Source,
		_cancel: &CancellationToken,
	) -> Result<(), ConnectorError> {
		Ok(())
	}
}

struct ScriptedBuilder {
	script: Arc<ScriptedProvider>,
}

#[async_trait]
impl ConnectorBuilder for ScriptedBuilder {
	fn provider(&self) -> &str {
		"scripted"
	}

	fn supports_oauth(&self) -> bool {
		false
	}

	fn supports_containers(&self) -> bool {
		self.script.supports_containers
	}

	fn oauth_handler(&self) -> Option<Arc<dyn OAuthHandler>> {
		None
	}

	async fn build(
		&self,
		_token: Arc<dyn TokenProvider>,
		container_id: &str,
	) -> Result<Box<dyn Connector>, ConnectorError> {
		Ok(Box::new(ScriptedConnector {
			script: Arc::clone(&self.script),
			container: container_id.to_string(),
		}))
	}

	fn container_lister(&self, _token: Arc<dyn TokenProvider>) -> Option<Box<dyn ContainerLister>> {
		None
	}
}

fn added(external_id: &str, title: &str, body: &str) -> Change {
	Change {
		kind: ChangeKind::Added,
		external_id: external_id.to_string(),
		document: Some(DocumentInfo {
			title: title.to_string(),
			path: Some(format!("docs/{external_id}")),
			mime_type: "text/plain".to_string(),
			..DocumentInfo::default()
		}),
		content: Some(body.to_string()),
	}
}

fn modified(external_id: &str, title: &str, body: &str) -> Change {
	Change {
		kind: ChangeKind::Modified,
		..added(external_id, title, body)
	}
}

fn deleted(external_id: &str) -> Change {
	Change {
		kind: ChangeKind::Deleted,
		external_id: external_id.to_string(),
		document: None,
		content: None,
	}
}

struct Harness {
	store: Arc<MemoryStore>,
	index: Arc<MemoryIndex>,
	script: Arc<ScriptedProvider>,
	orchestrator: SyncOrchestrator,
	source: Source,
	cancel: CancellationToken,
}

async fn harness() -> Harness {
	harness_with(true, Vec::new(), None).await
}

async fn harness_with(
	supports_containers: bool,
	selected_containers: Vec<String>,
	embedding_dim: Option<usize>,
) -> Harness {
	let store = Arc::new(MemoryStore::new());
	let index = Arc::new(match embedding_dim {
		Some(dim) => MemoryIndex::with_dimension(dim),
		None => MemoryIndex::new(),
	});
	let script = ScriptedProvider::new(supports_containers);

	let installations = Arc::new(InstallationManager::new(
		Arc::clone(&store) as Arc<dyn MetadataStore>,
		SecretBox::new(&[3u8; 32]).unwrap(),
	));
	let installation = installations
		.create_installation(NewInstallation {
			name: "scripted".into(),
			provider: "scripted".into(),
			auth_method: AuthMethod::PersonalAccessToken,
			token: "tok".into(),
			scopes: Vec::new(),
		})
		.await
		.unwrap();

	let factory = Arc::new(ConnectorFactory::new());
	factory.register(Arc::new(ScriptedBuilder {
		script: Arc::clone(&script),
	}));

	let mut source = Source::new("scripted source", "scripted");
	source.installation_id = Some(installation.id);
	source.selected_containers = selected_containers;
	store.create_source(&source).await.unwrap();

	let mut orchestrator = SyncOrchestrator::new(
		Arc::clone(&store) as Arc<dyn MetadataStore>,
		installations,
		factory,
		Arc::new(NormaliserRegistry::with_defaults()),
		Arc::new(Pipeline::with_defaults()),
		Arc::clone(&index) as Arc<dyn SearchIndex>,
	);
	if let Some(dim) = embedding_dim {
		orchestrator = orchestrator.with_embedder(Arc::new(HashingEmbedder { dimension: dim }));
	}

	Harness {
		store,
		index,
		script,
		orchestrator,
		source,
		cancel: CancellationToken::new(),
	}
}

#[tokio::test]
async fn first_sync_indexes_all_changes_and_stores_cursor() {
	let h = harness().await;
	h.script.stage(
		"",
		"",
		vec![
			added("a", "Doc A", "alpha body"),
			added("b", "Doc B", "beta body"),
			added("c", "Doc C", "gamma body"),
		],
		Some("c1"),
	);

	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert!(result.success);
	assert_eq!(result.stats.docs_added, 3);
	assert_eq!(result.stats.errors, 0);

	let state = h.store.get_sync_state(h.source.id).await.unwrap().unwrap();
	assert_eq!(state.status, SyncStatus::Idle);
	assert_eq!(state.cursor.as_deref(), Some("c1"));
	assert!(state.completed_at.is_some());

	assert_eq!(h.store.count_documents(h.source.id).await.unwrap(), 3);
	let (hits, _) = h
		.index
		.search("beta", None, &SearchOptions::default())
		.await
		.unwrap();
	assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn second_sync_applies_only_newer_changes() {
	let h = harness().await;
	h.script.stage(
		"",
		"",
		vec![
			added("a", "Doc A", "alpha"),
			added("b", "Doc B", "beta"),
			added("c", "Doc C", "gamma"),
		],
		Some("c1"),
	);
	h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();

	h.script.stage(
		"",
		"c1",
		vec![modified("c", "Doc C", "gamma revised"), added("d", "Doc D", "delta")],
		Some("c2"),
	);
	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert_eq!(result.stats.docs_updated, 1);
	assert_eq!(result.stats.docs_added, 1);

	let state = h.store.get_sync_state(h.source.id).await.unwrap().unwrap();
	assert_eq!(state.cursor.as_deref(), Some("c2"));
	assert_eq!(h.store.count_documents(h.source.id).await.unwrap(), 4);

	// Old content is replaced, not duplicated.
	let (hits, _) = h
		.index
		.search("revised", None, &SearchOptions::default())
		.await
		.unwrap();
	assert_eq!(hits.len(), 1);

	// A third run with nothing staged converges: no changes, cursor
	// unchanged.
	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert_eq!(result.stats.docs_added + result.stats.docs_updated, 0);
	let state = h.store.get_sync_state(h.source.id).await.unwrap().unwrap();
	assert_eq!(state.cursor.as_deref(), Some("c2"));
}

#[tokio::test]
async fn deleted_change_removes_document_chunks_and_index_entries() {
	let h = harness().await;
	h.script.stage("", "", vec![added("x", "Victim", "unique victim text")], Some("c1"));
	h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();

	let document = h.store.get_document(h.source.id, "x").await.unwrap().unwrap();
	assert!(!h.store.get_chunks(document.id).await.unwrap().is_empty());

	h.script.stage("", "c1", vec![deleted("x")], Some("c2"));
	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert_eq!(result.stats.docs_deleted, 1);

	assert!(h.store.get_document(h.source.id, "x").await.unwrap().is_none());
	assert!(h.store.get_chunks(document.id).await.unwrap().is_empty());
	let (hits, total) = h
		.index
		.search("victim", None, &SearchOptions::default())
		.await
		.unwrap();
	assert!(hits.is_empty());
	assert_eq!(total, 0);
}

#[tokio::test]
async fn per_change_errors_are_recorded_without_aborting() {
	let h = harness().await;
	let broken = Change {
		kind: ChangeKind::Added,
		external_id: "broken".into(),
		document: None,
		content: None,
	};
	h.script.stage(
		"",
		"",
		vec![added("ok1", "Fine", "fine one"), broken, added("ok2", "Fine too", "fine two")],
		Some("c1"),
	);

	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert!(result.success);
	assert_eq!(result.stats.docs_added, 2);
	assert_eq!(result.stats.errors, 1);

	let state = h.store.get_sync_state(h.source.id).await.unwrap().unwrap();
	assert_eq!(state.status, SyncStatus::Idle);
	assert_eq!(state.cursor.as_deref(), Some("c1"));
}

#[tokio::test]
async fn connector_failure_marks_failed_and_keeps_cursor() {
	let h = harness().await;
	h.script.stage("", "", vec![added("a", "Doc A", "alpha")], Some("c1"));
	h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();

	h.script.fail_next_fetch("upstream exploded");
	let err = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap_err();
	assert!(matches!(err, SyncError::Connector(ConnectorError::Transient(_))));

	let state = h.store.get_sync_state(h.source.id).await.unwrap().unwrap();
	assert_eq!(state.status, SyncStatus::Failed);
	assert!(state.error.as_deref().unwrap_or_default().contains("upstream exploded"));
	// The cursor never moves on failure.
	assert_eq!(state.cursor.as_deref(), Some("c1"));

	// A failed source can run again.
	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert!(result.success);
}

#[tokio::test]
async fn disabled_source_is_refused() {
	let h = harness().await;
	let mut source = h.source.clone();
	source.enabled = false;
	h.store.update_source(&source).await.unwrap();

	assert!(matches!(
		h.orchestrator.sync_source(h.source.id, &h.cancel).await,
		Err(SyncError::SourceDisabled)
	));
}

#[tokio::test]
async fn concurrent_run_is_refused() {
	let h = harness().await;
	assert!(h
		.store
		.try_mark_sync_running(h.source.id, chrono::Utc::now())
		.await
		.unwrap());

	assert!(matches!(
		h.orchestrator.sync_source(h.source.id, &h.cancel).await,
		Err(SyncError::AlreadyRunning)
	));
}

#[tokio::test]
async fn cancellation_aborts_and_surfaces_as_cancelled() {
	let h = harness().await;
	h.script.stage("", "", vec![added("a", "Doc A", "alpha")], Some("c1"));
	h.cancel.cancel();

	assert!(matches!(
		h.orchestrator.sync_source(h.source.id, &h.cancel).await,
		Err(SyncError::Cancelled)
	));
}

#[tokio::test]
async fn selected_containers_each_sync_and_cursor_merges() {
	let h = harness_with(true, vec!["acme/one".into(), "acme/two".into()], None).await;
	h.script.stage("acme/one", "", vec![added("one/1", "One", "first repo doc")], Some("c-one"));
	h.script.stage("acme/two", "", vec![added("two/1", "Two", "second repo doc")], Some("c-two"));

	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert_eq!(result.stats.docs_added, 2);

	// Last observed cursor wins the merge.
	let state = h.store.get_sync_state(h.source.id).await.unwrap().unwrap();
	assert_eq!(state.cursor.as_deref(), Some("c-two"));
	assert_eq!(h.store.count_documents(h.source.id).await.unwrap(), 2);
}

#[tokio::test]
async fn container_list_is_ignored_when_unsupported() {
	let h = harness_with(false, vec!["acme/one".into()], None).await;
	// Only the empty container is consulted.
	h.script.stage("", "", vec![added("a", "Doc A", "alpha")], Some("c1"));

	let result = h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	assert_eq!(result.stats.docs_added, 1);

	// The stored selection survives for a future connector upgrade.
	let source = h.store.get_source(h.source.id).await.unwrap().unwrap();
	assert_eq!(source.selected_containers, vec!["acme/one".to_string()]);
}

#[tokio::test]
async fn resyncing_identical_content_is_idempotent() {
	let h = harness().await;
	let body = "line one\nline two\nline three";
	h.script.stage("", "", vec![added("a", "Doc A", body)], Some("c1"));
	h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();
	let first_ids = h.index.chunk_ids();

	// The provider resends the same document under the same cursor.
	h.script.stage("", "c1", vec![modified("a", "Doc A", body)], Some("c2"));
	h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();

	assert_eq!(h.index.chunk_ids(), first_ids);
	assert_eq!(h.store.count_documents(h.source.id).await.unwrap(), 1);
}

#[tokio::test]
async fn embeddings_flow_into_the_index_when_configured() {
	let h = harness_with(true, Vec::new(), Some(8)).await;
	h.script.stage("", "", vec![added("a", "Doc A", "vector searchable text")], Some("c1"));
	h.orchestrator.sync_source(h.source.id, &h.cancel).await.unwrap();

	let embedder = HashingEmbedder { dimension: 8 };
	let query = sercha_index::EmbeddingProvider::embed(&embedder, &["vector searchable text".to_string()])
		.await
		.unwrap();

	let options = SearchOptions {
		mode: sercha_types::SearchMode::Semantic,
		..SearchOptions::default()
	};
	let (hits, _) = h.index.search("zzz", Some(&query[0]), &options).await.unwrap();
	assert!(!hits.is_empty());
}

#[tokio::test]
async fn sync_all_covers_enabled_sources_and_tolerates_failures() {
	let h = harness().await;

	// A second, disabled source must be skipped.
	let mut disabled = Source::new("disabled", "scripted");
	disabled.installation_id = h.source.installation_id;
	disabled.enabled = false;
	h.store.create_source(&disabled).await.unwrap();

	// A third source whose connector fails must not sink the sweep.
	let mut failing = Source::new("failing", "scripted");
	failing.installation_id = h.source.installation_id;
	h.store.create_source(&failing).await.unwrap();

	h.script.stage("", "", vec![added("a", "Doc A", "alpha")], Some("c1"));

	// The failure is armed for whichever source fetches first; the
	// other succeeds against the staged batch. Either way the sweep
	// finishes and reports one error.
	h.script.fail_next_fetch("flaky");
	let result = h.orchestrator.sync_all(&h.cancel).await.unwrap();
	assert!(result.success);
	assert_eq!(result.stats.errors, 1);
	assert_eq!(result.stats.docs_added, 1);
}
