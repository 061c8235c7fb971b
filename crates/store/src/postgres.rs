//! Postgres metadata store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sercha_types::{
	AuthMethod, Chunk, Document, DocumentId, Installation, InstallationId, OAuthState,
	ProviderConfig, ScheduledTask, Source, SourceId, SyncState, SyncStats, SyncStatus, TaskId,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{MetadataStore, StoreError};

/// Connection-pool sizing, fed from the `DB_*` environment variables.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
	pub max_open: u32,
	pub min_idle: u32,
	pub max_lifetime: std::time::Duration,
	pub idle_timeout: std::time::Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_open: 25,
			min_idle: 5,
			max_lifetime: std::time::Duration::from_secs(300),
			idle_timeout: std::time::Duration::from_secs(60),
		}
	}
}

/// Open a connection pool with the given sizing.
pub async fn connect_pool(url: &str, config: &PoolConfig) -> Result<PgPool, StoreError> {
	PgPoolOptions::new()
		.max_connections(config.max_open)
		.min_connections(config.min_idle)
		.max_lifetime(config.max_lifetime)
		.idle_timeout(config.idle_timeout)
		.connect(url)
		.await
		.map_err(backend)
}

/// Metadata store over Postgres.
#[derive(Debug, Clone)]
pub struct PgStore {
	pool: PgPool,
}

impl PgStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	/// Apply the embedded schema migrations.
	pub async fn migrate(&self) -> Result<(), StoreError> {
		sqlx::migrate!("./migrations")
			.run(&self.pool)
			.await
			.map_err(|e| StoreError::Backend(e.to_string()))
	}

	/// The underlying pool, shared with the queue and lock backends.
	pub fn pool(&self) -> &PgPool {
		&self.pool
	}
}

fn backend(err: sqlx::Error) -> StoreError {
	if let sqlx::Error::Database(db) = &err
		&& db.is_unique_violation()
	{
		return StoreError::Conflict(db.to_string());
	}
	StoreError::Backend(err.to_string())
}

fn as_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
	match value {
		serde_json::Value::Object(map) => map,
		_ => serde_json::Map::new(),
	}
}

#[derive(FromRow)]
struct SourceRow {
	id: Uuid,
	name: String,
	provider: String,
	config: serde_json::Value,
	enabled: bool,
	installation_id: Option<Uuid>,
	selected_containers: Vec<String>,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
}

impl From<SourceRow> for Source {
	fn from(row: SourceRow) -> Self {
		Source {
			id: SourceId(row.id),
			name: row.name,
			provider: row.provider,
			config: as_map(row.config),
			enabled: row.enabled,
			installation_id: row.installation_id.map(InstallationId),
			selected_containers: row.selected_containers,
			created_at: row.created_at,
			updated_at: row.updated_at,
		}
	}
}

const SOURCE_COLUMNS: &str = "id, name, provider, config, enabled, installation_id, \
	selected_containers, created_at, updated_at";

#[derive(FromRow)]
struct SyncStateRow {
	source_id: Uuid,
	status: String,
	last_sync_at: Option<DateTime<Utc>>,
	next_sync_at: Option<DateTime<Utc>>,
	cursor: Option<String>,
	error: Option<String>,
	stats: serde_json::Value,
	started_at: Option<DateTime<Utc>>,
	completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SyncStateRow> for SyncState {
	type Error = StoreError;

	fn try_from(row: SyncStateRow) -> Result<Self, Self::Error> {
		let status = SyncStatus::parse(&row.status)
			.ok_or_else(|| StoreError::Codec(format!("unknown sync status {:?}", row.status)))?;
		let stats: SyncStats = serde_json::from_value(row.stats).unwrap_or_default();
		Ok(SyncState {
			source_id: SourceId(row.source_id),
			status,
			last_sync_at: row.last_sync_at,
			next_sync_at: row.next_sync_at,
			cursor: row.cursor,
			error: row.error,
			stats,
			started_at: row.started_at,
			completed_at: row.completed_at,
		})
	}
}

#[derive(FromRow)]
struct DocumentRow {
	id: Uuid,
	source_id: Uuid,
	external_id: String,
	path: Option<String>,
	url: Option<String>,
	title: String,
	mime_type: String,
	metadata: serde_json::Value,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
	indexed_at: Option<DateTime<Utc>>,
}

impl From<DocumentRow> for Document {
	fn from(row: DocumentRow) -> Self {
		Document {
			id: DocumentId(row.id),
			source_id: SourceId(row.source_id),
			external_id: row.external_id,
			path: row.path,
			url: row.url,
			title: row.title,
			mime_type: row.mime_type,
			metadata: as_map(row.metadata),
			created_at: row.created_at,
			updated_at: row.updated_at,
			indexed_at: row.indexed_at,
		}
	}
}

const DOCUMENT_COLUMNS: &str = "id, source_id, external_id, path, url, title, mime_type, \
	metadata, created_at, updated_at, indexed_at";

#[derive(FromRow)]
struct ChunkRow {
	id: String,
	document_id: Uuid,
	source_id: Uuid,
	content: String,
	position: i32,
	start_char: i64,
	end_char: i64,
	metadata: serde_json::Value,
}

impl From<ChunkRow> for Chunk {
	fn from(row: ChunkRow) -> Self {
		Chunk {
			id: row.id,
			document_id: DocumentId(row.document_id),
			source_id: SourceId(row.source_id),
			content: row.content,
			position: row.position.max(0) as u32,
			start_char: row.start_char.max(0) as u64,
			end_char: row.end_char.max(0) as u64,
			metadata: as_map(row.metadata),
		}
	}
}

#[derive(FromRow)]
struct ScheduledTaskRow {
	id: Uuid,
	name: String,
	task_type: String,
	tenant_id: String,
	interval_secs: i64,
	enabled: bool,
	next_run: DateTime<Utc>,
	last_run: Option<DateTime<Utc>>,
	last_error: Option<String>,
	payload: serde_json::Value,
}

impl From<ScheduledTaskRow> for ScheduledTask {
	fn from(row: ScheduledTaskRow) -> Self {
		ScheduledTask {
			id: TaskId(row.id),
			name: row.name,
			task_type: row.task_type,
			tenant_id: row.tenant_id,
			interval_secs: row.interval_secs,
			enabled: row.enabled,
			next_run: row.next_run,
			last_run: row.last_run,
			last_error: row.last_error,
			payload: row.payload,
		}
	}
}

#[derive(FromRow)]
struct InstallationRow {
	id: Uuid,
	name: String,
	provider: String,
	auth_method: String,
	secret: Vec<u8>,
	oauth_expires_at: Option<DateTime<Utc>>,
	scopes: Vec<String>,
	account_id: Option<String>,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
	last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstallationRow> for Installation {
	type Error = StoreError;

	fn try_from(row: InstallationRow) -> Result<Self, Self::Error> {
		let auth_method = AuthMethod::parse(&row.auth_method)
			.ok_or_else(|| StoreError::Codec(format!("unknown auth method {:?}", row.auth_method)))?;
		Ok(Installation {
			id: InstallationId(row.id),
			name: row.name,
			provider: row.provider,
			auth_method,
			secret: row.secret,
			oauth_expires_at: row.oauth_expires_at,
			scopes: row.scopes,
			account_id: row.account_id,
			created_at: row.created_at,
			updated_at: row.updated_at,
			last_used_at: row.last_used_at,
		})
	}
}

const INSTALLATION_COLUMNS: &str = "id, name, provider, auth_method, secret, oauth_expires_at, \
	scopes, account_id, created_at, updated_at, last_used_at";

#[derive(FromRow)]
struct ProviderConfigRow {
	provider: String,
	secret: Vec<u8>,
	auth_url: String,
	token_url: String,
	user_info_url: String,
	scopes: Vec<String>,
	redirect_uri: String,
	enabled: bool,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
}

impl From<ProviderConfigRow> for ProviderConfig {
	fn from(row: ProviderConfigRow) -> Self {
		ProviderConfig {
			provider: row.provider,
			secret: row.secret,
			auth_url: row.auth_url,
			token_url: row.token_url,
			user_info_url: row.user_info_url,
			scopes: row.scopes,
			redirect_uri: row.redirect_uri,
			enabled: row.enabled,
			created_at: row.created_at,
			updated_at: row.updated_at,
		}
	}
}

#[derive(FromRow)]
struct OAuthStateRow {
	state: String,
	provider: String,
	code_verifier: String,
	redirect_uri: String,
	created_at: DateTime<Utc>,
	expires_at: DateTime<Utc>,
}

impl From<OAuthStateRow> for OAuthState {
	fn from(row: OAuthStateRow) -> Self {
		OAuthState {
			state: row.state,
			provider: row.provider,
			code_verifier: row.code_verifier,
			redirect_uri: row.redirect_uri,
			created_at: row.created_at,
			expires_at: row.expires_at,
		}
	}
}

#[async_trait]
impl MetadataStore for PgStore {
	async fn create_source(&self, source: &Source) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO sources (id, name, provider, config, enabled, installation_id, \
				selected_containers, created_at, updated_at) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
		)
		.bind(source.id.0)
		.bind(&source.name)
		.bind(&source.provider)
		.bind(serde_json::Value::Object(source.config.clone()))
		.bind(source.enabled)
		.bind(source.installation_id.map(|i| i.0))
		.bind(&source.selected_containers)
		.bind(source.created_at)
		.bind(source.updated_at)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn get_source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
		let row: Option<SourceRow> =
			sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"))
				.bind(id.0)
				.fetch_optional(&self.pool)
				.await
				.map_err(backend)?;
		Ok(row.map(Source::from))
	}

	async fn list_sources(&self, enabled_only: bool) -> Result<Vec<Source>, StoreError> {
		let sql = if enabled_only {
			format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE enabled ORDER BY created_at")
		} else {
			format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY created_at")
		};
		let rows: Vec<SourceRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await.map_err(backend)?;
		Ok(rows.into_iter().map(Source::from).collect())
	}

	async fn update_source(&self, source: &Source) -> Result<(), StoreError> {
		let result = sqlx::query(
			"UPDATE sources SET name = $2, provider = $3, config = $4, enabled = $5, \
				installation_id = $6, selected_containers = $7, updated_at = $8 \
			WHERE id = $1",
		)
		.bind(source.id.0)
		.bind(&source.name)
		.bind(&source.provider)
		.bind(serde_json::Value::Object(source.config.clone()))
		.bind(source.enabled)
		.bind(source.installation_id.map(|i| i.0))
		.bind(&source.selected_containers)
		.bind(Utc::now())
		.execute(&self.pool)
		.await
		.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn delete_source(&self, id: SourceId) -> Result<(), StoreError> {
		let result = sqlx::query("DELETE FROM sources WHERE id = $1")
			.bind(id.0)
			.execute(&self.pool)
			.await
			.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn get_sync_state(&self, source_id: SourceId) -> Result<Option<SyncState>, StoreError> {
		let row: Option<SyncStateRow> = sqlx::query_as(
			"SELECT source_id, status, last_sync_at, next_sync_at, cursor, error, stats, \
				started_at, completed_at \
			FROM sync_states WHERE source_id = $1",
		)
		.bind(source_id.0)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;

		row.map(SyncState::try_from).transpose()
	}

	async fn try_mark_sync_running(
		&self,
		source_id: SourceId,
		started_at: DateTime<Utc>,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"INSERT INTO sync_states (source_id, status, started_at) \
			VALUES ($1, 'running', $2) \
			ON CONFLICT (source_id) DO UPDATE \
				SET status = 'running', started_at = $2, error = NULL \
				WHERE sync_states.status <> 'running'",
		)
		.bind(source_id.0)
		.bind(started_at)
		.execute(&self.pool)
		.await
		.map_err(backend)?;

		Ok(result.rows_affected() > 0)
	}

	async fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
		let stats = serde_json::to_value(state.stats)
			.map_err(|e| StoreError::Codec(e.to_string()))?;

		sqlx::query(
			"INSERT INTO sync_states (source_id, status, last_sync_at, next_sync_at, cursor, \
				error, stats, started_at, completed_at) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
			ON CONFLICT (source_id) DO UPDATE SET \
				status = EXCLUDED.status, last_sync_at = EXCLUDED.last_sync_at, \
				next_sync_at = EXCLUDED.next_sync_at, cursor = EXCLUDED.cursor, \
				error = EXCLUDED.error, stats = EXCLUDED.stats, \
				started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at",
		)
		.bind(state.source_id.0)
		.bind(state.status.as_str())
		.bind(state.last_sync_at)
		.bind(state.next_sync_at)
		.bind(&state.cursor)
		.bind(&state.error)
		.bind(stats)
		.bind(state.started_at)
		.bind(state.completed_at)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn upsert_document(&self, document: &Document) -> Result<Document, StoreError> {
		let row: DocumentRow = sqlx::query_as(&format!(
			"INSERT INTO documents (id, source_id, external_id, path, url, title, mime_type, \
				metadata, created_at, updated_at, indexed_at) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
			ON CONFLICT (source_id, external_id) DO UPDATE SET \
				path = EXCLUDED.path, url = EXCLUDED.url, title = EXCLUDED.title, \
				mime_type = EXCLUDED.mime_type, metadata = EXCLUDED.metadata, \
				updated_at = EXCLUDED.updated_at, indexed_at = EXCLUDED.indexed_at \
			RETURNING {DOCUMENT_COLUMNS}"
		))
		.bind(document.id.0)
		.bind(document.source_id.0)
		.bind(&document.external_id)
		.bind(&document.path)
		.bind(&document.url)
		.bind(&document.title)
		.bind(&document.mime_type)
		.bind(serde_json::Value::Object(document.metadata.clone()))
		.bind(document.created_at)
		.bind(document.updated_at)
		.bind(document.indexed_at)
		.fetch_one(&self.pool)
		.await
		.map_err(backend)?;

		Ok(row.into())
	}

	async fn get_document(
		&self,
		source_id: SourceId,
		external_id: &str,
	) -> Result<Option<Document>, StoreError> {
		let row: Option<DocumentRow> = sqlx::query_as(&format!(
			"SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_id = $1 AND external_id = $2"
		))
		.bind(source_id.0)
		.bind(external_id)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;
		Ok(row.map(Document::from))
	}

	async fn delete_document(&self, id: DocumentId) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM documents WHERE id = $1")
			.bind(id.0)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn count_documents(&self, source_id: SourceId) -> Result<u64, StoreError> {
		let count: i64 = sqlx::query_scalar("SELECT count(*) FROM documents WHERE source_id = $1")
			.bind(source_id.0)
			.fetch_one(&self.pool)
			.await
			.map_err(backend)?;
		Ok(count.max(0) as u64)
	}

	async fn replace_chunks(
		&self,
		document_id: DocumentId,
		chunks: &[Chunk],
	) -> Result<(), StoreError> {
		let mut tx = self.pool.begin().await.map_err(backend)?;

		sqlx::query("DELETE FROM chunks WHERE document_id = $1")
			.bind(document_id.0)
			.execute(&mut *tx)
			.await
			.map_err(backend)?;

		for chunk in chunks {
			sqlx::query(
				"INSERT INTO chunks (id, document_id, source_id, content, position, \
					start_char, end_char, metadata) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
			)
			.bind(&chunk.id)
			.bind(chunk.document_id.0)
			.bind(chunk.source_id.0)
			.bind(&chunk.content)
			.bind(chunk.position as i32)
			.bind(chunk.start_char as i64)
			.bind(chunk.end_char as i64)
			.bind(serde_json::Value::Object(chunk.metadata.clone()))
			.execute(&mut *tx)
			.await
			.map_err(backend)?;
		}

		tx.commit().await.map_err(backend)
	}

	async fn delete_chunks(&self, document_id: DocumentId) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM chunks WHERE document_id = $1")
			.bind(document_id.0)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError> {
		let rows: Vec<ChunkRow> = sqlx::query_as(
			"SELECT id, document_id, source_id, content, position, start_char, end_char, metadata \
			FROM chunks WHERE document_id = $1 ORDER BY position",
		)
		.bind(document_id.0)
		.fetch_all(&self.pool)
		.await
		.map_err(backend)?;
		Ok(rows.into_iter().map(Chunk::from).collect())
	}

	async fn create_scheduled_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO scheduled_tasks (id, name, task_type, tenant_id, interval_secs, \
				enabled, next_run, last_run, last_error, payload) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
		)
		.bind(task.id.0)
		.bind(&task.name)
		.bind(&task.task_type)
		.bind(&task.tenant_id)
		.bind(task.interval_secs)
		.bind(task.enabled)
		.bind(task.next_run)
		.bind(task.last_run)
		.bind(&task.last_error)
		.bind(&task.payload)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn list_due_scheduled_tasks(
		&self,
		now: DateTime<Utc>,
	) -> Result<Vec<ScheduledTask>, StoreError> {
		let rows: Vec<ScheduledTaskRow> = sqlx::query_as(
			"SELECT id, name, task_type, tenant_id, interval_secs, enabled, next_run, \
				last_run, last_error, payload \
			FROM scheduled_tasks WHERE enabled AND next_run <= $1 ORDER BY next_run",
		)
		.bind(now)
		.fetch_all(&self.pool)
		.await
		.map_err(backend)?;
		Ok(rows.into_iter().map(ScheduledTask::from).collect())
	}

	async fn record_scheduled_run(
		&self,
		id: TaskId,
		last_run: DateTime<Utc>,
		next_run: DateTime<Utc>,
		last_error: Option<&str>,
	) -> Result<(), StoreError> {
		let result = sqlx::query(
			"UPDATE scheduled_tasks SET last_run = $2, next_run = $3, last_error = $4 WHERE id = $1",
		)
		.bind(id.0)
		.bind(last_run)
		.bind(next_run)
		.bind(last_error)
		.execute(&self.pool)
		.await
		.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn create_installation(&self, installation: &Installation) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO connector_installations (id, name, provider, auth_method, secret, \
				oauth_expires_at, scopes, account_id, created_at, updated_at, last_used_at) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
		)
		.bind(installation.id.0)
		.bind(&installation.name)
		.bind(&installation.provider)
		.bind(installation.auth_method.as_str())
		.bind(&installation.secret)
		.bind(installation.oauth_expires_at)
		.bind(&installation.scopes)
		.bind(&installation.account_id)
		.bind(installation.created_at)
		.bind(installation.updated_at)
		.bind(installation.last_used_at)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn get_installation(&self, id: InstallationId) -> Result<Option<Installation>, StoreError> {
		let row: Option<InstallationRow> = sqlx::query_as(&format!(
			"SELECT {INSTALLATION_COLUMNS} FROM connector_installations WHERE id = $1"
		))
		.bind(id.0)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;
		row.map(Installation::try_from).transpose()
	}

	async fn find_installation_by_account(
		&self,
		provider: &str,
		account_id: &str,
	) -> Result<Option<Installation>, StoreError> {
		let row: Option<InstallationRow> = sqlx::query_as(&format!(
			"SELECT {INSTALLATION_COLUMNS} FROM connector_installations \
			WHERE provider = $1 AND account_id = $2"
		))
		.bind(provider)
		.bind(account_id)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;
		row.map(Installation::try_from).transpose()
	}

	async fn update_installation(&self, installation: &Installation) -> Result<(), StoreError> {
		let result = sqlx::query(
			"UPDATE connector_installations SET name = $2, auth_method = $3, secret = $4, \
				oauth_expires_at = $5, scopes = $6, account_id = $7, updated_at = $8 \
			WHERE id = $1",
		)
		.bind(installation.id.0)
		.bind(&installation.name)
		.bind(installation.auth_method.as_str())
		.bind(&installation.secret)
		.bind(installation.oauth_expires_at)
		.bind(&installation.scopes)
		.bind(&installation.account_id)
		.bind(Utc::now())
		.execute(&self.pool)
		.await
		.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn delete_installation(&self, id: InstallationId) -> Result<(), StoreError> {
		// Referring sources are nulled by ON DELETE SET NULL.
		let result = sqlx::query("DELETE FROM connector_installations WHERE id = $1")
			.bind(id.0)
			.execute(&self.pool)
			.await
			.map_err(backend)?;

		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn touch_installation(
		&self,
		id: InstallationId,
		at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		sqlx::query("UPDATE connector_installations SET last_used_at = $2 WHERE id = $1")
			.bind(id.0)
			.bind(at)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn upsert_provider_config(&self, config: &ProviderConfig) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO provider_configs (provider, secret, auth_url, token_url, user_info_url, \
				scopes, redirect_uri, enabled, created_at, updated_at) \
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
			ON CONFLICT (provider) DO UPDATE SET \
				secret = EXCLUDED.secret, auth_url = EXCLUDED.auth_url, \
				token_url = EXCLUDED.token_url, user_info_url = EXCLUDED.user_info_url, \
				scopes = EXCLUDED.scopes, redirect_uri = EXCLUDED.redirect_uri, \
				enabled = EXCLUDED.enabled, updated_at = EXCLUDED.updated_at",
		)
		.bind(&config.provider)
		.bind(&config.secret)
		.bind(&config.auth_url)
		.bind(&config.token_url)
		.bind(&config.user_info_url)
		.bind(&config.scopes)
		.bind(&config.redirect_uri)
		.bind(config.enabled)
		.bind(config.created_at)
		.bind(config.updated_at)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn get_provider_config(&self, provider: &str) -> Result<Option<ProviderConfig>, StoreError> {
		let row: Option<ProviderConfigRow> = sqlx::query_as(
			"SELECT provider, secret, auth_url, token_url, user_info_url, scopes, redirect_uri, \
				enabled, created_at, updated_at \
			FROM provider_configs WHERE provider = $1",
		)
		.bind(provider)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;
		Ok(row.map(ProviderConfig::from))
	}

	async fn put_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO oauth_states (state, provider, code_verifier, redirect_uri, \
				created_at, expires_at) \
			VALUES ($1, $2, $3, $4, $5, $6)",
		)
		.bind(&state.state)
		.bind(&state.provider)
		.bind(&state.code_verifier)
		.bind(&state.redirect_uri)
		.bind(state.created_at)
		.bind(state.expires_at)
		.execute(&self.pool)
		.await
		.map_err(backend)?;
		Ok(())
	}

	async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, StoreError> {
		// DELETE ... RETURNING makes single-use atomic across processes.
		let row: Option<OAuthStateRow> = sqlx::query_as(
			"DELETE FROM oauth_states WHERE state = $1 \
			RETURNING state, provider, code_verifier, redirect_uri, created_at, expires_at",
		)
		.bind(state)
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;
		Ok(row.map(OAuthState::from))
	}

	async fn purge_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
		let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= $1")
			.bind(now)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(result.rows_affected())
	}

	async fn ping(&self) -> Result<(), StoreError> {
		sqlx::query("SELECT 1")
			.execute(&self.pool)
			.await
			.map(|_| ())
			.map_err(backend)
	}
}
