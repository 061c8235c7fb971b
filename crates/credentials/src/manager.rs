//! The installation and credential store façade.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use sercha_secrets::SecretBox;
use sercha_store::MetadataStore;
use sercha_types::{AuthMethod, Installation, InstallationId, OAuthState, ProviderConfig};
use serde::{Deserialize, Serialize};

use crate::oauth::{OAuthAppConfig, OAuthHandler, PkceCodes, authorization_url, generate_state};
use crate::token::{OAuthTokenProvider, OAuthTokens, SecretSink, StaticTokenProvider, TokenProvider, TokenRefresher};
use crate::{CredentialError, TokenGrant};

/// OAuth states are honored for ten minutes.
const OAUTH_STATE_TTL_SECS: i64 = 600;

/// Decrypted secret payload stored per installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SecretPayload {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	access_token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	refresh_token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	api_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	service_account: Option<serde_json::Value>,
}

/// Decrypted OAuth application credentials from a provider config row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProviderAppSecret {
	client_id: String,
	client_secret: String,
}

/// Parameters for creating an installation with a static credential.
#[derive(Debug, Clone)]
pub struct NewInstallation {
	pub name: String,
	pub provider: String,
	pub auth_method: AuthMethod,
	/// The api key, personal access token, or service-account token.
	pub token: String,
	pub scopes: Vec<String>,
}

/// An authorization URL plus the state bound to it.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
	pub url: String,
	pub state: String,
}

/// Persists installations with secrets encrypted at rest, produces
/// token providers, and drives the shared OAuth flow.
pub struct InstallationManager {
	store: Arc<dyn MetadataStore>,
	secrets: SecretBox,
	handlers: RwLock<HashMap<String, Arc<dyn OAuthHandler>>>,
}

impl InstallationManager {
	pub fn new(store: Arc<dyn MetadataStore>, secrets: SecretBox) -> Self {
		Self {
			store,
			secrets,
			handlers: RwLock::new(HashMap::new()),
		}
	}

	/// Register a provider's OAuth handler. Called once at startup.
	pub fn register_handler(&self, handler: Arc<dyn OAuthHandler>) {
		self.handlers.write().insert(handler.provider().to_string(), handler);
	}

	fn handler(&self, provider: &str) -> Result<Arc<dyn OAuthHandler>, CredentialError> {
		self.handlers
			.read()
			.get(provider)
			.cloned()
			.ok_or_else(|| CredentialError::UnsupportedProvider(provider.to_string()))
	}

	/// Store or update a provider's OAuth application credentials,
	/// filling endpoints from the handler defaults.
	pub async fn configure_provider(
		&self,
		provider: &str,
		client_id: &str,
		client_secret: &str,
		redirect_uri: &str,
	) -> Result<(), CredentialError> {
		let handler = self.handler(provider)?;
		let defaults = handler.defaults();
		let now = Utc::now();

		let secret = self.secrets.encrypt_json(&ProviderAppSecret {
			client_id: client_id.to_string(),
			client_secret: client_secret.to_string(),
		})?;

		self.store
			.upsert_provider_config(&ProviderConfig {
				provider: provider.to_string(),
				secret,
				auth_url: defaults.auth_url,
				token_url: defaults.token_url,
				user_info_url: defaults.user_info_url,
				scopes: defaults.scopes,
				redirect_uri: redirect_uri.to_string(),
				enabled: true,
				created_at: now,
				updated_at: now,
			})
			.await?;
		Ok(())
	}

	async fn oauth_app_config(&self, provider: &str) -> Result<OAuthAppConfig, CredentialError> {
		let handler = self.handler(provider)?;
		let defaults = handler.defaults();

		let config = self
			.store
			.get_provider_config(provider)
			.await?
			.filter(|c| c.enabled)
			.ok_or(CredentialError::MissingCredential("provider config"))?;

		let app: ProviderAppSecret = self.secrets.decrypt_json(&config.secret)?;

		let or_default = |value: String, default: String| {
			if value.is_empty() { default } else { value }
		};

		Ok(OAuthAppConfig {
			client_id: app.client_id,
			client_secret: app.client_secret,
			auth_url: or_default(config.auth_url, defaults.auth_url),
			token_url: or_default(config.token_url, defaults.token_url),
			user_info_url: or_default(config.user_info_url, defaults.user_info_url),
			scopes: if config.scopes.is_empty() { defaults.scopes } else { config.scopes },
			redirect_uri: config.redirect_uri,
			supports_pkce: defaults.supports_pkce,
		})
	}

	/// Create an installation holding a static credential.
	pub async fn create_installation(
		&self,
		new: NewInstallation,
	) -> Result<Installation, CredentialError> {
		let payload = match new.auth_method {
			AuthMethod::ApiKey => SecretPayload {
				api_key: Some(new.token),
				..SecretPayload::default()
			},
			AuthMethod::PersonalAccessToken | AuthMethod::ServiceAccount => SecretPayload {
				access_token: Some(new.token),
				..SecretPayload::default()
			},
			AuthMethod::Oauth2 => {
				return Err(CredentialError::UnsupportedAuthMethod(
					"oauth2 installations are created by the callback flow".into(),
				));
			}
		};

		let secret = self.secrets.encrypt_json(&payload)?;
		let mut installation = Installation::new(new.name, new.provider, new.auth_method, secret);
		installation.scopes = new.scopes;

		self.store.create_installation(&installation).await?;
		Ok(installation)
	}

	pub async fn get_installation(
		&self,
		id: InstallationId,
	) -> Result<Option<Installation>, CredentialError> {
		Ok(self.store.get_installation(id).await?)
	}

	pub async fn delete_installation(&self, id: InstallationId) -> Result<(), CredentialError> {
		Ok(self.store.delete_installation(id).await?)
	}

	/// Produce a token provider for an installation.
	pub async fn token_provider(
		&self,
		id: InstallationId,
	) -> Result<Arc<dyn TokenProvider>, CredentialError> {
		let installation = self
			.store
			.get_installation(id)
			.await?
			.ok_or(CredentialError::NotFound)?;

		let payload: SecretPayload = self.secrets.decrypt_json(&installation.secret)?;

		if let Err(err) = self.store.touch_installation(id, Utc::now()).await {
			tracing::debug!(error = %err, installation_id = %id, "touch last_used failed");
		}

		match installation.auth_method {
			AuthMethod::ApiKey => {
				let key = payload
					.api_key
					.ok_or(CredentialError::MissingCredential("api key"))?;
				Ok(Arc::new(StaticTokenProvider::new(key)))
			}
			AuthMethod::PersonalAccessToken | AuthMethod::ServiceAccount => {
				let token = payload
					.access_token
					.ok_or(CredentialError::MissingCredential("access token"))?;
				Ok(Arc::new(StaticTokenProvider::new(token)))
			}
			AuthMethod::Oauth2 => {
				let access_token = payload
					.access_token
					.clone()
					.ok_or(CredentialError::MissingCredential("access token"))?;

				let config = self.oauth_app_config(&installation.provider).await?;
				let handler = self.handler(&installation.provider)?;

				let tokens = OAuthTokens {
					access_token,
					refresh_token: payload.refresh_token.clone(),
					expires_at: installation.oauth_expires_at,
				};
				let refresher = Arc::new(HandlerRefresher { handler, config });
				let sink = Arc::new(StoreSink {
					store: Arc::clone(&self.store),
					secrets: self.secrets.clone(),
					installation,
					payload,
				});

				Ok(Arc::new(OAuthTokenProvider::new(tokens, refresher, Some(sink))))
			}
		}
	}

	/// Start an OAuth authorization: build the URL and persist the
	/// single-use state record.
	pub async fn begin_authorization(
		&self,
		provider: &str,
	) -> Result<AuthorizationRequest, CredentialError> {
		let config = self.oauth_app_config(provider).await?;
		let pkce = PkceCodes::generate();
		let state = generate_state();
		let now = Utc::now();

		self.store
			.put_oauth_state(&OAuthState {
				state: state.clone(),
				provider: provider.to_string(),
				code_verifier: pkce.verifier,
				redirect_uri: config.redirect_uri.clone(),
				created_at: now,
				expires_at: now + chrono::Duration::seconds(OAUTH_STATE_TTL_SECS),
			})
			.await?;

		let url = authorization_url(&config, &state, &pkce.challenge)?;
		Ok(AuthorizationRequest { url, state })
	}

	/// Finish an OAuth authorization from the callback's code and state.
	///
	/// The state is consumed atomically; a replayed callback fails. The
	/// resulting installation is deduplicated by `(provider, account)`.
	pub async fn complete_authorization(
		&self,
		state: &str,
		code: &str,
	) -> Result<Installation, CredentialError> {
		let record = self
			.store
			.take_oauth_state(state)
			.await?
			.ok_or(CredentialError::InvalidOAuthState)?;

		let now = Utc::now();
		if record.is_expired(now) {
			return Err(CredentialError::InvalidOAuthState);
		}

		let handler = self.handler(&record.provider)?;
		let config = self.oauth_app_config(&record.provider).await?;

		let grant = handler.exchange_code(&config, code, &record.code_verifier).await?;
		let account = handler.fetch_account(&grant.access_token).await?;

		let expires_at = grant.expires_in.map(|secs| now + chrono::Duration::seconds(secs));
		let scopes = if grant.scopes.is_empty() { config.scopes.clone() } else { grant.scopes.clone() };
		let secret = self.secrets.encrypt_json(&SecretPayload {
			access_token: Some(grant.access_token),
			refresh_token: grant.refresh_token,
			..SecretPayload::default()
		})?;

		if let Some(mut existing) = self
			.store
			.find_installation_by_account(&record.provider, &account.id)
			.await?
		{
			existing.secret = secret;
			existing.oauth_expires_at = expires_at;
			existing.scopes = scopes;
			self.store.update_installation(&existing).await?;
			return Ok(existing);
		}

		let name = account.name.unwrap_or_else(|| format!("{} ({})", record.provider, account.id));
		let mut installation =
			Installation::new(name, record.provider.clone(), AuthMethod::Oauth2, secret);
		installation.oauth_expires_at = expires_at;
		installation.scopes = scopes;
		installation.account_id = Some(account.id);

		self.store.create_installation(&installation).await?;
		Ok(installation)
	}
}

impl std::fmt::Debug for InstallationManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InstallationManager")
			.field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}

struct HandlerRefresher {
	handler: Arc<dyn OAuthHandler>,
	config: OAuthAppConfig,
}

#[async_trait::async_trait]
impl TokenRefresher for HandlerRefresher {
	async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, CredentialError> {
		self.handler.refresh(&self.config, refresh_token).await
	}
}

struct StoreSink {
	store: Arc<dyn MetadataStore>,
	secrets: SecretBox,
	installation: Installation,
	payload: SecretPayload,
}

#[async_trait::async_trait]
impl SecretSink for StoreSink {
	async fn persist(&self, tokens: &OAuthTokens) -> Result<(), CredentialError> {
		let payload = SecretPayload {
			access_token: Some(tokens.access_token.clone()),
			refresh_token: tokens.refresh_token.clone(),
			..self.payload.clone()
		};

		let mut installation = self.installation.clone();
		installation.secret = self.secrets.encrypt_json(&payload)?;
		installation.oauth_expires_at = tokens.expires_at;

		self.store.update_installation(&installation).await?;
		Ok(())
	}
}
