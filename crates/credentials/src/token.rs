//! Token providers: handles that always yield a usable bearer token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{CredentialError, TokenGrant};

/// Refresh when the access token expires within this window.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Yields a bearer token valid for provider API calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
	async fn access_token(&self) -> Result<String, CredentialError>;
}

/// Provider for static credentials: api keys, personal access tokens,
/// service-account tokens. The token is the stored value.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
	token: String,
}

impl StaticTokenProvider {
	pub fn new(token: impl Into<String>) -> Self {
		Self { token: token.into() }
	}
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
	async fn access_token(&self) -> Result<String, CredentialError> {
		Ok(self.token.clone())
	}
}

/// Live OAuth token state held by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
	pub access_token: String,
	/// Empty means the access token is not refreshable and its
	/// validity ends at `expires_at`.
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthTokens {
	fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
		match self.expires_at {
			Some(expires_at) => {
				expires_at - now < chrono::Duration::seconds(REFRESH_MARGIN.as_secs() as i64)
			}
			None => false,
		}
	}

	fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|e| now >= e)
	}
}

/// Exchanges a refresh token for fresh tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
	async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, CredentialError>;
}

/// Receives refreshed tokens for persistence.
///
/// Persistence is best-effort: the refreshed token is usable in memory
/// either way and will be re-persisted on the next refresh.
#[async_trait]
pub trait SecretSink: Send + Sync {
	async fn persist(&self, tokens: &OAuthTokens) -> Result<(), CredentialError>;
}

/// OAuth token provider with transparent refresh.
pub struct OAuthTokenProvider {
	tokens: Mutex<OAuthTokens>,
	refresher: Arc<dyn TokenRefresher>,
	sink: Option<Arc<dyn SecretSink>>,
}

impl OAuthTokenProvider {
	pub fn new(
		tokens: OAuthTokens,
		refresher: Arc<dyn TokenRefresher>,
		sink: Option<Arc<dyn SecretSink>>,
	) -> Self {
		Self {
			tokens: Mutex::new(tokens),
			refresher,
			sink,
		}
	}

	/// Snapshot of the current token state.
	pub async fn tokens(&self) -> OAuthTokens {
		self.tokens.lock().await.clone()
	}
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
	async fn access_token(&self) -> Result<String, CredentialError> {
		let mut tokens = self.tokens.lock().await;
		let now = Utc::now();

		if !tokens.needs_refresh(now) {
			return Ok(tokens.access_token.clone());
		}

		let Some(refresh_token) = tokens.refresh_token.clone().filter(|t| !t.is_empty()) else {
			if tokens.is_expired(now) {
				return Err(CredentialError::TokenExpired);
			}
			return Ok(tokens.access_token.clone());
		};

		let grant = self.refresher.refresh(&refresh_token).await?;

		tokens.access_token = grant.access_token.clone();
		if let Some(new_refresh) = grant.refresh_token {
			tokens.refresh_token = Some(new_refresh);
		}
		tokens.expires_at = grant.expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs));

		if let Some(sink) = &self.sink
			&& let Err(err) = sink.persist(&tokens).await
		{
			tracing::warn!(error = %err, "persisting refreshed tokens failed; continuing with in-memory tokens");
		}

		Ok(tokens.access_token.clone())
	}
}
