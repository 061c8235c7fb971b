//! Credential records: installations, provider configs, OAuth state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::InstallationId;

/// How an installation authenticates against its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
	Oauth2,
	ApiKey,
	PersonalAccessToken,
	ServiceAccount,
}

impl AuthMethod {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Oauth2 => "oauth2",
			Self::ApiKey => "api-key",
			Self::PersonalAccessToken => "personal-access-token",
			Self::ServiceAccount => "service-account",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"oauth2" => Some(Self::Oauth2),
			"api-key" => Some(Self::ApiKey),
			"personal-access-token" => Some(Self::PersonalAccessToken),
			"service-account" => Some(Self::ServiceAccount),
			_ => None,
		}
	}
}

/// A persisted set of credentials for one account in one provider.
///
/// The `secret` field is the encrypted blob produced by the secret box;
/// plaintext credentials never reach storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
	pub id: InstallationId,
	pub name: String,
	pub provider: String,
	pub auth_method: AuthMethod,
	/// Versioned ciphertext: `version || nonce || ciphertext+tag`.
	pub secret: Vec<u8>,
	/// Access-token expiry, OAuth only.
	pub oauth_expires_at: Option<DateTime<Utc>>,
	pub scopes: Vec<String>,
	/// Stable account identifier used to deduplicate installations.
	pub account_id: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub last_used_at: Option<DateTime<Utc>>,
}

impl Installation {
	pub fn new(
		name: impl Into<String>,
		provider: impl Into<String>,
		auth_method: AuthMethod,
		secret: Vec<u8>,
	) -> Self {
		let now = Utc::now();
		Self {
			id: InstallationId(Uuid::new_v4()),
			name: name.into(),
			provider: provider.into(),
			auth_method,
			secret,
			oauth_expires_at: None,
			scopes: Vec::new(),
			account_id: None,
			created_at: now,
			updated_at: now,
			last_used_at: None,
		}
	}
}

/// OAuth application credentials and endpoints for one provider tag.
///
/// Exactly one row per provider. The `secret` blob holds the client id
/// and client secret; endpoints and scopes are stored in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
	pub provider: String,
	/// Encrypted client id/secret payload.
	pub secret: Vec<u8>,
	pub auth_url: String,
	pub token_url: String,
	pub user_info_url: String,
	pub scopes: Vec<String>,
	pub redirect_uri: String,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Short-lived single-use OAuth authorization state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
	/// Random state token bound to the authorization request.
	pub state: String,
	pub provider: String,
	/// PKCE code verifier, stored in plaintext for the callback exchange.
	pub code_verifier: String,
	pub redirect_uri: String,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl OAuthState {
	/// Whether the state has outlived its ten-minute window.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_method_round_trips() {
		for method in [
			AuthMethod::Oauth2,
			AuthMethod::ApiKey,
			AuthMethod::PersonalAccessToken,
			AuthMethod::ServiceAccount,
		] {
			assert_eq!(AuthMethod::parse(method.as_str()), Some(method));
		}
		assert_eq!(AuthMethod::parse("password"), None);
	}

	#[test]
	fn oauth_state_expiry() {
		let now = Utc::now();
		let state = OAuthState {
			state: "s".into(),
			provider: "github".into(),
			code_verifier: "v".into(),
			redirect_uri: "http://localhost/cb".into(),
			created_at: now,
			expires_at: now + chrono::Duration::minutes(10),
		};
		assert!(!state.is_expired(now));
		assert!(state.is_expired(now + chrono::Duration::minutes(10)));
	}
}
