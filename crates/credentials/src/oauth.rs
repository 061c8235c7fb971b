//! PKCE material and the per-provider OAuth handler contract.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CredentialError;

/// PKCE verifier/challenge pair, S256 method (RFC 7636).
#[derive(Debug, Clone)]
pub struct PkceCodes {
	/// URL-safe base64, 43-128 characters.
	pub verifier: String,
	/// `base64url(SHA-256(verifier))`.
	pub challenge: String,
}

impl PkceCodes {
	/// Generate a fresh pair from 64 random bytes.
	pub fn generate() -> Self {
		let mut bytes = [0u8; 64];
		rand::rng().fill_bytes(&mut bytes);

		let verifier = URL_SAFE_NO_PAD.encode(bytes);
		let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

		Self { verifier, challenge }
	}
}

/// Random `state` parameter binding an authorization request to its
/// callback.
pub fn generate_state() -> String {
	let mut bytes = [0u8; 32];
	rand::rng().fill_bytes(&mut bytes);
	URL_SAFE_NO_PAD.encode(bytes)
}

/// Provider-level OAuth endpoints a handler ships as fallbacks when no
/// provider config row overrides them.
#[derive(Debug, Clone)]
pub struct OAuthDefaults {
	pub auth_url: String,
	pub token_url: String,
	pub user_info_url: String,
	pub scopes: Vec<String>,
	pub supports_pkce: bool,
}

/// Resolved OAuth application settings for one flow.
#[derive(Debug, Clone)]
pub struct OAuthAppConfig {
	pub client_id: String,
	pub client_secret: String,
	pub auth_url: String,
	pub token_url: String,
	pub user_info_url: String,
	pub scopes: Vec<String>,
	pub redirect_uri: String,
	pub supports_pkce: bool,
}

/// Tokens returned by a code exchange or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	/// Seconds until the access token expires, when the provider says.
	#[serde(default)]
	pub expires_in: Option<i64>,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Stable identity of the authorizing account, used to deduplicate
/// installations.
#[derive(Debug, Clone)]
pub struct AccountIdentity {
	pub id: String,
	pub name: Option<String>,
}

/// Per-provider OAuth operations.
#[async_trait]
pub trait OAuthHandler: Send + Sync {
	fn provider(&self) -> &str;

	fn defaults(&self) -> OAuthDefaults;

	/// Exchange an authorization code (plus the PKCE verifier) for
	/// tokens at the provider's token endpoint.
	async fn exchange_code(
		&self,
		config: &OAuthAppConfig,
		code: &str,
		verifier: &str,
	) -> Result<TokenGrant, CredentialError>;

	/// Obtain fresh tokens from a refresh token.
	async fn refresh(
		&self,
		config: &OAuthAppConfig,
		refresh_token: &str,
	) -> Result<TokenGrant, CredentialError>;

	/// Fetch the stable account identity behind an access token.
	async fn fetch_account(&self, access_token: &str) -> Result<AccountIdentity, CredentialError>;
}

/// Build the provider authorization URL for one flow.
pub fn authorization_url(
	config: &OAuthAppConfig,
	state: &str,
	challenge: &str,
) -> Result<String, CredentialError> {
	let mut params = vec![
		("client_id", config.client_id.as_str()),
		("redirect_uri", config.redirect_uri.as_str()),
		("response_type", "code"),
		("state", state),
	];

	let scope = config.scopes.join(" ");
	if !scope.is_empty() {
		params.push(("scope", scope.as_str()));
	}
	if config.supports_pkce {
		params.push(("code_challenge", challenge));
		params.push(("code_challenge_method", "S256"));
	}

	let url = url::Url::parse_with_params(&config.auth_url, &params)
		.map_err(|e| CredentialError::TokenExchange(format!("bad auth url: {e}")))?;
	Ok(url.into())
}
