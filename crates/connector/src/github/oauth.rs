//! GitHub OAuth handler.

use std::time::Duration;

use async_trait::async_trait;
use sercha_credentials::{
	AccountIdentity, CredentialError, OAuthAppConfig, OAuthDefaults, OAuthHandler, TokenGrant,
};

use super::wire;

const AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_URL: &str = "https://api.github.com/user";
const USER_AGENT: &str = "sercha";

/// OAuth operations against GitHub's endpoints.
pub struct GithubOAuthHandler {
	http: reqwest::Client,
	user_info_url: String,
}

impl GithubOAuthHandler {
	pub fn new() -> Self {
		Self {
			http: reqwest::Client::builder()
				.timeout(Duration::from_secs(30))
				.build()
				.unwrap_or_default(),
			user_info_url: USER_URL.to_string(),
		}
	}

	/// Point the user-info call elsewhere. Test hook.
	#[must_use]
	pub fn with_user_info_url(mut self, url: impl Into<String>) -> Self {
		self.user_info_url = url.into();
		self
	}

	async fn token_request(
		&self,
		token_url: &str,
		form: &[(&str, &str)],
	) -> Result<TokenGrant, CredentialError> {
		let response = self
			.http
			.post(token_url)
			.header(reqwest::header::ACCEPT, "application/json")
			.form(form)
			.send()
			.await
			.map_err(|e| CredentialError::Network(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let text = response.text().await.unwrap_or_default();
			return Err(CredentialError::TokenExchange(format!("status {status}: {text}")));
		}

		let tokens: wire::TokenResponse = response
			.json()
			.await
			.map_err(|e| CredentialError::TokenExchange(format!("invalid response: {e}")))?;

		if let Some(error) = tokens.error {
			let detail = tokens.error_description.unwrap_or_default();
			return Err(CredentialError::TokenExchange(format!("{error}: {detail}")));
		}

		let access_token = tokens
			.access_token
			.ok_or_else(|| CredentialError::TokenExchange("response carried no access token".into()))?;

		Ok(TokenGrant {
			access_token,
			refresh_token: tokens.refresh_token,
			expires_in: tokens.expires_in,
			scopes: tokens
				.scope
				.map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
				.unwrap_or_default(),
		})
	}
}

impl Default for GithubOAuthHandler {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl OAuthHandler for GithubOAuthHandler {
	fn provider(&self) -> &str {
		"github"
	}

	fn defaults(&self) -> OAuthDefaults {
		OAuthDefaults {
			auth_url: AUTH_URL.to_string(),
			token_url: TOKEN_URL.to_string(),
			user_info_url: USER_URL.to_string(),
			scopes: vec!["repo".to_string(), "read:user".to_string()],
			supports_pkce: true,
		}
	}

	async fn exchange_code(
		&self,
		config: &OAuthAppConfig,
		code: &str,
		verifier: &str,
	) -> Result<TokenGrant, CredentialError> {
		self.token_request(
			&config.token_url,
			&[
				("grant_type", "authorization_code"),
				("client_id", &config.client_id),
				("client_secret", &config.client_secret),
				("redirect_uri", &config.redirect_uri),
				("code", code),
				("code_verifier", verifier),
			],
		)
		.await
	}

	async fn refresh(
		&self,
		config: &OAuthAppConfig,
		refresh_token: &str,
	) -> Result<TokenGrant, CredentialError> {
		self.token_request(
			&config.token_url,
			&[
				("grant_type", "refresh_token"),
				("client_id", &config.client_id),
				("client_secret", &config.client_secret),
				("refresh_token", refresh_token),
			],
		)
		.await
		.map_err(|err| match err {
			CredentialError::TokenExchange(msg) => CredentialError::TokenRefresh(msg),
			other => other,
		})
	}

	async fn fetch_account(&self, access_token: &str) -> Result<AccountIdentity, CredentialError> {
		let response = self
			.http
			.get(&self.user_info_url)
			.bearer_auth(access_token)
			.header(reqwest::header::USER_AGENT, USER_AGENT)
			.header(reqwest::header::ACCEPT, "application/json")
			.send()
			.await
			.map_err(|e| CredentialError::Network(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let text = response.text().await.unwrap_or_default();
			return Err(CredentialError::TokenExchange(format!(
				"user info status {status}: {text}"
			)));
		}

		let account: wire::Account = response
			.json()
			.await
			.map_err(|e| CredentialError::TokenExchange(format!("invalid user info: {e}")))?;

		Ok(AccountIdentity {
			id: account.id.to_string(),
			name: Some(account.name.unwrap_or(account.login)),
		})
	}
}
