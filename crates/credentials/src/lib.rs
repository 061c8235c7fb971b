//! Installations, token providers, and the shared OAuth flow.
//!
//! The installation manager persists per-provider credentials encrypted
//! at rest and hands out [`TokenProvider`]s that always yield a usable
//! bearer token, refreshing OAuth access tokens shortly before they
//! expire. The OAuth authorization flow uses PKCE (S256) with a
//! single-use server-side state record.

mod manager;
mod oauth;
mod token;

pub use manager::{AuthorizationRequest, InstallationManager, NewInstallation};
pub use oauth::{
	AccountIdentity, OAuthAppConfig, OAuthDefaults, OAuthHandler, PkceCodes, TokenGrant,
	authorization_url, generate_state,
};
pub use token::{
	OAuthTokenProvider, OAuthTokens, REFRESH_MARGIN, SecretSink, StaticTokenProvider,
	TokenProvider, TokenRefresher,
};

use sercha_secrets::SecretError;
use sercha_store::StoreError;
use thiserror::Error;

/// Errors from credential management.
#[derive(Debug, Error)]
pub enum CredentialError {
	#[error("installation not found")]
	NotFound,

	/// No OAuth handler is registered for the provider tag.
	#[error("unsupported provider {0:?}")]
	UnsupportedProvider(String),

	/// The installation's auth method cannot produce a token here.
	#[error("unsupported auth method {0:?}")]
	UnsupportedAuthMethod(String),

	/// The decrypted payload lacks the credential the auth method needs.
	#[error("missing credential: {0}")]
	MissingCredential(&'static str),

	/// The secret blob could not be opened; the installation must be
	/// re-authorized.
	#[error("secret: {0}")]
	Secret(#[from] SecretError),

	#[error("store: {0}")]
	Store(#[from] StoreError),

	/// The OAuth callback carried an unknown, reused, or expired state.
	#[error("invalid or expired oauth state")]
	InvalidOAuthState,

	#[error("token exchange: {0}")]
	TokenExchange(String),

	#[error("refresh token: {0}")]
	TokenRefresh(String),

	/// The access token is past expiry and no refresh token exists.
	#[error("access token expired and not refreshable")]
	TokenExpired,

	#[error("network: {0}")]
	Network(String),
}
