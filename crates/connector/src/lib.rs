//! Pluggable provider connectors.
//!
//! Three abstractions exist per provider: a [`ConnectorBuilder`]
//! registered with the factory under the provider tag, an
//! [`sercha_credentials::OAuthHandler`] for the shared OAuth flow, and
//! a [`ContainerLister`] for cursor-paginated container discovery.
//! Builders construct [`Connector`]s bound to one container and one
//! token provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sercha_credentials::{CredentialError, OAuthHandler, TokenProvider};
use sercha_types::{Change, ContainerPage, DocumentInfo, Source};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod github;
pub mod http;
pub mod normalise;

pub use self::github::GithubConnectorBuilder;
pub use self::http::ProviderClient;
pub use self::normalise::GithubIssueNormaliser;

/// Errors from connectors and their HTTP plumbing.
#[derive(Debug, Error)]
pub enum ConnectorError {
	/// The source configuration is invalid for this provider.
	#[error("invalid config: {0}")]
	InvalidConfig(String),

	/// No builder is registered under the provider tag.
	#[error("unsupported provider {0:?}")]
	UnsupportedProvider(String),

	/// The provider rejected the request (4xx). Not retried.
	#[error("provider status {status}: {message}")]
	Provider { status: u16, message: String },

	/// Network failure, 5xx after retries, or an over-long rate limit.
	/// The task layer retries these.
	#[error("transient: {0}")]
	Transient(String),

	/// Credential material was unusable.
	#[error(transparent)]
	Credential(#[from] CredentialError),

	/// Provider response could not be decoded.
	#[error("decode: {0}")]
	Codec(String),

	/// The operation observed cancellation. Never rewrapped.
	#[error("cancelled")]
	Cancelled,
}

/// A per-provider, per-container document producer.
#[async_trait]
pub trait Connector: Send + Sync {
	/// Provider tag, e.g. `"github"`.
	fn provider(&self) -> &str;

	/// Check a source configuration without touching the network.
	fn validate_config(
		&self,
		config: &serde_json::Map<String, serde_json::Value>,
	) -> Result<(), ConnectorError>;

	/// Fetch changes newer than `cursor` (all history when `None`).
	///
	/// Returns the changes and the cursor to persist. Cursor semantics
	/// are provider-defined and at-least-once: replaying a cursor may
	/// repeat changes, which downstream external-id idempotence
	/// absorbs.
	async fn fetch_changes(
		&self,
		source: &Source,
		cursor: Option<&str>,
		cancel: &CancellationToken,
	) -> Result<(Vec<Change>, Option<String>), ConnectorError>;

	/// Fetch one item by external id, where the provider supports it.
	async fn fetch_document(
		&self,
		source: &Source,
		external_id: &str,
		cancel: &CancellationToken,
	) -> Result<Option<(DocumentInfo, String)>, ConnectorError>;

	/// Verify the credentials and container are reachable.
	async fn test_connection(
		&self,
		source: &Source,
		cancel: &CancellationToken,
	) -> Result<(), ConnectorError>;
}

/// Lists containers visible to an installation, one page per call.
#[async_trait]
pub trait ContainerLister: Send + Sync {
	async fn list(
		&self,
		cursor: Option<&str>,
		cancel: &CancellationToken,
	) -> Result<ContainerPage, ConnectorError>;
}

/// Builds connectors for one provider.
#[async_trait]
pub trait ConnectorBuilder: Send + Sync {
	fn provider(&self) -> &str;

	fn supports_oauth(&self) -> bool;

	/// Whether sources may select containers for this provider.
	fn supports_containers(&self) -> bool;

	/// The provider's OAuth handler, when OAuth is supported.
	fn oauth_handler(&self) -> Option<Arc<dyn OAuthHandler>>;

	/// Construct a connector bound to `container_id` (empty for
	/// providers without container selection).
	async fn build(
		&self,
		token: Arc<dyn TokenProvider>,
		container_id: &str,
	) -> Result<Box<dyn Connector>, ConnectorError>;

	/// A container lister over the installation's visibility, when
	/// containers are supported.
	fn container_lister(&self, token: Arc<dyn TokenProvider>) -> Option<Box<dyn ContainerLister>>;
}

/// Registry of connector builders by provider tag.
///
/// Built once at startup; lookups are concurrent reads.
pub struct ConnectorFactory {
	builders: RwLock<HashMap<String, Arc<dyn ConnectorBuilder>>>,
}

impl ConnectorFactory {
	pub fn new() -> Self {
		Self {
			builders: RwLock::new(HashMap::new()),
		}
	}

	/// Registry preloaded with the built-in providers.
	pub fn with_defaults() -> Self {
		let factory = Self::new();
		factory.register(Arc::new(GithubConnectorBuilder::new()));
		factory
	}

	pub fn register(&self, builder: Arc<dyn ConnectorBuilder>) {
		self.builders.write().insert(builder.provider().to_string(), builder);
	}

	pub fn get(&self, provider: &str) -> Result<Arc<dyn ConnectorBuilder>, ConnectorError> {
		self.builders
			.read()
			.get(provider)
			.cloned()
			.ok_or_else(|| ConnectorError::UnsupportedProvider(provider.to_string()))
	}

	/// Registered provider tags, sorted.
	pub fn providers(&self) -> Vec<String> {
		let mut tags: Vec<String> = self.builders.read().keys().cloned().collect();
		tags.sort();
		tags
	}
}

impl Default for ConnectorFactory {
	fn default() -> Self {
		Self::with_defaults()
	}
}

impl std::fmt::Debug for ConnectorFactory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectorFactory").field("providers", &self.providers()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn factory_defaults_include_github() {
		let factory = ConnectorFactory::with_defaults();
		assert_eq!(factory.providers(), vec!["github".to_string()]);
		assert!(factory.get("github").is_ok());
		assert!(matches!(
			factory.get("gitlab"),
			Err(ConnectorError::UnsupportedProvider(_))
		));
	}
}
