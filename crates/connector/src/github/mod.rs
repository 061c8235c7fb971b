//! GitHub connector: issues and pull requests per repository.
//!
//! Containers are repositories (`owner/name`). Incremental sync walks
//! the issues API with a `since` cursor (RFC 3339 of the newest
//! `updated_at` seen), which covers both issues and pull requests. The
//! API does not expose deletions, so the connector emits only added and
//! modified changes; document removal happens when a source is deleted.

mod oauth;
mod wire;

pub use oauth::GithubOAuthHandler;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sercha_credentials::{OAuthHandler, TokenProvider};
use sercha_types::{Change, ChangeKind, ContainerInfo, ContainerPage, DocumentInfo, Source};
use tokio_util::sync::CancellationToken;

use crate::http::ProviderClient;
use crate::{Connector, ConnectorBuilder, ConnectorError, ContainerLister};

/// MIME tag for issue documents.
pub const MIME_ISSUE: &str = "application/vnd.sercha.github.issue";
/// MIME tag for pull-request documents.
pub const MIME_PULL_REQUEST: &str = "application/vnd.sercha.github.pull-request";

const DEFAULT_API_BASE: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;
/// Pages fetched per `fetch_changes` call; the orchestrator keeps
/// calling until the cursor stops moving.
const MAX_PAGES: usize = 10;
const USER_AGENT: &str = "sercha";

/// Builder for GitHub connectors.
pub struct GithubConnectorBuilder {
	api_base: String,
	handler: Arc<GithubOAuthHandler>,
}

impl GithubConnectorBuilder {
	pub fn new() -> Self {
		Self {
			api_base: DEFAULT_API_BASE.to_string(),
			handler: Arc::new(GithubOAuthHandler::new()),
		}
	}

	/// Point the connector at a different API host. Test hook.
	#[must_use]
	pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
		self.api_base = trim_slash(api_base.into());
		self
	}
}

impl Default for GithubConnectorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn trim_slash(mut url: String) -> String {
	while url.ends_with('/') {
		url.pop();
	}
	url
}

/// Split and validate an `owner/name` container id.
fn parse_container(container_id: &str) -> Result<(&str, &str), ConnectorError> {
	match container_id.split_once('/') {
		Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
			Ok((owner, name))
		}
		_ => Err(ConnectorError::InvalidConfig(format!(
			"container must be owner/repo, got {container_id:?}"
		))),
	}
}

#[async_trait]
impl ConnectorBuilder for GithubConnectorBuilder {
	fn provider(&self) -> &str {
		"github"
	}

	fn supports_oauth(&self) -> bool {
		true
	}

	fn supports_containers(&self) -> bool {
		true
	}

	fn oauth_handler(&self) -> Option<Arc<dyn OAuthHandler>> {
		Some(self.handler.clone())
	}

	async fn build(
		&self,
		token: Arc<dyn TokenProvider>,
		container_id: &str,
	) -> Result<Box<dyn Connector>, ConnectorError> {
		parse_container(container_id)?;
		Ok(Box::new(GithubConnector {
			client: ProviderClient::new(USER_AGENT)?,
			token,
			api_base: self.api_base.clone(),
			container: container_id.to_string(),
		}))
	}

	fn container_lister(&self, token: Arc<dyn TokenProvider>) -> Option<Box<dyn ContainerLister>> {
		Some(Box::new(GithubContainerLister {
			client: ProviderClient::new(USER_AGENT).ok()?,
			token,
			api_base: self.api_base.clone(),
		}))
	}
}

/// Connector bound to one repository.
struct GithubConnector {
	client: ProviderClient,
	token: Arc<dyn TokenProvider>,
	api_base: String,
	container: String,
}

impl GithubConnector {
	fn external_id(&self, number: u64) -> String {
		format!("{}/issues/{number}", self.container)
	}

	fn document_info(&self, issue: &wire::Issue) -> DocumentInfo {
		let mime_type = if issue.pull_request.is_some() {
			MIME_PULL_REQUEST
		} else {
			MIME_ISSUE
		};

		let mut metadata = serde_json::Map::new();
		metadata.insert("number".into(), issue.number.into());
		metadata.insert("state".into(), issue.state.clone().into());
		metadata.insert("container".into(), self.container.clone().into());
		if let Some(user) = &issue.user {
			metadata.insert("author".into(), user.login.clone().into());
		}
		if !issue.labels.is_empty() {
			let labels: Vec<serde_json::Value> =
				issue.labels.iter().map(|l| l.name.clone().into()).collect();
			metadata.insert("labels".into(), labels.into());
		}

		DocumentInfo {
			title: issue.title.clone(),
			path: Some(self.external_id(issue.number)),
			url: Some(issue.html_url.clone()),
			mime_type: mime_type.to_string(),
			metadata,
			created_at: Some(issue.created_at),
			updated_at: Some(issue.updated_at),
		}
	}

	fn content(issue: &wire::Issue) -> String {
		let body = issue.body.as_deref().unwrap_or_default();
		format!("# {}\n\n{body}", issue.title)
	}
}

fn parse_cursor(cursor: Option<&str>) -> Option<DateTime<Utc>> {
	cursor
		.and_then(|c| DateTime::parse_from_rfc3339(c).ok())
		.map(|t| t.with_timezone(&Utc))
}

fn change_kind(since: Option<DateTime<Utc>>, issue: &wire::Issue) -> ChangeKind {
	match since {
		Some(since) if issue.created_at <= since => ChangeKind::Modified,
		_ => ChangeKind::Added,
	}
}

#[async_trait]
impl Connector for GithubConnector {
	fn provider(&self) -> &str {
		"github"
	}

	fn validate_config(
		&self,
		config: &serde_json::Map<String, serde_json::Value>,
	) -> Result<(), ConnectorError> {
		if let Some(value) = config.get("include_pull_requests")
			&& !value.is_boolean()
		{
			return Err(ConnectorError::InvalidConfig(
				"include_pull_requests must be a boolean".into(),
			));
		}
		Ok(())
	}

	async fn fetch_changes(
		&self,
		source: &Source,
		cursor: Option<&str>,
		cancel: &CancellationToken,
	) -> Result<(Vec<Change>, Option<String>), ConnectorError> {
		let include_prs = source
			.config
			.get("include_pull_requests")
			.and_then(|v| v.as_bool())
			.unwrap_or(true);

		let since = parse_cursor(cursor);
		let bearer = self.token.access_token().await?;

		let mut changes = Vec::new();
		let mut max_updated = since;

		for page in 1..=MAX_PAGES {
			let mut url = format!(
				"{}/repos/{}/issues?state=all&sort=updated&direction=asc&per_page={PAGE_SIZE}&page={page}",
				self.api_base, self.container
			);
			if let Some(since) = since {
				url.push_str(&format!("&since={}", since.to_rfc3339().replace('+', "%2B")));
			}

			let issues: Vec<wire::Issue> = self.client.get_json(&url, &bearer, cancel).await?;
			let count = issues.len();

			for issue in issues {
				if max_updated.is_none_or(|m| issue.updated_at > m) {
					max_updated = Some(issue.updated_at);
				}
				if issue.pull_request.is_some() && !include_prs {
					continue;
				}

				changes.push(Change {
					kind: change_kind(since, &issue),
					external_id: self.external_id(issue.number),
					document: Some(self.document_info(&issue)),
					content: Some(Self::content(&issue)),
				});
			}

			if count < PAGE_SIZE {
				break;
			}
		}

		let new_cursor = max_updated.map(|t| t.to_rfc3339()).or_else(|| cursor.map(String::from));
		Ok((changes, new_cursor))
	}

	async fn fetch_document(
		&self,
		_source: &Source,
		external_id: &str,
		cancel: &CancellationToken,
	) -> Result<Option<(DocumentInfo, String)>, ConnectorError> {
		let Some(number) = external_id
			.strip_prefix(&format!("{}/issues/", self.container))
			.and_then(|n| n.parse::<u64>().ok())
		else {
			return Ok(None);
		};

		let bearer = self.token.access_token().await?;
		let url = format!("{}/repos/{}/issues/{number}", self.api_base, self.container);

		match self.client.get_json::<wire::Issue>(&url, &bearer, cancel).await {
			Ok(issue) => Ok(Some((self.document_info(&issue), Self::content(&issue)))),
			Err(ConnectorError::Provider { status: 404, .. }) => Ok(None),
			Err(err) => Err(err),
		}
	}

	async fn test_connection(
		&self,
		_source: &Source,
		cancel: &CancellationToken,
	) -> Result<(), ConnectorError> {
		let bearer = self.token.access_token().await?;
		let url = format!("{}/repos/{}", self.api_base, self.container);
		self.client.get_json::<wire::Repo>(&url, &bearer, cancel).await.map(|_| ())
	}
}

/// Lists repositories visible to the installation. The cursor is the
/// next page number.
struct GithubContainerLister {
	client: ProviderClient,
	token: Arc<dyn TokenProvider>,
	api_base: String,
}

#[async_trait]
impl ContainerLister for GithubContainerLister {
	async fn list(
		&self,
		cursor: Option<&str>,
		cancel: &CancellationToken,
	) -> Result<ContainerPage, ConnectorError> {
		let page: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(1).max(1);
		let bearer = self.token.access_token().await?;

		let url = format!(
			"{}/user/repos?per_page={PAGE_SIZE}&page={page}&sort=full_name",
			self.api_base
		);
		let repos: Vec<wire::Repo> = self.client.get_json(&url, &bearer, cancel).await?;

		let next_cursor = (repos.len() == PAGE_SIZE).then(|| (page + 1).to_string());
		let containers = repos
			.into_iter()
			.map(|repo| {
				let mut metadata = serde_json::Map::new();
				metadata.insert("private".into(), repo.private.into());
				ContainerInfo {
					id: repo.full_name.clone(),
					name: repo.full_name,
					description: repo.description,
					container_type: "repository".to_string(),
					metadata,
				}
			})
			.collect();

		Ok(ContainerPage {
			containers,
			next_cursor,
		})
	}
}
