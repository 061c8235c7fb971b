//! Shared HTTP plumbing for provider clients.
//!
//! Retry policy: rate-limit responses wait out the window the provider
//! advertises (up to five minutes, observing cancellation); server
//! errors retry with linear backoff (`attempt + 1` seconds) up to three
//! attempts; client errors return immediately.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::ConnectorError;

/// Server-error retry budget.
const MAX_ATTEMPTS: u32 = 3;
/// Longest rate-limit window worth waiting out in place.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(5 * 60);
/// Rate-limit waits per request before giving up.
const MAX_RATE_LIMIT_WAITS: u32 = 2;

/// HTTP client with the provider retry policy applied.
#[derive(Debug, Clone)]
pub struct ProviderClient {
	http: reqwest::Client,
	user_agent: String,
}

impl ProviderClient {
	pub fn new(user_agent: impl Into<String>) -> Result<Self, ConnectorError> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| ConnectorError::Transient(e.to_string()))?;

		Ok(Self {
			http,
			user_agent: user_agent.into(),
		})
	}

	/// GET `url` with a bearer token and decode the JSON response.
	pub async fn get_json<T: DeserializeOwned>(
		&self,
		url: &str,
		bearer: &str,
		cancel: &CancellationToken,
	) -> Result<T, ConnectorError> {
		let response = self.get(url, bearer, cancel).await?;
		response
			.json()
			.await
			.map_err(|e| ConnectorError::Codec(e.to_string()))
	}

	/// GET `url` with a bearer token, applying the retry policy.
	pub async fn get(
		&self,
		url: &str,
		bearer: &str,
		cancel: &CancellationToken,
	) -> Result<Response, ConnectorError> {
		let mut rate_limit_waits = 0u32;
		let mut attempt = 0u32;

		loop {
			if cancel.is_cancelled() {
				return Err(ConnectorError::Cancelled);
			}

			let request = self
				.http
				.get(url)
				.bearer_auth(bearer)
				.header(reqwest::header::USER_AGENT, &self.user_agent)
				.header(reqwest::header::ACCEPT, "application/json");

			let sent = tokio::select! {
				result = request.send() => result,
				_ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
			};

			let response = match sent {
				Ok(response) => response,
				Err(err) => {
					attempt += 1;
					if attempt >= MAX_ATTEMPTS {
						return Err(ConnectorError::Transient(err.to_string()));
					}
					tracing::debug!(error = %err, attempt, url, "request failed; retrying");
					sleep_or_cancel(Duration::from_secs(u64::from(attempt)), cancel).await?;
					continue;
				}
			};

			let status = response.status();
			if status.is_success() {
				return Ok(response);
			}

			if is_rate_limited(status, response.headers()) {
				let wait = rate_limit_wait(response.headers());
				rate_limit_waits += 1;
				match wait {
					Some(wait) if wait <= MAX_RATE_LIMIT_WAIT && rate_limit_waits <= MAX_RATE_LIMIT_WAITS => {
						tracing::info!(wait_secs = wait.as_secs(), url, "rate limited; waiting");
						sleep_or_cancel(wait, cancel).await?;
						continue;
					}
					_ => {
						return Err(ConnectorError::Transient(format!(
							"rate limited beyond wait budget at {url}"
						)));
					}
				}
			}

			if status.is_server_error() {
				attempt += 1;
				if attempt >= MAX_ATTEMPTS {
					let body = response.text().await.unwrap_or_default();
					return Err(ConnectorError::Transient(format!("status {status}: {body}")));
				}
				sleep_or_cancel(Duration::from_secs(u64::from(attempt)), cancel).await?;
				continue;
			}

			// Remaining 4xx: the caller's problem, not retryable.
			let body = response.text().await.unwrap_or_default();
			return Err(ConnectorError::Provider {
				status: status.as_u16(),
				message: body,
			});
		}
	}
}

async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<(), ConnectorError> {
	tokio::select! {
		_ = tokio::time::sleep(wait) => Ok(()),
		_ = cancel.cancelled() => Err(ConnectorError::Cancelled),
	}
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
	if status == StatusCode::TOO_MANY_REQUESTS {
		return true;
	}
	// GitHub reports primary rate limits as 403 with a zeroed remaining
	// counter.
	status == StatusCode::FORBIDDEN
		&& headers
			.get("x-ratelimit-remaining")
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.trim() == "0")
}

/// How long the provider asks us to wait, from `Retry-After` seconds or
/// an `X-RateLimit-Reset` epoch timestamp.
fn rate_limit_wait(headers: &HeaderMap) -> Option<Duration> {
	if let Some(retry_after) = headers
		.get(reqwest::header::RETRY_AFTER)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse::<u64>().ok())
	{
		return Some(Duration::from_secs(retry_after));
	}

	let reset = headers
		.get("x-ratelimit-reset")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.trim().parse::<i64>().ok())?;

	let wait = reset - Utc::now().timestamp();
	Some(Duration::from_secs(wait.max(1) as u64))
}
