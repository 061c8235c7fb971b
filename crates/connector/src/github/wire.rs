//! GitHub REST API wire types, reduced to the fields the connector reads.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
	pub id: u64,
	pub number: u64,
	pub title: String,
	#[serde(default)]
	pub body: Option<String>,
	pub html_url: String,
	pub state: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default)]
	pub user: Option<Account>,
	#[serde(default)]
	pub labels: Vec<Label>,
	/// Present when the item is a pull request; the issues API returns
	/// both kinds.
	#[serde(default)]
	pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
	pub id: u64,
	pub login: String,
	#[serde(default)]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
	pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repo {
	pub id: u64,
	pub full_name: String,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub private: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
	#[serde(default)]
	pub access_token: Option<String>,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_in: Option<i64>,
	#[serde(default)]
	pub scope: Option<String>,
	#[serde(default)]
	pub error: Option<String>,
	#[serde(default)]
	pub error_description: Option<String>,
}
