//! Sources and their sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{InstallationId, SourceId};

/// A configured intent to index a container inside a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
	pub id: SourceId,
	pub name: String,
	/// Provider tag, e.g. `"github"`.
	pub provider: String,
	/// Opaque provider-specific configuration.
	pub config: serde_json::Map<String, serde_json::Value>,
	pub enabled: bool,
	/// Credentials used by this source; nulled when the installation is
	/// deleted.
	pub installation_id: Option<InstallationId>,
	/// Provider container identifiers, e.g. `"owner/repo"`. Order is
	/// preserved.
	pub selected_containers: Vec<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Source {
	/// Create an enabled source with no containers selected.
	pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
		let now = Utc::now();
		Self {
			id: SourceId(Uuid::new_v4()),
			name: name.into(),
			provider: provider.into(),
			config: serde_json::Map::new(),
			enabled: true,
			installation_id: None,
			selected_containers: Vec::new(),
			created_at: now,
			updated_at: now,
		}
	}
}

/// Sync lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
	Idle,
	Running,
	Failed,
}

impl SyncStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::Running => "running",
			Self::Failed => "failed",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"idle" => Some(Self::Idle),
			"running" => Some(Self::Running),
			"failed" => Some(Self::Failed),
			_ => None,
		}
	}
}

/// Per-source sync bookkeeping. One row per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
	pub source_id: SourceId,
	pub status: SyncStatus,
	pub last_sync_at: Option<DateTime<Utc>>,
	pub next_sync_at: Option<DateTime<Utc>>,
	/// Opaque incremental-sync token owned by the connector. Never
	/// advanced on a failed sync.
	pub cursor: Option<String>,
	pub error: Option<String>,
	pub stats: SyncStats,
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
}

impl SyncState {
	/// Fresh idle state for a source that has never synced.
	pub fn initial(source_id: SourceId) -> Self {
		Self {
			source_id,
			status: SyncStatus::Idle,
			last_sync_at: None,
			next_sync_at: None,
			cursor: None,
			error: None,
			stats: SyncStats::default(),
			started_at: None,
			completed_at: None,
		}
	}
}

/// Counters accumulated over one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
	pub docs_added: u64,
	pub docs_updated: u64,
	pub docs_deleted: u64,
	pub chunks_indexed: u64,
	pub errors: u64,
}

impl SyncStats {
	/// Fold another run's counters into this one.
	pub fn merge(&mut self, other: &SyncStats) {
		self.docs_added += other.docs_added;
		self.docs_updated += other.docs_updated;
		self.docs_deleted += other.docs_deleted;
		self.chunks_indexed += other.chunks_indexed;
		self.errors += other.errors;
	}
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
	pub success: bool,
	pub stats: SyncStats,
	pub error: Option<String>,
}

impl SyncResult {
	pub fn ok(stats: SyncStats) -> Self {
		Self {
			success: true,
			stats,
			error: None,
		}
	}

	pub fn failed(stats: SyncStats, error: impl Into<String>) -> Self {
		Self {
			success: false,
			stats,
			error: Some(error.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stats_merge_accumulates() {
		let mut a = SyncStats {
			docs_added: 1,
			docs_updated: 2,
			docs_deleted: 0,
			chunks_indexed: 5,
			errors: 1,
		};
		let b = SyncStats {
			docs_added: 3,
			docs_updated: 0,
			docs_deleted: 1,
			chunks_indexed: 7,
			errors: 0,
		};
		a.merge(&b);
		assert_eq!(a.docs_added, 4);
		assert_eq!(a.docs_deleted, 1);
		assert_eq!(a.chunks_indexed, 12);
		assert_eq!(a.errors, 1);
	}
}
