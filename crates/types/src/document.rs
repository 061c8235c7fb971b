//! Documents, chunks, and connector change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DocumentId, SourceId};

/// A provider-level item (issue, pull request, file, page).
///
/// `(source_id, external_id)` is unique across the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
	pub id: DocumentId,
	pub source_id: SourceId,
	/// Provider-assigned identifier, unique within the source.
	pub external_id: String,
	pub path: Option<String>,
	pub url: Option<String>,
	pub title: String,
	pub mime_type: String,
	pub metadata: serde_json::Map<String, serde_json::Value>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub indexed_at: Option<DateTime<Utc>>,
}

impl Document {
	/// Build a document from connector-supplied info.
	pub fn from_info(source_id: SourceId, external_id: impl Into<String>, info: DocumentInfo) -> Self {
		let now = Utc::now();
		Self {
			id: DocumentId(Uuid::new_v4()),
			source_id,
			external_id: external_id.into(),
			path: info.path,
			url: info.url,
			title: info.title,
			mime_type: info.mime_type,
			metadata: info.metadata,
			created_at: info.created_at.unwrap_or(now),
			updated_at: info.updated_at.unwrap_or(now),
			indexed_at: None,
		}
	}
}

/// A post-processed slice of a document, ready for indexing.
///
/// Chunk ids are derived from `(document_id, position)`, so re-syncing a
/// document overwrites its previous index entries instead of duplicating
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
	pub id: String,
	pub document_id: DocumentId,
	pub source_id: SourceId,
	pub content: String,
	/// Ordinal within the document, starting at zero.
	pub position: u32,
	pub start_char: u64,
	pub end_char: u64,
	pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Chunk {
	/// Deterministic chunk id for a document position.
	pub fn id_for(document_id: DocumentId, position: u32) -> String {
		format!("{document_id}:{position}")
	}

	pub fn new(
		document_id: DocumentId,
		source_id: SourceId,
		position: u32,
		start_char: u64,
		end_char: u64,
		content: impl Into<String>,
	) -> Self {
		Self {
			id: Self::id_for(document_id, position),
			document_id,
			source_id,
			content: content.into(),
			position,
			start_char,
			end_char,
			metadata: serde_json::Map::new(),
		}
	}
}

/// What happened to a provider item since the last cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	Added,
	Modified,
	Deleted,
}

/// Connector-reported metadata for a new or updated item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentInfo {
	pub title: String,
	pub path: Option<String>,
	pub url: Option<String>,
	pub mime_type: String,
	pub metadata: serde_json::Map<String, serde_json::Value>,
	pub created_at: Option<DateTime<Utc>>,
	pub updated_at: Option<DateTime<Utc>>,
}

/// One incremental change reported by a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
	pub kind: ChangeKind,
	pub external_id: String,
	/// Present for added/modified changes.
	pub document: Option<DocumentInfo>,
	/// Raw content to normalise; present for added/modified changes.
	pub content: Option<String>,
}

/// A container visible to an installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
	pub id: String,
	pub name: String,
	pub description: Option<String>,
	pub container_type: String,
	pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One page of a container listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPage {
	pub containers: Vec<ContainerInfo>,
	/// Opaque token for the next page, absent on the last page.
	pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chunk_ids_are_stable_per_position() {
		let doc = DocumentId::generate();
		let a = Chunk::new(doc, SourceId::generate(), 0, 0, 10, "hello");
		assert_eq!(a.id, Chunk::id_for(doc, 0));
		assert_ne!(Chunk::id_for(doc, 0), Chunk::id_for(doc, 1));
	}
}
