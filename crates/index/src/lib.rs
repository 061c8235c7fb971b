//! Document index adapter.
//!
//! The core treats the search engine as a document index addressed by
//! chunk id: upsert, delete (by id, document, or source), and a ranked
//! query API with text, semantic, and hybrid profiles. Semantic and
//! hybrid queries need a query embedding of the configured dimension;
//! without one the adapter degrades to text ranking rather than fail.

use async_trait::async_trait;
use sercha_types::{Chunk, DocumentId, RankedChunk, SearchMode, SearchOptions, SourceId};
use thiserror::Error;

pub mod memory;
pub mod vespa;

pub use self::memory::{HashingEmbedder, MemoryIndex};
pub use self::vespa::VespaIndex;

/// Errors from the index backend.
#[derive(Debug, Error)]
pub enum IndexError {
	/// The engine rejected or failed the request.
	#[error("index backend: {0}")]
	Backend(String),

	/// The engine's response could not be decoded.
	#[error("index codec: {0}")]
	Codec(String),
}

/// Produces embeddings for chunk contents and queries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
	/// Length of every vector this provider emits.
	fn dimension(&self) -> usize;

	/// Embed each text, in order.
	async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;
}

/// A chunk-addressed document index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
	/// Upsert chunks, optionally with one embedding per chunk.
	async fn index(&self, chunks: &[Chunk], embeddings: Option<&[Vec<f32>]>) -> Result<(), IndexError>;

	async fn delete(&self, chunk_ids: &[String]) -> Result<(), IndexError>;

	async fn delete_by_document(&self, document_id: DocumentId) -> Result<(), IndexError>;

	async fn delete_by_source(&self, source_id: SourceId) -> Result<(), IndexError>;

	/// Ranked retrieval. Returns the requested page and the total match
	/// count.
	async fn search(
		&self,
		query: &str,
		query_embedding: Option<&[f32]>,
		options: &SearchOptions,
	) -> Result<(Vec<RankedChunk>, u64), IndexError>;

	async fn count(&self) -> Result<u64, IndexError>;

	async fn health_check(&self) -> Result<(), IndexError>;
}

/// Resolve the ranking mode actually usable for a query.
///
/// Semantic and hybrid ranking require an embedding of `dimension`
/// components; anything else falls back to text.
pub fn effective_mode(
	requested: SearchMode,
	query_embedding: Option<&[f32]>,
	dimension: Option<usize>,
) -> SearchMode {
	match requested {
		SearchMode::Text => SearchMode::Text,
		SearchMode::Semantic | SearchMode::Hybrid => {
			let usable = matches!((query_embedding, dimension), (Some(e), Some(d)) if e.len() == d);
			if usable { requested } else { SearchMode::Text }
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn text_mode_needs_no_embedding() {
		assert_eq!(effective_mode(SearchMode::Text, None, Some(3)), SearchMode::Text);
	}

	#[test]
	fn semantic_degrades_without_embedding() {
		assert_eq!(effective_mode(SearchMode::Semantic, None, Some(3)), SearchMode::Text);
		assert_eq!(
			effective_mode(SearchMode::Hybrid, Some(&[0.1, 0.2]), Some(3)),
			SearchMode::Text
		);
		assert_eq!(
			effective_mode(SearchMode::Semantic, Some(&[0.1, 0.2, 0.3]), None),
			SearchMode::Text
		);
	}

	#[test]
	fn matching_dimension_keeps_requested_mode() {
		assert_eq!(
			effective_mode(SearchMode::Hybrid, Some(&[0.1, 0.2, 0.3]), Some(3)),
			SearchMode::Hybrid
		);
	}
}
