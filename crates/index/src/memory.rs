//! In-process index for single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sercha_types::{Chunk, DocumentId, RankedChunk, SearchMode, SearchOptions, SourceId};

use crate::{EmbeddingProvider, IndexError, SearchIndex, effective_mode};

/// A chunk index living entirely in process memory.
///
/// Text ranking is term-frequency based; semantic ranking is cosine
/// similarity over stored embeddings. Close enough to the engine's
/// behavior to exercise every orchestrator path.
#[derive(Default)]
pub struct MemoryIndex {
	entries: Mutex<HashMap<String, (Chunk, Option<Vec<f32>>)>>,
	dimension: Option<usize>,
}

impl MemoryIndex {
	pub fn new() -> Self {
		Self::default()
	}

	/// Index accepting embeddings of `dimension` components.
	pub fn with_dimension(dimension: usize) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			dimension: Some(dimension),
		}
	}

	/// Every stored chunk id, sorted. Test helper.
	pub fn chunk_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
		ids.sort();
		ids
	}
}

fn text_score(query: &str, content: &str) -> f64 {
	let content = content.to_lowercase();
	let mut score = 0.0;
	for term in query.to_lowercase().split_whitespace() {
		score += content.matches(term).count() as f64;
	}
	score
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
	if a.len() != b.len() || a.is_empty() {
		return 0.0;
	}
	let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
	let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
	let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
	if na == 0.0 || nb == 0.0 {
		return 0.0;
	}
	f64::from(dot / (na * nb))
}

#[async_trait]
impl SearchIndex for MemoryIndex {
	async fn index(&self, chunks: &[Chunk], embeddings: Option<&[Vec<f32>]>) -> Result<(), IndexError> {
		let mut entries = self.entries.lock().unwrap();
		for (i, chunk) in chunks.iter().enumerate() {
			let embedding = embeddings.and_then(|e| e.get(i)).cloned();
			entries.insert(chunk.id.clone(), (chunk.clone(), embedding));
		}
		Ok(())
	}

	async fn delete(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
		let mut entries = self.entries.lock().unwrap();
		for id in chunk_ids {
			entries.remove(id);
		}
		Ok(())
	}

	async fn delete_by_document(&self, document_id: DocumentId) -> Result<(), IndexError> {
		self.entries
			.lock()
			.unwrap()
			.retain(|_, (chunk, _)| chunk.document_id != document_id);
		Ok(())
	}

	async fn delete_by_source(&self, source_id: SourceId) -> Result<(), IndexError> {
		self.entries
			.lock()
			.unwrap()
			.retain(|_, (chunk, _)| chunk.source_id != source_id);
		Ok(())
	}

	async fn search(
		&self,
		query: &str,
		query_embedding: Option<&[f32]>,
		options: &SearchOptions,
	) -> Result<(Vec<RankedChunk>, u64), IndexError> {
		let mode = effective_mode(options.mode, query_embedding, self.dimension);
		let entries = self.entries.lock().unwrap();

		let mut ranked: Vec<RankedChunk> = entries
			.values()
			.filter(|(chunk, _)| {
				options.source_ids.is_empty() || options.source_ids.contains(&chunk.source_id)
			})
			.filter_map(|(chunk, embedding)| {
				let text = text_score(query, &chunk.content);
				let semantic = match (query_embedding, embedding) {
					(Some(q), Some(e)) => cosine(q, e),
					_ => 0.0,
				};
				let score = match mode {
					SearchMode::Text => text,
					SearchMode::Semantic => semantic,
					SearchMode::Hybrid => text + semantic,
				};
				(score > 0.0).then(|| RankedChunk {
					chunk_id: chunk.id.clone(),
					document_id: chunk.document_id,
					source_id: chunk.source_id,
					content: chunk.content.clone(),
					position: chunk.position,
					score,
				})
			})
			.collect();

		ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
		let total = ranked.len() as u64;
		let page: Vec<RankedChunk> = ranked
			.into_iter()
			.skip(options.offset)
			.take(options.limit)
			.collect();

		Ok((page, total))
	}

	async fn count(&self) -> Result<u64, IndexError> {
		Ok(self.entries.lock().unwrap().len() as u64)
	}

	async fn health_check(&self) -> Result<(), IndexError> {
		Ok(())
	}
}

/// Deterministic embedding provider for tests: hashes terms into a
/// fixed-size bag-of-words vector.
pub struct HashingEmbedder {
	pub dimension: usize,
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
	fn dimension(&self) -> usize {
		self.dimension
	}

	async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
		Ok(texts
			.iter()
			.map(|text| {
				let mut v = vec![0.0f32; self.dimension];
				for term in text.to_lowercase().split_whitespace() {
					let mut h = 0usize;
					for b in term.bytes() {
						h = h.wrapping_mul(31).wrapping_add(b as usize);
					}
					v[h % self.dimension] += 1.0;
				}
				v
			})
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use sercha_types::{Document, DocumentInfo};

	use super::*;

	fn chunk(doc: DocumentId, source: SourceId, position: u32, content: &str) -> Chunk {
		Chunk::new(doc, source, position, 0, content.len() as u64, content)
	}

	fn sample_doc(source: SourceId) -> Document {
		Document::from_info(
			source,
			"1",
			DocumentInfo {
				title: "t".into(),
				mime_type: "text/plain".into(),
				..DocumentInfo::default()
			},
		)
	}

	#[tokio::test]
	async fn text_search_ranks_by_term_frequency() {
		let index = MemoryIndex::new();
		let source = SourceId::generate();
		let doc = sample_doc(source);

		index
			.index(
				&[
					chunk(doc.id, source, 0, "rust rust rust"),
					chunk(doc.id, source, 1, "rust once"),
					chunk(doc.id, source, 2, "nothing relevant"),
				],
				None,
			)
			.await
			.unwrap();

		let (hits, total) = index
			.search("rust", None, &SearchOptions::default())
			.await
			.unwrap();

		assert_eq!(total, 2);
		assert_eq!(hits[0].position, 0);
		assert_eq!(hits[1].position, 1);
	}

	#[tokio::test]
	async fn source_filter_restricts_hits() {
		let index = MemoryIndex::new();
		let source_a = SourceId::generate();
		let source_b = SourceId::generate();
		let doc_a = sample_doc(source_a);
		let doc_b = sample_doc(source_b);

		index
			.index(
				&[
					chunk(doc_a.id, source_a, 0, "shared term"),
					chunk(doc_b.id, source_b, 0, "shared term"),
				],
				None,
			)
			.await
			.unwrap();

		let options = SearchOptions {
			source_ids: vec![source_a],
			..SearchOptions::default()
		};
		let (hits, total) = index.search("shared", None, &options).await.unwrap();

		assert_eq!(total, 1);
		assert_eq!(hits[0].source_id, source_a);
	}

	#[tokio::test]
	async fn delete_by_document_removes_every_chunk() {
		let index = MemoryIndex::new();
		let source = SourceId::generate();
		let doc = sample_doc(source);
		let other = sample_doc(source);

		index
			.index(
				&[
					chunk(doc.id, source, 0, "victim one"),
					chunk(doc.id, source, 1, "victim two"),
					chunk(other.id, source, 0, "survivor"),
				],
				None,
			)
			.await
			.unwrap();

		index.delete_by_document(doc.id).await.unwrap();

		assert_eq!(index.count().await.unwrap(), 1);
		let (hits, _) = index
			.search("victim", None, &SearchOptions::default())
			.await
			.unwrap();
		assert!(hits.is_empty());
	}

	#[tokio::test]
	async fn hybrid_search_uses_embeddings_when_dimension_matches() {
		let index = MemoryIndex::with_dimension(4);
		let source = SourceId::generate();
		let doc = sample_doc(source);

		index
			.index(
				&[chunk(doc.id, source, 0, "alpha"), chunk(doc.id, source, 1, "beta")],
				Some(&[vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]]),
			)
			.await
			.unwrap();

		let options = SearchOptions {
			mode: SearchMode::Semantic,
			..SearchOptions::default()
		};
		let (hits, _) = index
			.search("unrelated", Some(&[1.0, 0.0, 0.0, 0.0]), &options)
			.await
			.unwrap();

		assert_eq!(hits[0].position, 0);
	}

	#[tokio::test]
	async fn semantic_without_embedding_degrades_to_text() {
		let index = MemoryIndex::with_dimension(4);
		let source = SourceId::generate();
		let doc = sample_doc(source);

		index.index(&[chunk(doc.id, source, 0, "alpha")], None).await.unwrap();

		let options = SearchOptions {
			mode: SearchMode::Semantic,
			..SearchOptions::default()
		};
		let (hits, _) = index.search("alpha", None, &options).await.unwrap();
		assert_eq!(hits.len(), 1);
	}

	#[tokio::test]
	async fn reindexing_same_chunk_id_overwrites() {
		let index = MemoryIndex::new();
		let source = SourceId::generate();
		let doc = sample_doc(source);

		index.index(&[chunk(doc.id, source, 0, "old words")], None).await.unwrap();
		index.index(&[chunk(doc.id, source, 0, "new words")], None).await.unwrap();

		assert_eq!(index.count().await.unwrap(), 1);
		let (hits, _) = index.search("old", None, &SearchOptions::default()).await.unwrap();
		assert!(hits.is_empty());
	}
}
