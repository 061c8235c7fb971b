//! Ordered post-processing chain from document text to index chunks.

use std::collections::HashSet;
use std::sync::Arc;

use sercha_types::{Chunk, Document};
use sha2::{Digest, Sha256};

/// One stage of the post-processing chain.
///
/// The first stage receives a single chunk holding the full normalised
/// document; each later stage receives the previous stage's output.
/// Character offsets must stay monotonically non-decreasing across
/// positions.
pub trait PostProcessor: Send + Sync {
	fn name(&self) -> &str;

	/// Stage ordering; lower runs first.
	fn order(&self) -> u32;

	fn process(&self, chunks: Vec<Chunk>) -> Vec<Chunk>;
}

/// An ordered composition of post-processors.
pub struct Pipeline {
	stages: Vec<Arc<dyn PostProcessor>>,
}

impl Pipeline {
	/// Compose stages, sorting by [`PostProcessor::order`].
	pub fn new(mut stages: Vec<Arc<dyn PostProcessor>>) -> Self {
		stages.sort_by_key(|s| s.order());
		Self { stages }
	}

	/// The canonical chain: chunker, de-duplicator, context enhancer.
	pub fn with_defaults() -> Self {
		Self::new(vec![
			Arc::new(Chunker::default()),
			Arc::new(ChunkDeduplicator),
			Arc::new(ContextEnhancer),
		])
	}

	/// Build the seed chunk a document enters the chain with.
	pub fn seed(document: &Document, text: String) -> Chunk {
		let len = text.chars().count() as u64;
		let mut chunk = Chunk::new(document.id, document.source_id, 0, 0, len, text);
		chunk
			.metadata
			.insert("title".into(), serde_json::Value::String(document.title.clone()));
		if let Some(path) = &document.path {
			chunk
				.metadata
				.insert("path".into(), serde_json::Value::String(path.clone()));
		}
		chunk
	}

	/// Run every stage in order.
	pub fn process(&self, mut chunks: Vec<Chunk>) -> Vec<Chunk> {
		for stage in &self.stages {
			let before = chunks.len();
			chunks = stage.process(chunks);
			tracing::trace!(stage = stage.name(), before, after = chunks.len(), "pipeline stage");
		}
		chunks
	}
}

impl std::fmt::Debug for Pipeline {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list()
			.entries(self.stages.iter().map(|s| s.name()))
			.finish()
	}
}

/// Splits document text into overlapping windows by character count.
pub struct Chunker {
	/// Window size in characters.
	pub target_chars: usize,
	/// Characters carried from the end of one window into the next.
	pub overlap_chars: usize,
}

impl Default for Chunker {
	fn default() -> Self {
		Self {
			target_chars: 1600,
			overlap_chars: 200,
		}
	}
}

impl PostProcessor for Chunker {
	fn name(&self) -> &str {
		"chunker"
	}

	fn order(&self) -> u32 {
		10
	}

	fn process(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
		let mut out = Vec::new();
		let mut position = 0u32;

		for chunk in chunks {
			for window in split_windows(&chunk.content, self.target_chars, self.overlap_chars) {
				let mut piece = Chunk::new(
					chunk.document_id,
					chunk.source_id,
					position,
					chunk.start_char + window.start_char,
					chunk.start_char + window.end_char,
					window.text,
				);
				piece.metadata = chunk.metadata.clone();
				out.push(piece);
				position += 1;
			}
		}

		out
	}
}

struct Window {
	start_char: u64,
	end_char: u64,
	text: String,
}

/// Line-based accumulation into windows of roughly `target` characters,
/// carrying up to `overlap` trailing characters into the next window.
fn split_windows(text: &str, target: usize, overlap: usize) -> Vec<Window> {
	if text.is_empty() {
		return Vec::new();
	}

	let mut windows = Vec::new();
	// Lines already in the current window, with their char offsets.
	let mut pending: Vec<(u64, String)> = Vec::new();
	let mut pending_len = 0usize;
	let mut cursor = 0u64;

	let flush = |pending: &mut Vec<(u64, String)>, pending_len: &mut usize, windows: &mut Vec<Window>| {
		if pending.is_empty() {
			return;
		}
		let start = pending[0].0;
		let text: String = pending.iter().map(|(_, l)| l.as_str()).collect();
		windows.push(Window {
			start_char: start,
			end_char: start + *pending_len as u64,
			text,
		});

		// Carry trailing lines into the next window as overlap.
		let mut carried = Vec::new();
		let mut carried_len = 0usize;
		while let Some((off, line)) = pending.pop() {
			let line_len = line.chars().count();
			if carried_len + line_len > overlap {
				break;
			}
			carried_len += line_len;
			carried.push((off, line));
		}
		carried.reverse();
		*pending = carried;
		*pending_len = carried_len;
	};

	for line in text.split_inclusive('\n') {
		let line_len = line.chars().count();

		if pending_len > 0 && pending_len + line_len > target {
			flush(&mut pending, &mut pending_len, &mut windows);
		}

		if line_len > target && pending_len == 0 {
			// A single oversized line becomes its own window; no carry.
			windows.push(Window {
				start_char: cursor,
				end_char: cursor + line_len as u64,
				text: line.to_string(),
			});
			cursor += line_len as u64;
			continue;
		}

		pending.push((cursor, line.to_string()));
		pending_len += line_len;
		cursor += line_len as u64;
	}

	// The final flush must not re-emit a pure-overlap window.
	if pending_len > 0 && (windows.is_empty() || pending.iter().any(|(off, _)| *off >= windows.last().map_or(0, |w| w.end_char))) {
		let start = pending[0].0;
		let text: String = pending.iter().map(|(_, l)| l.as_str()).collect();
		windows.push(Window {
			start_char: start,
			end_char: start + pending_len as u64,
			text,
		});
	}

	windows
}

/// Drops chunks whose content hash was already emitted for this document.
pub struct ChunkDeduplicator;

impl PostProcessor for ChunkDeduplicator {
	fn name(&self) -> &str {
		"dedup"
	}

	fn order(&self) -> u32 {
		20
	}

	fn process(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
		let mut seen: HashSet<[u8; 32]> = HashSet::new();
		chunks
			.into_iter()
			.filter(|chunk| {
				let hash: [u8; 32] = Sha256::digest(chunk.content.as_bytes()).into();
				seen.insert(hash)
			})
			.collect()
	}
}

/// Prepends document title and path so a chunk retrieves well on its own.
pub struct ContextEnhancer;

impl PostProcessor for ContextEnhancer {
	fn name(&self) -> &str {
		"context"
	}

	fn order(&self) -> u32 {
		30
	}

	fn process(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
		chunks
			.into_iter()
			.map(|mut chunk| {
				let title = chunk.metadata.get("title").and_then(|v| v.as_str()).unwrap_or("");
				let path = chunk.metadata.get("path").and_then(|v| v.as_str()).unwrap_or("");

				let mut header = String::new();
				if !title.is_empty() {
					header.push_str(title);
				}
				if !path.is_empty() {
					if !header.is_empty() {
						header.push_str(" — ");
					}
					header.push_str(path);
				}

				if !header.is_empty() && !chunk.content.starts_with(&header) {
					chunk.content = format!("{header}\n\n{}", chunk.content);
				}
				chunk
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use sercha_types::{Document, DocumentInfo, SourceId};

	use super::*;

	fn doc() -> Document {
		Document::from_info(
			SourceId::generate(),
			"42",
			DocumentInfo {
				title: "Widget spec".into(),
				path: Some("docs/widget.md".into()),
				mime_type: "text/markdown".into(),
				..DocumentInfo::default()
			},
		)
	}

	fn seed_with(text: &str) -> Chunk {
		Pipeline::seed(&doc(), text.to_string())
	}

	#[test]
	fn chunker_offsets_are_monotonic() {
		let chunker = Chunker {
			target_chars: 20,
			overlap_chars: 5,
		};
		let text = "alpha line\nbeta line\ngamma line\ndelta line\n";
		let chunks = chunker.process(vec![seed_with(text)]);

		assert!(chunks.len() > 1);
		for pair in chunks.windows(2) {
			assert!(pair[0].start_char <= pair[1].start_char);
			assert!(pair[0].end_char <= pair[1].end_char);
		}
		for (i, chunk) in chunks.iter().enumerate() {
			assert_eq!(chunk.position, i as u32);
			assert_eq!(chunk.id, Chunk::id_for(chunk.document_id, chunk.position));
		}
	}

	#[test]
	fn chunker_windows_overlap() {
		let chunker = Chunker {
			target_chars: 30,
			overlap_chars: 15,
		};
		let text = "first line\nsecond line\nthird line\nfourth line\n";
		let chunks = chunker.process(vec![seed_with(text)]);

		assert!(chunks.len() > 1);
		// The second window starts before the first one ends.
		assert!(chunks[1].start_char < chunks[0].end_char);
	}

	#[test]
	fn chunker_emits_oversized_line_alone() {
		let chunker = Chunker {
			target_chars: 10,
			overlap_chars: 2,
		};
		let long = "x".repeat(50);
		let text = format!("short\n{long}\nshort2\n");
		let chunks = chunker.process(vec![seed_with(&text)]);

		assert!(chunks.iter().any(|c| c.content.trim_end().len() == 50));
	}

	#[test]
	fn chunker_small_document_is_one_chunk() {
		let chunker = Chunker::default();
		let chunks = chunker.process(vec![seed_with("tiny document\n")]);
		assert_eq!(chunks.len(), 1);
		assert_eq!(chunks[0].position, 0);
		assert_eq!(chunks[0].start_char, 0);
	}

	#[test]
	fn chunker_empty_document_yields_nothing() {
		let chunker = Chunker::default();
		assert!(chunker.process(vec![seed_with("")]).is_empty());
	}

	#[test]
	fn dedup_drops_repeated_content() {
		let d = doc();
		let a = Chunk::new(d.id, d.source_id, 0, 0, 5, "same");
		let b = Chunk::new(d.id, d.source_id, 1, 5, 10, "same");
		let c = Chunk::new(d.id, d.source_id, 2, 10, 15, "other");

		let out = ChunkDeduplicator.process(vec![a, b, c]);
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].position, 0);
		assert_eq!(out[1].position, 2);
	}

	#[test]
	fn enhancer_prepends_title_and_path() {
		let out = ContextEnhancer.process(vec![seed_with("body text")]);
		assert_eq!(out[0].content, "Widget spec — docs/widget.md\n\nbody text");
	}

	#[test]
	fn pipeline_sorts_stages_by_order() {
		struct Tag(&'static str, u32);

		impl PostProcessor for Tag {
			fn name(&self) -> &str {
				self.0
			}

			fn order(&self) -> u32 {
				self.1
			}

			fn process(&self, mut chunks: Vec<Chunk>) -> Vec<Chunk> {
				for c in &mut chunks {
					c.content.push_str(self.0);
				}
				chunks
			}
		}

		let pipeline = Pipeline::new(vec![Arc::new(Tag("b", 2)), Arc::new(Tag("a", 1))]);
		let out = pipeline.process(vec![seed_with("")]);
		assert_eq!(out[0].content, "ab");
	}

	#[test]
	fn pipeline_is_idempotent_for_same_input() {
		let pipeline = Pipeline::with_defaults();
		let document = doc();
		let text: String = (0..120).map(|i| format!("line number {i}\n")).collect();

		let first = pipeline.process(vec![Pipeline::seed(&document, text.clone())]);
		let second = pipeline.process(vec![Pipeline::seed(&document, text)]);

		assert_eq!(
			first.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
			second.iter().map(|c| c.id.as_str()).collect::<Vec<_>>()
		);
		assert_eq!(first, second);
	}
}
