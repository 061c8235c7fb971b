//! Search adapter request/response types.

use serde::{Deserialize, Serialize};

use crate::{DocumentId, SourceId};

/// Ranking profile selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
	#[default]
	Text,
	Semantic,
	Hybrid,
}

impl SearchMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Text => "text",
			Self::Semantic => "semantic",
			Self::Hybrid => "hybrid",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"text" => Some(Self::Text),
			"semantic" => Some(Self::Semantic),
			"hybrid" => Some(Self::Hybrid),
			_ => None,
		}
	}
}

/// Query options accepted by the search adapter.
#[derive(Debug, Clone)]
pub struct SearchOptions {
	pub limit: usize,
	pub offset: usize,
	pub mode: SearchMode,
	/// Restrict results to these sources; empty means all.
	pub source_ids: Vec<SourceId>,
}

impl Default for SearchOptions {
	fn default() -> Self {
		Self {
			limit: 20,
			offset: 0,
			mode: SearchMode::Text,
			source_ids: Vec::new(),
		}
	}
}

/// One ranked hit returned by the search adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedChunk {
	pub chunk_id: String,
	pub document_id: DocumentId,
	pub source_id: SourceId,
	pub content: String,
	pub position: u32,
	pub score: f64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mode_round_trips() {
		for mode in [SearchMode::Text, SearchMode::Semantic, SearchMode::Hybrid] {
			assert_eq!(SearchMode::parse(mode.as_str()), Some(mode));
		}
		assert_eq!(SearchMode::parse("fuzzy"), None);
	}
}
