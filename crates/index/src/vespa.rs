//! Vespa adapter.
//!
//! Chunks are documents of type `chunk` in the `sercha` namespace,
//! addressed by chunk id through the document API. Queries go through
//! the search API with a ranking profile per mode; deleting by document
//! or source uses a selection predicate.

use std::time::Duration;

use async_trait::async_trait;
use sercha_types::{Chunk, DocumentId, RankedChunk, SearchMode, SearchOptions, SourceId};
use serde::Deserialize;

use crate::{IndexError, SearchIndex, effective_mode};

const NAMESPACE: &str = "sercha";
const DOCTYPE: &str = "chunk";
const CLUSTER: &str = "sercha";

/// Document index over a Vespa deployment.
pub struct VespaIndex {
	http: reqwest::Client,
	config_url: String,
	container_url: String,
	/// Embedding dimension the deployed schema declares, if any.
	dimension: Option<usize>,
}

impl VespaIndex {
	pub fn new(config_url: impl Into<String>, container_url: impl Into<String>) -> Result<Self, IndexError> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| IndexError::Backend(e.to_string()))?;

		Ok(Self {
			http,
			config_url: trim_slash(config_url.into()),
			container_url: trim_slash(container_url.into()),
			dimension: None,
		})
	}

	/// Declare the embedding dimension of the deployed schema.
	#[must_use]
	pub fn with_dimension(mut self, dimension: usize) -> Self {
		self.dimension = Some(dimension);
		self
	}

	fn doc_url(&self, chunk_id: &str) -> String {
		format!(
			"{}/document/v1/{NAMESPACE}/{DOCTYPE}/docid/{}",
			self.container_url,
			urlencode(chunk_id)
		)
	}

	async fn delete_by_selection(&self, selection: &str) -> Result<(), IndexError> {
		let url = format!("{}/document/v1/{NAMESPACE}/{DOCTYPE}/docid", self.container_url);
		let response = self
			.http
			.delete(&url)
			.query(&[("selection", selection), ("cluster", CLUSTER)])
			.send()
			.await
			.map_err(|e| IndexError::Backend(e.to_string()))?;

		check_status(response).await.map(|_| ())
	}

	async fn run_query(&self, body: serde_json::Value) -> Result<QueryResponse, IndexError> {
		let url = format!("{}/search/", self.container_url);
		let response = self
			.http
			.post(&url)
			.json(&body)
			.send()
			.await
			.map_err(|e| IndexError::Backend(e.to_string()))?;

		let body = check_status(response).await?;
		serde_json::from_str(&body).map_err(|e| IndexError::Codec(e.to_string()))
	}
}

fn trim_slash(mut url: String) -> String {
	while url.ends_with('/') {
		url.pop();
	}
	url
}

fn urlencode(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for b in raw.bytes() {
		match b {
			b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
			_ => out.push_str(&format!("%{b:02X}")),
		}
	}
	out
}

async fn check_status(response: reqwest::Response) -> Result<String, IndexError> {
	let status = response.status();
	let body = response.text().await.unwrap_or_default();
	if !status.is_success() {
		return Err(IndexError::Backend(format!("status {status}: {body}")));
	}
	Ok(body)
}

/// YQL `where` clause for a query and optional source filter.
fn build_where(mode: SearchMode, source_ids: &[SourceId]) -> String {
	let matcher = match mode {
		SearchMode::Text => "userQuery()".to_string(),
		SearchMode::Semantic => "({targetHits: 100}nearestNeighbor(embedding, q))".to_string(),
		SearchMode::Hybrid => {
			"(userQuery() or ({targetHits: 100}nearestNeighbor(embedding, q)))".to_string()
		}
	};

	if source_ids.is_empty() {
		matcher
	} else {
		let ids: Vec<String> = source_ids.iter().map(|id| format!("\"{id}\"")).collect();
		format!("{matcher} and source_id in ({})", ids.join(", "))
	}
}

fn ranking_profile(mode: SearchMode) -> &'static str {
	match mode {
		SearchMode::Text => "text",
		SearchMode::Semantic => "semantic",
		SearchMode::Hybrid => "hybrid",
	}
}

#[derive(Deserialize)]
struct QueryResponse {
	root: QueryRoot,
}

#[derive(Deserialize)]
struct QueryRoot {
	#[serde(default)]
	fields: QueryRootFields,
	#[serde(default)]
	children: Vec<QueryHit>,
}

#[derive(Deserialize, Default)]
struct QueryRootFields {
	#[serde(rename = "totalCount", default)]
	total_count: u64,
}

#[derive(Deserialize)]
struct QueryHit {
	#[serde(default)]
	relevance: f64,
	fields: ChunkFields,
}

#[derive(Deserialize)]
struct ChunkFields {
	chunk_id: String,
	document_id: String,
	source_id: String,
	#[serde(default)]
	content: String,
	#[serde(default)]
	position: u32,
}

impl QueryHit {
	fn into_ranked(self) -> Result<RankedChunk, IndexError> {
		let document_id: DocumentId = self
			.fields
			.document_id
			.parse()
			.map_err(|_| IndexError::Codec(format!("bad document id {:?}", self.fields.document_id)))?;
		let source_id: SourceId = self
			.fields
			.source_id
			.parse()
			.map_err(|_| IndexError::Codec(format!("bad source id {:?}", self.fields.source_id)))?;

		Ok(RankedChunk {
			chunk_id: self.fields.chunk_id,
			document_id,
			source_id,
			content: self.fields.content,
			position: self.fields.position,
			score: self.relevance,
		})
	}
}

#[async_trait]
impl SearchIndex for VespaIndex {
	async fn index(&self, chunks: &[Chunk], embeddings: Option<&[Vec<f32>]>) -> Result<(), IndexError> {
		for (i, chunk) in chunks.iter().enumerate() {
			let mut fields = serde_json::json!({
				"chunk_id": chunk.id,
				"document_id": chunk.document_id.to_string(),
				"source_id": chunk.source_id.to_string(),
				"content": chunk.content,
				"position": chunk.position,
				"start_char": chunk.start_char,
				"end_char": chunk.end_char,
			});
			if let Some(embedding) = embeddings.and_then(|e| e.get(i)) {
				fields["embedding"] = serde_json::json!({ "values": embedding });
			}

			let response = self
				.http
				.post(self.doc_url(&chunk.id))
				.json(&serde_json::json!({ "fields": fields }))
				.send()
				.await
				.map_err(|e| IndexError::Backend(e.to_string()))?;

			check_status(response).await?;
		}
		Ok(())
	}

	async fn delete(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
		for id in chunk_ids {
			let response = self
				.http
				.delete(self.doc_url(id))
				.send()
				.await
				.map_err(|e| IndexError::Backend(e.to_string()))?;
			check_status(response).await?;
		}
		Ok(())
	}

	async fn delete_by_document(&self, document_id: DocumentId) -> Result<(), IndexError> {
		self.delete_by_selection(&format!("{DOCTYPE}.document_id=='{document_id}'")).await
	}

	async fn delete_by_source(&self, source_id: SourceId) -> Result<(), IndexError> {
		self.delete_by_selection(&format!("{DOCTYPE}.source_id=='{source_id}'")).await
	}

	async fn search(
		&self,
		query: &str,
		query_embedding: Option<&[f32]>,
		options: &SearchOptions,
	) -> Result<(Vec<RankedChunk>, u64), IndexError> {
		let mode = effective_mode(options.mode, query_embedding, self.dimension);

		let mut body = serde_json::json!({
			"yql": format!("select * from {DOCTYPE} where {}", build_where(mode, &options.source_ids)),
			"query": query,
			"ranking": ranking_profile(mode),
			"hits": options.limit,
			"offset": options.offset,
		});
		if mode != SearchMode::Text
			&& let Some(embedding) = query_embedding
		{
			body["input.query(q)"] = serde_json::json!(embedding);
		}

		let response = self.run_query(body).await?;
		let total = response.root.fields.total_count;
		let hits = response
			.root
			.children
			.into_iter()
			.map(QueryHit::into_ranked)
			.collect::<Result<Vec<_>, _>>()?;

		Ok((hits, total))
	}

	async fn count(&self) -> Result<u64, IndexError> {
		let body = serde_json::json!({
			"yql": format!("select * from {DOCTYPE} where true"),
			"hits": 0,
		});
		let response = self.run_query(body).await?;
		Ok(response.root.fields.total_count)
	}

	async fn health_check(&self) -> Result<(), IndexError> {
		let container = format!("{}/ApplicationStatus", self.container_url);
		let response = self
			.http
			.get(&container)
			.send()
			.await
			.map_err(|e| IndexError::Backend(e.to_string()))?;
		if !response.status().is_success() {
			return Err(IndexError::Backend(format!(
				"container status {}",
				response.status()
			)));
		}

		let config = format!("{}/state/v1/health", self.config_url);
		let response = self
			.http
			.get(&config)
			.send()
			.await
			.map_err(|e| IndexError::Backend(e.to_string()))?;
		if !response.status().is_success() {
			return Err(IndexError::Backend(format!(
				"config server status {}",
				response.status()
			)));
		}
		Ok(())
	}
}
