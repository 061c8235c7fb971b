//! Content pipeline: normalisers and post-processors.
//!
//! Two extension points sit between a connector and the search index.
//! [`Normaliser`]s turn raw provider content into clean text, dispatched
//! by MIME type through a priority-ordered registry. [`PostProcessor`]s
//! then transform a document's text into indexable chunks through an
//! ordered chain (chunker, de-duplicator, context enhancer).

mod normalise;
mod process;

pub use normalise::{
	HtmlNormaliser, MarkdownNormaliser, Normaliser, NormaliserRegistry, PlainTextNormaliser,
	canonical_mime,
};
pub use process::{ChunkDeduplicator, Chunker, ContextEnhancer, Pipeline, PostProcessor};
