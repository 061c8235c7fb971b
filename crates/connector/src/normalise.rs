//! Normalisers for the GitHub document MIME tags.

use sercha_pipeline::{MarkdownNormaliser, Normaliser};

use crate::github::{MIME_ISSUE, MIME_PULL_REQUEST};

/// Cleans issue and pull-request bodies, which arrive as Markdown with
/// a title heading.
pub struct GithubIssueNormaliser {
	markdown: MarkdownNormaliser,
}

impl GithubIssueNormaliser {
	pub fn new() -> Self {
		Self {
			markdown: MarkdownNormaliser,
		}
	}
}

impl Default for GithubIssueNormaliser {
	fn default() -> Self {
		Self::new()
	}
}

impl Normaliser for GithubIssueNormaliser {
	fn supported_types(&self) -> &[&str] {
		&[MIME_ISSUE, MIME_PULL_REQUEST]
	}

	fn priority(&self) -> u8 {
		90
	}

	fn normalise(&self, content: &str, _mime_type: &str) -> String {
		self.markdown.normalise(content, "text/markdown")
	}
}
