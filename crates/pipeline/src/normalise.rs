//! MIME-dispatched content normalisation.
//!
//! Priority bands: 90-100 connector-specific, 50-89 format-specific,
//! 10-49 generic, 1-9 fallback. Normalisation is pure and total:
//! malformed content degrades to best-effort text, never an error.

use std::sync::Arc;

use parking_lot::RwLock;

/// Turns raw provider content into clean indexable text.
pub trait Normaliser: Send + Sync {
	/// MIME patterns this normaliser handles: exact (`text/html`),
	/// type wildcard (`text/*`), or the catch-all `*/*`.
	fn supported_types(&self) -> &[&str];

	/// Tiebreaker among matching normalisers; highest wins.
	fn priority(&self) -> u8;

	/// Produce clean text from `content`.
	fn normalise(&self, content: &str, mime_type: &str) -> String;
}

/// Strips parameters and lowercases a MIME type for matching.
pub fn canonical_mime(mime_type: &str) -> String {
	let base = mime_type.split(';').next().unwrap_or(mime_type);
	base.trim().to_ascii_lowercase()
}

fn pattern_matches(pattern: &str, mime: &str) -> bool {
	if pattern == "*/*" {
		return true;
	}
	if let Some(prefix) = pattern.strip_suffix("/*") {
		return mime.split('/').next() == Some(prefix);
	}
	pattern == mime
}

/// Priority-ordered normaliser dispatch.
///
/// Registration happens once at startup; lookups are concurrent reads.
pub struct NormaliserRegistry {
	entries: RwLock<Vec<Arc<dyn Normaliser>>>,
}

impl NormaliserRegistry {
	/// Empty registry with no normalisers.
	pub fn empty() -> Self {
		Self {
			entries: RwLock::new(Vec::new()),
		}
	}

	/// Registry preloaded with the built-in normalisers.
	pub fn with_defaults() -> Self {
		let registry = Self::empty();
		registry.register(Arc::new(PlainTextNormaliser));
		registry.register(Arc::new(MarkdownNormaliser));
		registry.register(Arc::new(HtmlNormaliser));
		registry
	}

	/// Add a normaliser.
	pub fn register(&self, normaliser: Arc<dyn Normaliser>) {
		self.entries.write().push(normaliser);
	}

	/// Find the highest-priority normaliser matching `mime_type`.
	pub fn get(&self, mime_type: &str) -> Option<Arc<dyn Normaliser>> {
		let mime = canonical_mime(mime_type);
		let entries = self.entries.read();

		entries
			.iter()
			.filter(|n| n.supported_types().iter().any(|p| pattern_matches(p, &mime)))
			.max_by_key(|n| n.priority())
			.cloned()
	}
}

impl Default for NormaliserRegistry {
	fn default() -> Self {
		Self::with_defaults()
	}
}

impl std::fmt::Debug for NormaliserRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NormaliserRegistry")
			.field("len", &self.entries.read().len())
			.finish()
	}
}

/// Fallback normaliser: passes text through, trimming trailing space.
pub struct PlainTextNormaliser;

impl Normaliser for PlainTextNormaliser {
	fn supported_types(&self) -> &[&str] {
		&["text/plain", "*/*"]
	}

	fn priority(&self) -> u8 {
		1
	}

	fn normalise(&self, content: &str, _mime_type: &str) -> String {
		let mut out = String::with_capacity(content.len());
		for line in content.lines() {
			out.push_str(line.trim_end());
			out.push('\n');
		}
		while out.ends_with('\n') {
			out.pop();
		}
		out
	}
}

/// Markdown cleaner: drops markup that hurts retrieval while keeping
/// the prose and code content.
pub struct MarkdownNormaliser;

impl Normaliser for MarkdownNormaliser {
	fn supported_types(&self) -> &[&str] {
		&["text/markdown", "text/x-markdown"]
	}

	fn priority(&self) -> u8 {
		50
	}

	fn normalise(&self, content: &str, _mime_type: &str) -> String {
		let mut out = String::with_capacity(content.len());

		for line in content.lines() {
			let trimmed = line.trim_end();

			// Fence markers carry no content.
			if trimmed.trim_start().starts_with("```") {
				continue;
			}

			let stripped = trimmed.trim_start_matches('#').trim_start();
			let line = if trimmed.starts_with('#') { stripped } else { trimmed };

			out.push_str(&strip_inline_markdown(line));
			out.push('\n');
		}

		while out.ends_with('\n') {
			out.pop();
		}
		out
	}
}

/// Rewrites `[text](url)` to `text` and drops emphasis markers.
fn strip_inline_markdown(line: &str) -> String {
	let mut out = String::with_capacity(line.len());
	let mut chars = line.chars().peekable();

	while let Some(c) = chars.next() {
		match c {
			'[' => {
				// Collect the link text, then skip a following (url).
				let mut text = String::new();
				let mut closed = false;
				for inner in chars.by_ref() {
					if inner == ']' {
						closed = true;
						break;
					}
					text.push(inner);
				}
				if closed && chars.peek() == Some(&'(') {
					chars.next();
					for inner in chars.by_ref() {
						if inner == ')' {
							break;
						}
					}
					out.push_str(&text);
				} else {
					out.push('[');
					out.push_str(&text);
					if closed {
						out.push(']');
					}
				}
			}
			'*' | '_' | '`' => {}
			_ => out.push(c),
		}
	}

	out
}

/// Best-effort HTML tag stripper.
pub struct HtmlNormaliser;

impl Normaliser for HtmlNormaliser {
	fn supported_types(&self) -> &[&str] {
		&["text/html", "application/xhtml+xml"]
	}

	fn priority(&self) -> u8 {
		50
	}

	fn normalise(&self, content: &str, _mime_type: &str) -> String {
		let mut out = String::with_capacity(content.len());
		let mut rest = content;
		let mut skip_until: Option<&str> = None;

		while let Some(open) = rest.find('<') {
			if skip_until.is_none() {
				out.push_str(&rest[..open]);
			}
			rest = &rest[open..];

			let Some(close) = rest.find('>') else {
				// Unterminated tag: treat the remainder as text.
				if skip_until.is_none() {
					out.push_str(rest);
				}
				rest = "";
				break;
			};

			let tag = &rest[1..close];
			let name = tag
				.trim_start_matches('/')
				.split([' ', '\t', '\n', '/'])
				.next()
				.unwrap_or("")
				.to_ascii_lowercase();

			match skip_until {
				Some(until) if tag.starts_with('/') && name == until => skip_until = None,
				None if name == "script" || name == "style" => {
					if !tag.ends_with('/') {
						skip_until = Some(if name == "script" { "script" } else { "style" });
					}
				}
				_ => {}
			}

			// Block-level boundaries become line breaks.
			if skip_until.is_none()
				&& matches!(name.as_str(), "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
			{
				out.push('\n');
			}

			rest = &rest[close + 1..];
		}
		if skip_until.is_none() {
			out.push_str(rest);
		}

		decode_entities(&squash_lines(&out))
	}
}

/// One trimmed line per text run; markup-induced blank lines carry no
/// signal for retrieval.
fn squash_lines(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	for line in text.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() {
			continue;
		}
		if !out.is_empty() {
			out.push('\n');
		}
		out.push_str(trimmed);
	}
	out
}

fn decode_entities(text: &str) -> String {
	text.replace("&amp;", "&")
		.replace("&lt;", "<")
		.replace("&gt;", ">")
		.replace("&quot;", "\"")
		.replace("&#39;", "'")
		.replace("&nbsp;", " ")
}
