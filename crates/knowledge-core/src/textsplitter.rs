//! Token-aware text splitting.
//!
//! Two splitters are provided:
//!
//! - [`TokenTextSplitter`]: slides a window of `chunk_size` tokens over the
//!   text with a stride of `chunk_size - chunk_overlap`, so consecutive
//!   chunks share exactly `chunk_overlap` tokens.
//! - [`MarkdownTextSplitter`]: splits on the heading structure first. Every
//!   chunk carries the headings it sits under, chunks never span two
//!   sibling sections, and fenced code blocks are never cut.
//!
//! # Token estimation
//!
//! Tokens are estimated without a model vocabulary: the text is cut at
//! Unicode word boundaries and every segment longer than
//! [`MAX_CHARS_PER_TOKEN`] characters is cut again into pieces of at most
//! that length. One piece counts as one token. Pieces are contiguous, so
//! concatenating them reproduces the input exactly.
//!
//! `model_name` and `encoding_name` are carried in the options so that
//! flow configurations stay portable; the estimator does not depend on
//! them.

use std::sync::Arc;

use pulldown_cmark::{Event, Options, Parser, Tag};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{decode_options, KnowledgeError};
use crate::filetype::FileType;
use crate::models::Document;

pub const DEFAULT_CHUNK_SIZE: usize = 2048;
pub const DEFAULT_CHUNK_OVERLAP: usize = 256;
pub const DEFAULT_MODEL_NAME: &str = "gpt-4o";
pub const DEFAULT_ENCODING_NAME: &str = "cl100k_base";

/// Approximate characters per token (cl100k averages close to four).
pub const MAX_CHARS_PER_TOKEN: usize = 4;

pub const TOKEN_SPLITTER: &str = "text";
pub const MARKDOWN_SPLITTER: &str = "markdown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextSplitterOpts {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub model_name: String,
    pub encoding_name: String,
}

impl Default for TextSplitterOpts {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            model_name: DEFAULT_MODEL_NAME.to_string(),
            encoding_name: DEFAULT_ENCODING_NAME.to_string(),
        }
    }
}

impl TextSplitterOpts {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), KnowledgeError> {
        if self.chunk_size == 0 {
            return Err(KnowledgeError::InvalidConfig(
                "chunkSize must be > 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(KnowledgeError::InvalidConfig(format!(
                "chunkOverlap ({}) must be smaller than chunkSize ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// These options as a JSON object, for merging with per-flow overrides.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Splits document content into chunks.
pub trait TextSplitter: Send + Sync {
    fn name(&self) -> &str;

    fn split_text(&self, text: &str) -> Result<Vec<String>, KnowledgeError>;

    /// Split every document; each chunk inherits its source's metadata.
    fn split_documents(&self, docs: Vec<Document>) -> Result<Vec<Document>, KnowledgeError> {
        let mut out = Vec::new();
        for doc in docs {
            for chunk in self.split_text(&doc.content)? {
                out.push(Document::with_metadata(chunk, doc.metadata.clone()));
            }
        }
        Ok(out)
    }
}

/// Byte ranges of the estimated tokens of `text`, in order.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    for (offset, segment) in text.split_word_bound_indices() {
        let mut start = offset;
        let mut count = 0;
        for (i, _) in segment.char_indices() {
            if count == MAX_CHARS_PER_TOKEN {
                spans.push((start, offset + i));
                start = offset + i;
                count = 0;
            }
            count += 1;
        }
        spans.push((start, offset + segment.len()));
    }
    spans
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    token_spans(text).len()
}

#[derive(Debug, Clone)]
pub struct TokenTextSplitter {
    opts: TextSplitterOpts,
}

impl TokenTextSplitter {
    pub fn new(opts: TextSplitterOpts) -> Result<Self, KnowledgeError> {
        opts.validate()?;
        Ok(Self { opts })
    }

    pub fn opts(&self) -> &TextSplitterOpts {
        &self.opts
    }

    fn windows(&self, text: &str) -> Vec<String> {
        let spans = token_spans(text);
        let mut chunks = Vec::new();
        if spans.is_empty() {
            return chunks;
        }
        let step = self.opts.chunk_size - self.opts.chunk_overlap;
        let mut start = 0;
        loop {
            let end = (start + self.opts.chunk_size).min(spans.len());
            let chunk = &text[spans[start].0..spans[end - 1].1];
            if !chunk.trim().is_empty() {
                chunks.push(chunk.to_string());
            }
            if end == spans.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

impl TextSplitter for TokenTextSplitter {
    fn name(&self) -> &str {
        TOKEN_SPLITTER
    }

    fn split_text(&self, text: &str) -> Result<Vec<String>, KnowledgeError> {
        Ok(self.windows(text))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum BlockKind {
    Heading { level: usize, title: String },
    Code,
    Other,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    text: String,
}

/// Content between two headings, with the heading path leading to it.
#[derive(Debug, Default)]
struct Section {
    headings: Vec<(usize, String)>,
    blocks: Vec<Block>,
}

impl Section {
    fn is_empty(&self) -> bool {
        self.headings.is_empty() && self.blocks.is_empty()
    }

    fn prefix(&self) -> String {
        self.headings
            .iter()
            .map(|(level, title)| format!("{} {}", "#".repeat(*level), title))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Top-level markdown blocks with their source text.
fn markdown_blocks(text: &str) -> Vec<Block> {
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut kind = BlockKind::Other;
    let mut heading = String::new();

    for (event, range) in Parser::new_ext(text, options).into_offset_iter() {
        match event {
            Event::Start(tag) => {
                if depth == 0 {
                    start = range.start;
                    heading.clear();
                    kind = match tag {
                        Tag::Heading(level, ..) => BlockKind::Heading {
                            level: level as usize,
                            title: String::new(),
                        },
                        Tag::CodeBlock(_) => BlockKind::Code,
                        _ => BlockKind::Other,
                    };
                }
                depth += 1;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let kind = match std::mem::replace(&mut kind, BlockKind::Other) {
                        BlockKind::Heading { level, .. } => BlockKind::Heading {
                            level,
                            title: heading.trim().to_string(),
                        },
                        other => other,
                    };
                    let block_text = text[start..range.end].trim_end().to_string();
                    blocks.push(Block {
                        kind,
                        text: block_text,
                    });
                }
            }
            Event::Text(t) | Event::Code(t) if matches!(kind, BlockKind::Heading { .. }) => {
                heading.push_str(&t);
            }
            // Top-level leaves without a container: rules, raw HTML.
            _ if depth == 0 => {
                let leaf = text[range].trim_end();
                if !leaf.trim().is_empty() {
                    blocks.push(Block {
                        kind: BlockKind::Other,
                        text: leaf.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    blocks
}

fn markdown_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = Section::default();

    for block in markdown_blocks(text) {
        match block.kind {
            BlockKind::Heading { level, title } => {
                if !current.is_empty() {
                    sections.push(std::mem::take(&mut current));
                }
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title));
                current.headings = stack.clone();
            }
            _ => current.blocks.push(block),
        }
    }
    if !current.is_empty() {
        sections.push(current);
    }
    sections
}

/// Markdown-aware splitter. Falls back to token windows inside a section
/// when a single paragraph is larger than the chunk budget.
#[derive(Debug, Clone)]
pub struct MarkdownTextSplitter {
    opts: TextSplitterOpts,
}

impl MarkdownTextSplitter {
    pub fn new(opts: TextSplitterOpts) -> Result<Self, KnowledgeError> {
        opts.validate()?;
        Ok(Self { opts })
    }

    fn split_section(&self, section: &Section, out: &mut Vec<String>) -> Result<(), KnowledgeError> {
        let mut prefix = section.prefix();
        let mut prefix_tokens = if prefix.is_empty() {
            0
        } else {
            estimate_tokens(&prefix) + 2
        };
        if prefix_tokens >= self.opts.chunk_size {
            // The heading path alone does not fit; keep the content.
            prefix.clear();
            prefix_tokens = 0;
        }
        let budget = self.opts.chunk_size - prefix_tokens;

        let emit = |body: &str, out: &mut Vec<String>| {
            if body.trim().is_empty() {
                return;
            }
            if prefix.is_empty() {
                out.push(body.to_string());
            } else {
                out.push(format!("{}\n\n{}", prefix, body));
            }
        };

        if section.blocks.is_empty() {
            if !prefix.is_empty() {
                out.push(prefix.clone());
            }
            return Ok(());
        }

        let mut pending: Vec<&str> = Vec::new();
        let mut pending_tokens = 0usize;
        for block in &section.blocks {
            let tokens = estimate_tokens(&block.text);
            let joined = if pending.is_empty() {
                tokens
            } else {
                pending_tokens + 2 + tokens
            };
            if joined <= budget {
                pending.push(&block.text);
                pending_tokens = joined;
                continue;
            }
            if !pending.is_empty() {
                emit(&pending.join("\n\n"), out);
                pending.clear();
                pending_tokens = 0;
            }
            if tokens <= budget {
                pending.push(&block.text);
                pending_tokens = tokens;
            } else if block.kind == BlockKind::Code {
                emit(&block.text, out);
            } else {
                let overlap = self.opts.chunk_overlap.min(budget.saturating_sub(1));
                let inner = TokenTextSplitter::new(TextSplitterOpts {
                    chunk_size: budget,
                    chunk_overlap: overlap,
                    ..self.opts.clone()
                })?;
                for piece in inner.windows(&block.text) {
                    emit(&piece, out);
                }
            }
        }
        if !pending.is_empty() {
            emit(&pending.join("\n\n"), out);
        }
        Ok(())
    }
}

impl TextSplitter for MarkdownTextSplitter {
    fn name(&self) -> &str {
        MARKDOWN_SPLITTER
    }

    fn split_text(&self, text: &str) -> Result<Vec<String>, KnowledgeError> {
        let mut out = Vec::new();
        for section in markdown_sections(text) {
            self.split_section(&section, &mut out)?;
        }
        Ok(out)
    }
}

/// Shallow merge of two JSON option objects; keys in `overrides` win.
pub fn merge_options(
    base: Option<&serde_json::Value>,
    overrides: Option<&serde_json::Value>,
) -> Option<serde_json::Value> {
    match (base, overrides) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(serde_json::Value::Object(b)), Some(serde_json::Value::Object(o))) => {
            let mut merged = b.clone();
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            Some(serde_json::Value::Object(merged))
        }
        (Some(_), Some(o)) => Some(o.clone()),
    }
}

/// Build a splitter by registry name from an options blob.
pub fn get_text_splitter(
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<Arc<dyn TextSplitter>, KnowledgeError> {
    let opts: TextSplitterOpts = decode_options("textsplitter", name, options)?;
    match name {
        TOKEN_SPLITTER | "token" => Ok(Arc::new(TokenTextSplitter::new(opts)?)),
        MARKDOWN_SPLITTER => Ok(Arc::new(MarkdownTextSplitter::new(opts)?)),
        other => Err(KnowledgeError::unknown("textsplitter", other)),
    }
}

/// The splitter used when a flow does not name one.
pub fn default_text_splitter(
    filetype: FileType,
    opts: &TextSplitterOpts,
) -> Result<Arc<dyn TextSplitter>, KnowledgeError> {
    match filetype {
        FileType::Markdown => Ok(Arc::new(MarkdownTextSplitter::new(opts.clone())?)),
        _ => Ok(Arc::new(TokenTextSplitter::new(opts.clone())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans_text(text: &str) -> Vec<&str> {
        token_spans(text)
            .into_iter()
            .map(|(s, e)| &text[s..e])
            .collect()
    }

    #[test]
    fn test_token_spans_cover_text() {
        let text = "Hello, wonderful world!\n\nSecond paragraph.";
        let pieces = spans_text(text);
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| p.chars().count() <= MAX_CHARS_PER_TOKEN));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a b"), 3);
        // "hello" is cut into "hell" + "o"
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(TokenTextSplitter::new(TextSplitterOpts::new(0, 0)).is_err());
        assert!(TokenTextSplitter::new(TextSplitterOpts::new(10, 10)).is_err());
        assert!(MarkdownTextSplitter::new(TextSplitterOpts::new(10, 12)).is_err());
        assert!(TokenTextSplitter::new(TextSplitterOpts::new(10, 9)).is_ok());
    }

    #[test]
    fn test_token_windows_respect_size_and_overlap() {
        let text = (0..60)
            .map(|i| char::from(b'a' + (i % 26) as u8).to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let splitter = TokenTextSplitter::new(TextSplitterOpts::new(10, 3)).unwrap();
        let chunks = splitter.split_text(&text).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(estimate_tokens(chunk) <= 10);
        }
        for pair in chunks.windows(2) {
            let left = spans_text(&pair[0]);
            let right = spans_text(&pair[1]);
            assert_eq!(left[left.len() - 3..], right[..3]);
        }
        assert!(text.ends_with(chunks.last().unwrap().as_str()));
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        let splitter = TokenTextSplitter::new(TextSplitterOpts::new(4, 1)).unwrap();
        assert!(splitter.split_text("").unwrap().is_empty());
        assert!(splitter.split_text("   \n\n  \t ").unwrap().is_empty());
    }

    #[test]
    fn test_split_documents_copies_metadata() {
        let mut meta = crate::models::Metadata::new();
        meta.insert("page".into(), 3.into());
        let doc = Document::with_metadata("one two three four five six seven", meta);
        let splitter = TokenTextSplitter::new(TextSplitterOpts::new(5, 1)).unwrap();
        let chunks = splitter.split_documents(vec![doc]).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.metadata["page"] == 3));
    }

    #[test]
    fn test_markdown_prefixes_heading_hierarchy() {
        let md = "# Guide\n\nIntro text.\n\n## Install\n\nRun the installer.\n\n## Usage\n\nCall it.\n";
        let splitter = MarkdownTextSplitter::new(TextSplitterOpts::new(200, 20)).unwrap();
        let chunks = splitter.split_text(md).unwrap();
        assert_eq!(
            chunks,
            vec![
                "# Guide\n\nIntro text.".to_string(),
                "# Guide\n## Install\n\nRun the installer.".to_string(),
                "# Guide\n## Usage\n\nCall it.".to_string(),
            ]
        );
    }

    #[test]
    fn test_markdown_heading_only_section_is_emitted() {
        let md = "# Top\n## Child\n\nbody\n";
        let splitter = MarkdownTextSplitter::new(TextSplitterOpts::new(200, 0)).unwrap();
        let chunks = splitter.split_text(md).unwrap();
        assert_eq!(chunks[0], "# Top");
        assert_eq!(chunks[1], "# Top\n## Child\n\nbody");
    }

    #[test]
    fn test_markdown_keeps_code_block_atomic() {
        let code = (0..40)
            .map(|i| format!("let value_{i} = compute({i});"))
            .collect::<Vec<_>>()
            .join("\n");
        let md = format!("# Code\n\nShort intro.\n\n```rust\n{}\n```\n\nAfter.\n", code);
        let splitter = MarkdownTextSplitter::new(TextSplitterOpts::new(30, 5)).unwrap();
        let chunks = splitter.split_text(&md).unwrap();
        let fenced: Vec<&String> = chunks.iter().filter(|c| c.contains("```rust")).collect();
        assert_eq!(fenced.len(), 1);
        assert!(fenced[0].contains("let value_0 = compute(0);"));
        assert!(fenced[0].contains("let value_39 = compute(39);"));
        assert!(fenced[0].trim_end().ends_with("```"));
        assert!(chunks.iter().any(|c| c.ends_with("After.")));
    }

    #[test]
    fn test_markdown_long_paragraph_falls_back_to_tokens() {
        let para = (0..200).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let md = format!("# Long\n\n{}\n", para);
        let splitter = MarkdownTextSplitter::new(TextSplitterOpts::new(50, 5)).unwrap();
        let chunks = splitter.split_text(&md).unwrap();
        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(chunk.starts_with("# Long\n\n"));
            assert!(estimate_tokens(chunk) <= 50);
        }
    }

    #[test]
    fn test_markdown_without_headings() {
        let splitter = MarkdownTextSplitter::new(TextSplitterOpts::new(100, 10)).unwrap();
        let chunks = splitter.split_text("just a paragraph\n\nand another").unwrap();
        assert_eq!(chunks, vec!["just a paragraph\n\nand another".to_string()]);
    }

    #[test]
    fn test_registry_and_merge() {
        let global = serde_json::json!({"chunkSize": 100, "chunkOverlap": 10});
        let local = serde_json::json!({"chunkOverlap": 20});
        let merged = merge_options(Some(&global), Some(&local)).unwrap();
        assert_eq!(merged["chunkSize"], 100);
        assert_eq!(merged["chunkOverlap"], 20);

        let splitter = get_text_splitter("markdown", Some(&merged)).unwrap();
        assert_eq!(splitter.name(), "markdown");
        assert!(matches!(
            get_text_splitter("nope", None),
            Err(KnowledgeError::UnknownComponent { .. })
        ));
        assert!(matches!(
            get_text_splitter("text", Some(&serde_json::json!({"chunkSize": 5, "chunkOverlap": 5}))),
            Err(KnowledgeError::InvalidConfig(_))
        ));
    }
}
