//! Document transformers applied after splitting.
//!
//! A transformer receives the full chunk list of one file and returns a
//! new list. Transformers run in configured order; the first failure aborts
//! the chain.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{decode_options, KnowledgeError};
use crate::models::{keys, Document, Metadata};

pub const EXTRA_METADATA: &str = "extra_metadata";
pub const FILTER_MARKDOWN_DOCS_NO_CONTENT: &str = "filter_markdown_docs_no_content";
pub const FILTER_SHORT_DOCS: &str = "filter_short_docs";

pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;
    fn transform(&self, docs: Vec<Document>) -> Result<Vec<Document>, KnowledgeError>;
}

/// Apply `transformers` in order.
pub fn run_transformers(
    transformers: &[Arc<dyn Transformer>],
    mut docs: Vec<Document>,
) -> Result<Vec<Document>, KnowledgeError> {
    for t in transformers {
        docs = t.transform(docs)?;
        tracing::trace!(transformer = t.name(), num_documents = docs.len(), "applied transformer");
    }
    Ok(docs)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraMetadataOpts {
    pub metadata: Metadata,
}

/// Merges a fixed metadata map into every document.
///
/// Configured instances never write the protected keys (`filename`,
/// `absPath`). The pipeline's own instance, built with
/// [`ExtraMetadata::mandatory`], owns those keys.
#[derive(Debug, Clone)]
pub struct ExtraMetadata {
    metadata: Metadata,
    owns_protected: bool,
}

impl ExtraMetadata {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            owns_protected: false,
        }
    }

    /// The transformer appended to every ingestion flow: writes the file
    /// identity keys and then any caller metadata that does not collide
    /// with them.
    pub fn mandatory(file_metadata: Metadata, extra: &Metadata) -> Self {
        let mut metadata = file_metadata;
        for (k, v) in extra {
            if keys::PROTECTED.contains(&k.as_str()) || metadata.contains_key(k) {
                continue;
            }
            metadata.insert(k.clone(), v.clone());
        }
        Self {
            metadata,
            owns_protected: true,
        }
    }
}

impl Transformer for ExtraMetadata {
    fn name(&self) -> &str {
        EXTRA_METADATA
    }

    fn transform(&self, mut docs: Vec<Document>) -> Result<Vec<Document>, KnowledgeError> {
        for doc in &mut docs {
            for (k, v) in &self.metadata {
                if !self.owns_protected && keys::PROTECTED.contains(&k.as_str()) {
                    continue;
                }
                doc.metadata.insert(k.clone(), v.clone());
            }
        }
        Ok(docs)
    }
}

/// Drops markdown chunks that consist only of headings.
#[derive(Debug, Clone, Default)]
pub struct FilterMarkdownDocsNoContent;

impl Transformer for FilterMarkdownDocsNoContent {
    fn name(&self) -> &str {
        FILTER_MARKDOWN_DOCS_NO_CONTENT
    }

    fn transform(&self, docs: Vec<Document>) -> Result<Vec<Document>, KnowledgeError> {
        Ok(docs
            .into_iter()
            .filter(|doc| {
                doc.content
                    .lines()
                    .map(str::trim)
                    .any(|line| !line.is_empty() && !line.starts_with('#'))
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterShortDocsOpts {
    /// Minimum trimmed content length in characters.
    pub min_length: usize,
}

#[derive(Debug, Clone)]
pub struct FilterShortDocs {
    min_length: usize,
}

impl FilterShortDocs {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

impl Transformer for FilterShortDocs {
    fn name(&self) -> &str {
        FILTER_SHORT_DOCS
    }

    fn transform(&self, docs: Vec<Document>) -> Result<Vec<Document>, KnowledgeError> {
        Ok(docs
            .into_iter()
            .filter(|d| d.content.trim().chars().count() >= self.min_length)
            .collect())
    }
}

/// Build a transformer by registry name from an options blob.
pub fn get_transformer(
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<Arc<dyn Transformer>, KnowledgeError> {
    match name {
        EXTRA_METADATA => {
            let opts: ExtraMetadataOpts = decode_options("transformer", name, options)?;
            Ok(Arc::new(ExtraMetadata::new(opts.metadata)))
        }
        FILTER_MARKDOWN_DOCS_NO_CONTENT => Ok(Arc::new(FilterMarkdownDocsNoContent)),
        FILTER_SHORT_DOCS => {
            let opts: FilterShortDocsOpts = decode_options("transformer", name, options)?;
            Ok(Arc::new(FilterShortDocs::new(opts.min_length)))
        }
        other => Err(KnowledgeError::unknown("transformer", other)),
    }
}
