//! Storage abstractions: the vector store and the metadata index.
//!
//! The [`VectorStore`] holds chunk content, metadata and embeddings, one
//! collection per dataset. The [`Index`] holds the relational view:
//! datasets, files and the ids of the chunks each file produced.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! [`memory`] provides in-memory reference backends; SQLite backends live
//! in the `knowledge` app crate.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::models::{value_as_string, Dataset, Document, File, IndexDocument, Metadata};

/// Metadata equality filter: every key must be present and render to the
/// given string (see [`value_as_string`]).
pub type MetadataFilter = BTreeMap<String, String>;

pub fn matches_filter(metadata: &Metadata, filter: &MetadataFilter) -> bool {
    filter.iter().all(|(k, want)| {
        metadata
            .get(k)
            .map(|v| value_as_string(v) == *want)
            .unwrap_or(false)
    })
}

/// Sort documents by descending similarity and keep the top `k`.
pub fn rank_by_similarity(docs: &mut Vec<Document>, k: usize) {
    docs.sort_by(|a, b| {
        b.similarity_score
            .unwrap_or(f32::MIN)
            .partial_cmp(&a.similarity_score.unwrap_or(f32::MIN))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    docs.truncate(k);
}

/// Vector store backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_collection`](VectorStore::create_collection) | Create the collection for a dataset |
/// | [`remove_collection`](VectorStore::remove_collection) | Drop a collection and all its documents |
/// | [`add_documents`](VectorStore::add_documents) | Embed missing vectors and persist documents |
/// | [`remove_document`](VectorStore::remove_document) | Delete one document by id |
/// | [`remove_documents`](VectorStore::remove_documents) | Delete every document matching a metadata filter |
/// | [`get_documents`](VectorStore::get_documents) | Fetch documents by metadata and/or exact content |
/// | [`similarity_search`](VectorStore::similarity_search) | Cosine top-k search |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a collection. Creating an existing collection is a no-op
    /// unless `err_on_exists` is set.
    async fn create_collection(&self, collection: &str, err_on_exists: bool) -> Result<()>;

    async fn remove_collection(&self, collection: &str) -> Result<()>;

    /// Persist `docs` into `collection`, embedding every document whose
    /// `embedding` is `None` with `embedder`. Documents without an id get
    /// a fresh one. Returns the ids in input order. The call is atomic: on
    /// error nothing was written.
    async fn add_documents(
        &self,
        collection: &str,
        docs: &mut [Document],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<String>>;

    async fn remove_document(&self, collection: &str, document_id: &str) -> Result<()>;

    /// Remove every document matching `filter`. An empty filter is
    /// rejected. Returns the number removed.
    async fn remove_documents(&self, collection: &str, filter: &MetadataFilter) -> Result<usize>;

    /// Documents matching `filter` and, when given, with content exactly
    /// equal to `content`. `collection = None` searches all collections.
    async fn get_documents(
        &self,
        collection: Option<&str>,
        filter: &MetadataFilter,
        content: Option<&str>,
    ) -> Result<Vec<Document>>;

    /// Up to `k` documents ordered by descending cosine similarity to
    /// `query_embedding`, with `similarity_score` set.
    async fn similarity_search(
        &self,
        collection: &str,
        query_embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Document>>;
}

/// Metadata index backend.
#[async_trait]
pub trait Index: Send + Sync {
    async fn create_dataset(&self, dataset: &Dataset, err_on_exists: bool) -> Result<()>;

    /// Look up a dataset; files (with their document ids) are loaded only
    /// when `include_files` is set.
    async fn get_dataset(&self, dataset_id: &str, include_files: bool) -> Result<Option<Dataset>>;

    async fn list_datasets(&self) -> Result<Vec<Dataset>>;

    /// Persist the dataset's embedding binding and metadata.
    async fn update_dataset(&self, dataset: &Dataset) -> Result<()>;

    /// Delete a dataset with all its files and document records.
    async fn delete_dataset(&self, dataset_id: &str) -> Result<()>;

    /// Insert a file with its documents as one unit. A file already
    /// indexed under the same absolute path in the dataset is replaced.
    async fn create_file(&self, file: &File) -> Result<()>;

    async fn delete_file(&self, dataset_id: &str, file_id: &str) -> Result<()>;

    async fn get_file(&self, dataset_id: &str, file_id: &str) -> Result<Option<File>>;

    async fn find_files_by_path(&self, dataset_id: &str, absolute_path: &str) -> Result<Vec<File>>;

    /// Files whose absolute path starts with `prefix`.
    async fn find_files_by_prefix(&self, dataset_id: &str, prefix: &str) -> Result<Vec<File>>;

    async fn find_file_by_checksum(&self, dataset_id: &str, checksum: &str) -> Result<Option<File>>;

    async fn get_document(&self, document_id: &str) -> Result<Option<IndexDocument>>;

    async fn delete_document(&self, dataset_id: &str, document_id: &str) -> Result<()>;
}
