//! In-memory [`VectorStore`] and [`Index`] implementations.
//!
//! Both use `std::sync::RwLock` around plain collections. Similarity search
//! is brute-force cosine over every vector in the collection. Used by the
//! test suites and by embedders of the library that do not need
//! persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, embed_missing, EmbeddingProvider};
use crate::models::{Dataset, Document, File, IndexDocument};

use super::{matches_filter, rank_by_similarity, Index, MetadataFilter, VectorStore};

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

/// In-memory vector store. Collections keep insertion order.
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    concurrency: usize,
    batch_size: usize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            concurrency: 4,
            batch_size: 64,
        }
    }

    pub fn with_embedding_limits(mut self, concurrency: usize, batch_size: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn collection_len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, collection: &str, err_on_exists: bool) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        if collections.contains_key(collection) {
            if err_on_exists {
                bail!("collection {:?} already exists", collection);
            }
            return Ok(());
        }
        collections.insert(collection.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_collection(&self, collection: &str) -> Result<()> {
        self.collections
            .write()
            .map_err(poisoned)?
            .remove(collection);
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        docs: &mut [Document],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<String>> {
        let exists = self
            .collections
            .read()
            .map_err(poisoned)?
            .contains_key(collection);
        if !exists {
            bail!("collection {:?} not found", collection);
        }
        for doc in docs.iter_mut().filter(|d| d.id.is_empty()) {
            doc.id = uuid::Uuid::new_v4().to_string();
        }
        embed_missing(docs, embedder, self.concurrency, self.batch_size).await?;

        let mut collections = self.collections.write().map_err(poisoned)?;
        let stored = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection {:?} was removed during insert", collection))?;
        for doc in docs.iter() {
            stored.retain(|d| d.id != doc.id);
            let mut doc = doc.clone();
            doc.similarity_score = None;
            stored.push(doc);
        }
        Ok(docs.iter().map(|d| d.id.clone()).collect())
    }

    async fn remove_document(&self, collection: &str, document_id: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        if let Some(stored) = collections.get_mut(collection) {
            stored.retain(|d| d.id != document_id);
        }
        Ok(())
    }

    async fn remove_documents(&self, collection: &str, filter: &MetadataFilter) -> Result<usize> {
        if filter.is_empty() {
            bail!("refusing to remove documents with an empty filter");
        }
        let mut collections = self.collections.write().map_err(poisoned)?;
        let Some(stored) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|d| !matches_filter(&d.metadata, filter));
        Ok(before - stored.len())
    }

    async fn get_documents(
        &self,
        collection: Option<&str>,
        filter: &MetadataFilter,
        content: Option<&str>,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let selected: Vec<&Vec<Document>> = match collection {
            Some(name) => collections.get(name).into_iter().collect(),
            None => collections.values().collect(),
        };
        Ok(selected
            .into_iter()
            .flatten()
            .filter(|d| matches_filter(&d.metadata, filter))
            .filter(|d| content.map(|c| d.content == c).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query_embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let stored = collections
            .get(collection)
            .ok_or_else(|| anyhow!("collection {:?} not found", collection))?;
        let mut hits: Vec<Document> = stored
            .iter()
            .filter(|d| matches_filter(&d.metadata, filter))
            .filter_map(|d| {
                let v = d.embedding.as_ref()?;
                let mut hit = d.clone();
                hit.similarity_score = Some(cosine_similarity(query_embedding, v));
                Some(hit)
            })
            .collect();
        rank_by_similarity(&mut hits, k);
        Ok(hits)
    }
}

/// In-memory metadata index.
#[derive(Default)]
pub struct InMemoryIndex {
    datasets: RwLock<BTreeMap<String, Dataset>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn strip_files(dataset: &Dataset, include_files: bool) -> Dataset {
    let mut out = dataset.clone();
    if !include_files {
        out.files.clear();
    }
    out
}

#[async_trait]
impl Index for InMemoryIndex {
    async fn create_dataset(&self, dataset: &Dataset, err_on_exists: bool) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        if datasets.contains_key(&dataset.id) {
            if err_on_exists {
                bail!("dataset {:?} already exists", dataset.id);
            }
            return Ok(());
        }
        let mut stored = dataset.clone();
        stored.files.clear();
        datasets.insert(dataset.id.clone(), stored);
        Ok(())
    }

    async fn get_dataset(&self, dataset_id: &str, include_files: bool) -> Result<Option<Dataset>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets
            .get(dataset_id)
            .map(|d| strip_files(d, include_files)))
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets.values().map(|d| strip_files(d, false)).collect())
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        let stored = datasets
            .get_mut(&dataset.id)
            .ok_or_else(|| anyhow!("dataset {:?} not found", dataset.id))?;
        stored.embeddings_provider_config = dataset.embeddings_provider_config.clone();
        stored.metadata = dataset.metadata.clone();
        Ok(())
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        self.datasets.write().map_err(poisoned)?.remove(dataset_id);
        Ok(())
    }

    async fn create_file(&self, file: &File) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        let dataset = datasets
            .get_mut(&file.dataset_id)
            .ok_or_else(|| anyhow!("dataset {:?} not found", file.dataset_id))?;
        dataset
            .files
            .retain(|f| f.metadata.absolute_path != file.metadata.absolute_path && f.id != file.id);
        dataset.files.push(file.clone());
        Ok(())
    }

    async fn delete_file(&self, dataset_id: &str, file_id: &str) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        if let Some(dataset) = datasets.get_mut(dataset_id) {
            dataset.files.retain(|f| f.id != file_id);
        }
        Ok(())
    }

    async fn get_file(&self, dataset_id: &str, file_id: &str) -> Result<Option<File>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets
            .get(dataset_id)
            .and_then(|d| d.files.iter().find(|f| f.id == file_id).cloned()))
    }

    async fn find_files_by_path(&self, dataset_id: &str, absolute_path: &str) -> Result<Vec<File>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets
            .get(dataset_id)
            .map(|d| {
                d.files
                    .iter()
                    .filter(|f| f.metadata.absolute_path == absolute_path)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_files_by_prefix(&self, dataset_id: &str, prefix: &str) -> Result<Vec<File>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets
            .get(dataset_id)
            .map(|d| {
                d.files
                    .iter()
                    .filter(|f| f.metadata.absolute_path.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_file_by_checksum(&self, dataset_id: &str, checksum: &str) -> Result<Option<File>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets.get(dataset_id).and_then(|d| {
            d.files
                .iter()
                .find(|f| f.metadata.checksum.as_deref() == Some(checksum))
                .cloned()
        }))
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<IndexDocument>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets
            .values()
            .flat_map(|d| d.files.iter())
            .flat_map(|f| f.documents.iter())
            .find(|doc| doc.id == document_id)
            .cloned())
    }

    async fn delete_document(&self, dataset_id: &str, document_id: &str) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        if let Some(dataset) = datasets.get_mut(dataset_id) {
            for file in dataset.files.iter_mut() {
                file.documents.retain(|d| d.id != document_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::CountingEmbedder;
    use crate::models::FileMetadata;
    use std::sync::atomic::Ordering;

    fn doc(content: &str, path: &str) -> Document {
        let meta = serde_json::json!({"absPath": path}).as_object().cloned().unwrap();
        Document::with_metadata(content, meta)
    }

    #[tokio::test]
    async fn test_add_requires_collection() {
        let store = InMemoryVectorStore::new();
        let embedder = CountingEmbedder::new("m");
        let mut docs = vec![doc("a", "/a")];
        assert!(store.add_documents("ds", &mut docs, &embedder).await.is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_search_and_remove() {
        let store = InMemoryVectorStore::new();
        let embedder = CountingEmbedder::new("m");
        store.create_collection("ds", false).await.unwrap();
        store.create_collection("ds", false).await.unwrap();
        assert!(store.create_collection("ds", true).await.is_err());

        let mut docs = vec![doc("aaaa", "/a"), doc("bbbbbbbbbbbbbbb", "/b")];
        let ids = store.add_documents("ds", &mut docs, &embedder).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| !id.is_empty()));

        let query = embedder.embed(&["aaaa".to_string()]).await.unwrap().remove(0);
        let hits = store
            .similarity_search("ds", &query, 1, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "aaaa");
        assert!((hits[0].similarity_score.unwrap() - 1.0).abs() < 1e-6);

        let mut filter = MetadataFilter::new();
        filter.insert("absPath".into(), "/a".into());
        assert_eq!(store.remove_documents("ds", &filter).await.unwrap(), 1);
        assert_eq!(store.collection_len("ds"), 1);
        assert!(store.remove_documents("ds", &MetadataFilter::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_get_documents_by_content() {
        let store = InMemoryVectorStore::new();
        let embedder = CountingEmbedder::new("m");
        store.create_collection("one", false).await.unwrap();
        store.create_collection("two", false).await.unwrap();
        store
            .add_documents("one", &mut [doc("shared", "/x")], &embedder)
            .await
            .unwrap();
        store
            .add_documents("two", &mut [doc("shared", "/y"), doc("other", "/z")], &embedder)
            .await
            .unwrap();

        let all = store
            .get_documents(None, &MetadataFilter::new(), Some("shared"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let scoped = store
            .get_documents(Some("two"), &MetadataFilter::new(), Some("shared"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(scoped[0].embedding.is_some());
    }

    fn file(dataset: &str, id: &str, path: &str, docs: &[&str]) -> File {
        File {
            id: id.to_string(),
            dataset_id: dataset.to_string(),
            metadata: FileMetadata::for_content(path, path.as_bytes()),
            documents: docs
                .iter()
                .enumerate()
                .map(|(i, d)| IndexDocument {
                    id: d.to_string(),
                    file_id: id.to_string(),
                    dataset_id: dataset.to_string(),
                    index: i,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_index_file_replacement_by_path() {
        let index = InMemoryIndex::new();
        index.create_dataset(&Dataset::new("ds"), true).await.unwrap();
        assert!(index.create_dataset(&Dataset::new("ds"), true).await.is_err());

        index.create_file(&file("ds", "f1", "/a.txt", &["d1", "d2"])).await.unwrap();
        index.create_file(&file("ds", "f2", "/a.txt", &["d3"])).await.unwrap();
        index.create_file(&file("ds", "f3", "/b.txt", &["d4"])).await.unwrap();

        let ds = index.get_dataset("ds", true).await.unwrap().unwrap();
        assert_eq!(ds.files.len(), 2);
        assert!(index.get_dataset("ds", false).await.unwrap().unwrap().files.is_empty());
        assert_eq!(index.find_files_by_path("ds", "/a.txt").await.unwrap()[0].id, "f2");
        assert!(index.get_document("d1").await.unwrap().is_none());
        assert_eq!(index.get_document("d4").await.unwrap().unwrap().file_id, "f3");
        assert_eq!(index.find_files_by_prefix("ds", "/").await.unwrap().len(), 2);

        index.delete_dataset("ds").await.unwrap();
        assert!(index.get_dataset("ds", false).await.unwrap().is_none());
        assert!(index.get_document("d4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_create_file_needs_dataset() {
        let index = InMemoryIndex::new();
        assert!(index.create_file(&file("nope", "f", "/a", &[])).await.is_err());
    }
}
