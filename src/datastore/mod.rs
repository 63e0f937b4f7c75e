//! The `Datastore`: one index, one vector store and one embedding
//! provider wired together behind the pipeline operations.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ingest`](Datastore::ingest) | Run one file through its ingestion flow and commit it |
//! | [`retrieve`](Datastore::retrieve) | Query one or more datasets through a retrieval flow |
//! | [`create_dataset`](Datastore::create_dataset) | Register a dataset and its collection |
//! | [`update_dataset`](Datastore::update_dataset) | Edit metadata or the embedding binding |
//! | [`delete_dataset`](Datastore::delete_dataset) | Drop a dataset with its files and documents |
//! | [`find_file`](Datastore::find_file) / [`delete_file`](Datastore::delete_file) | File lookup and removal |
//! | [`prune_files`](Datastore::prune_files) | Remove files under a path that no longer exist |
//! | [`export_datasets`](Datastore::export_datasets) / [`import_datasets`](Datastore::import_datasets) | JSON snapshot round trip |

mod export;
mod ingest;
mod retrieve;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Context;

use knowledge_core::dedup::{DedupRegistry, DuplicatePolicy};
use knowledge_core::embedding::EmbeddingProvider;
use knowledge_core::error::KnowledgeError;
use knowledge_core::models::{keys, Dataset, EmbeddingsProviderConfig, File, Metadata};
use knowledge_core::store::{Index, MetadataFilter, VectorStore};
use knowledge_core::textsplitter::TextSplitterOpts;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_store::SqliteVectorStore;

pub use export::{ExportFile, ExportedDataset, ExportedFile, EXPORT_VERSION};
pub use ingest::{IngestOpts, IngestOutcome, ModelPreference};
pub use retrieve::RetrieveOpts;

type PathKey = (String, String);

pub struct Datastore {
    index: Arc<dyn Index>,
    vectorstore: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    dedup: DedupRegistry,
    splitter_opts: TextSplitterOpts,
    /// One async mutex per (dataset, absolute path) being ingested.
    path_locks: Mutex<HashMap<PathKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// A file reference: its id or its absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef {
    Id(String),
    Path(String),
}

/// Changes applied by [`Datastore::update_dataset`].
#[derive(Debug, Clone, Default)]
pub struct DatasetUpdate {
    pub metadata: Option<Metadata>,
    /// Replace the metadata instead of merging keys into it.
    pub replace_metadata: bool,
    pub embeddings_provider_config: Option<EmbeddingsProviderConfig>,
}

impl Datastore {
    pub fn new(
        index: Arc<dyn Index>,
        vectorstore: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            index,
            vectorstore,
            embedder,
            dedup: DedupRegistry::new(),
            splitter_opts: TextSplitterOpts::default(),
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_splitter_opts(mut self, opts: TextSplitterOpts) -> Self {
        self.splitter_opts = opts;
        self
    }

    /// Open the SQLite-backed datastore described by `config`, creating
    /// the schema if needed.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config).await.with_context(|| {
            format!("Failed to open database {}", config.db.path.display())
        })?;
        crate::migrate::run_migrations(&pool).await?;

        let embedder = create_provider(&config.embedding)?;
        let index = Arc::new(SqliteIndex::new(pool.clone()));
        let vectorstore = Arc::new(
            SqliteVectorStore::new(pool)
                .with_embedding_limits(config.embedding.concurrency, config.embedding.batch_size),
        );

        Ok(Self::new(index, vectorstore, embedder).with_splitter_opts(config.textsplitter.opts()))
    }

    pub fn index(&self) -> &Arc<dyn Index> {
        &self.index
    }

    pub fn vectorstore(&self) -> &Arc<dyn VectorStore> {
        &self.vectorstore
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn splitter_opts(&self) -> &TextSplitterOpts {
        &self.splitter_opts
    }

    /// Make a custom duplicate policy selectable by name in
    /// [`IngestOpts::is_duplicate_func_name`].
    pub fn register_dedup_policy(&mut self, name: &str, policy: Arc<dyn DuplicatePolicy>) {
        self.dedup.register(name, policy);
    }

    pub async fn create_dataset(
        &self,
        dataset_id: &str,
        metadata: Metadata,
        err_on_exists: bool,
    ) -> Result<Dataset, KnowledgeError> {
        if dataset_id.trim().is_empty() {
            return Err(KnowledgeError::InvalidInput(
                "dataset id must not be empty".to_string(),
            ));
        }
        let mut dataset = Dataset::new(dataset_id);
        dataset.metadata = metadata;

        self.index
            .create_dataset(&dataset, err_on_exists)
            .await
            .map_err(KnowledgeError::index)?;
        self.vectorstore
            .create_collection(dataset_id, false)
            .await
            .map_err(KnowledgeError::vector_store)?;

        tracing::info!(dataset = dataset_id, "created dataset");
        self.require_dataset(dataset_id, false).await
    }

    pub async fn get_dataset(
        &self,
        dataset_id: &str,
        include_files: bool,
    ) -> Result<Option<Dataset>, KnowledgeError> {
        self.index
            .get_dataset(dataset_id, include_files)
            .await
            .map_err(KnowledgeError::index)
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>, KnowledgeError> {
        self.index.list_datasets().await.map_err(KnowledgeError::index)
    }

    pub async fn update_dataset(
        &self,
        dataset_id: &str,
        update: DatasetUpdate,
    ) -> Result<Dataset, KnowledgeError> {
        let mut dataset = self.require_dataset(dataset_id, false).await?;

        if let Some(metadata) = update.metadata {
            if update.replace_metadata {
                dataset.metadata = metadata;
            } else {
                dataset.metadata.extend(metadata);
            }
        }
        if let Some(binding) = update.embeddings_provider_config {
            if let Some(old) = &dataset.embeddings_provider_config {
                if *old != binding {
                    tracing::warn!(
                        dataset = dataset_id,
                        old = %old,
                        new = %binding,
                        "rebinding dataset embeddings; existing vectors keep the old model"
                    );
                }
            }
            dataset.embeddings_provider_config = Some(binding);
        }

        self.index
            .update_dataset(&dataset)
            .await
            .map_err(KnowledgeError::index)?;
        Ok(dataset)
    }

    pub async fn delete_dataset(&self, dataset_id: &str) -> Result<(), KnowledgeError> {
        self.require_dataset(dataset_id, false).await?;
        self.index
            .delete_dataset(dataset_id)
            .await
            .map_err(KnowledgeError::index)?;
        self.vectorstore
            .remove_collection(dataset_id)
            .await
            .map_err(KnowledgeError::vector_store)?;
        tracing::info!(dataset = dataset_id, "deleted dataset");
        Ok(())
    }

    /// The file with the given id, or the file most recently indexed under
    /// the given absolute path.
    pub async fn find_file(
        &self,
        dataset_id: &str,
        file: &FileRef,
    ) -> Result<Option<File>, KnowledgeError> {
        self.require_dataset(dataset_id, false).await?;
        match file {
            FileRef::Id(id) => self
                .index
                .get_file(dataset_id, id)
                .await
                .map_err(KnowledgeError::index),
            FileRef::Path(path) => Ok(self
                .index
                .find_files_by_path(dataset_id, path)
                .await
                .map_err(KnowledgeError::index)?
                .into_iter()
                .max_by_key(|f| f.metadata.modified_at)),
        }
    }

    /// Remove a file's documents from the vector store and its record from
    /// the index. Returns false when no such file exists.
    pub async fn delete_file(
        &self,
        dataset_id: &str,
        file: &FileRef,
    ) -> Result<bool, KnowledgeError> {
        let Some(found) = self.find_file(dataset_id, file).await? else {
            return Ok(false);
        };
        self.remove_file(&found).await?;
        Ok(true)
    }

    async fn remove_file(&self, file: &File) -> Result<(), KnowledgeError> {
        let mut filter = MetadataFilter::new();
        filter.insert(
            keys::ABSOLUTE_PATH.to_string(),
            file.metadata.absolute_path.clone(),
        );
        let removed = self
            .vectorstore
            .remove_documents(&file.dataset_id, &filter)
            .await
            .map_err(KnowledgeError::vector_store)?;
        self.index
            .delete_file(&file.dataset_id, &file.id)
            .await
            .map_err(KnowledgeError::index)?;
        tracing::info!(
            dataset = %file.dataset_id,
            absolute_path = %file.metadata.absolute_path,
            num_documents = removed,
            "deleted file"
        );
        Ok(())
    }

    pub async fn delete_document(
        &self,
        dataset_id: &str,
        document_id: &str,
    ) -> Result<(), KnowledgeError> {
        self.vectorstore
            .remove_document(dataset_id, document_id)
            .await
            .map_err(KnowledgeError::vector_store)?;
        self.index
            .delete_document(dataset_id, document_id)
            .await
            .map_err(KnowledgeError::index)
    }

    /// Delete every file under `path_prefix` whose absolute path is not in
    /// `keep`. Returns the pruned files.
    pub async fn prune_files(
        &self,
        dataset_id: &str,
        path_prefix: &str,
        keep: &HashSet<String>,
    ) -> Result<Vec<File>, KnowledgeError> {
        self.require_dataset(dataset_id, false).await?;
        let candidates = self
            .index
            .find_files_by_prefix(dataset_id, path_prefix)
            .await
            .map_err(KnowledgeError::index)?;

        let mut pruned = Vec::new();
        for file in candidates {
            if keep.contains(&file.metadata.absolute_path) {
                continue;
            }
            {
                let path_lock = self.path_lock(dataset_id, &file.metadata.absolute_path);
                let _guard = path_lock.lock().await;
                self.remove_file(&file).await?;
            }
            pruned.push(file);
        }
        Ok(pruned)
    }

    async fn require_dataset(
        &self,
        dataset_id: &str,
        include_files: bool,
    ) -> Result<Dataset, KnowledgeError> {
        self.get_dataset(dataset_id, include_files)
            .await?
            .ok_or_else(|| KnowledgeError::DatasetNotFound(dataset_id.to_string()))
    }

    /// Resolve the provider to embed with for `dataset`.
    ///
    /// Datasets are bound to one embedding model. When the configured
    /// model differs, `preference` decides which one wins; in strict mode
    /// any remaining difference between the effective provider and the
    /// binding is an error.
    fn embedder_for(
        &self,
        dataset: &Dataset,
        preference: ModelPreference,
        strict: bool,
    ) -> Result<Arc<dyn EmbeddingProvider>, KnowledgeError> {
        let Some(attached) = &dataset.embeddings_provider_config else {
            return Ok(self.embedder.clone());
        };
        let configured = self.embedder.config();
        if *attached == configured {
            return Ok(self.embedder.clone());
        }

        if attached.provider_type != configured.provider_type {
            tracing::warn!(
                dataset = %dataset.id,
                attached = %attached.provider_type,
                configured = %configured.provider_type,
                "embeddings provider mismatch"
            );
        }

        let effective = if attached.model != configured.model
            && preference == ModelPreference::PreferDataset
        {
            tracing::warn!(
                dataset = %dataset.id,
                attached = %attached.model,
                configured = %configured.model,
                "embedding model mismatch, using the dataset's model"
            );
            self.embedder.with_model(&attached.model, attached.dims)
        } else {
            if attached.model != configured.model {
                tracing::warn!(
                    dataset = %dataset.id,
                    attached = %attached.model,
                    configured = %configured.model,
                    "embedding model mismatch, using the configured model"
                );
            }
            self.embedder.clone()
        };

        if strict && effective.config() != *attached {
            return Err(KnowledgeError::EmbeddingProviderMismatch {
                dataset: dataset.id.clone(),
                attached: attached.to_string(),
                configured: effective.config().to_string(),
            });
        }
        Ok(effective)
    }

    pub(crate) fn path_lock(&self, dataset_id: &str, absolute_path: &str) -> PathLock<'_> {
        let key = (dataset_id.to_string(), absolute_path.to_string());
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = locks.entry(key.clone()).or_default().clone();
        PathLock {
            locks: &self.path_locks,
            key,
            lock,
        }
    }
}

/// Handle on the mutex serializing work on one (dataset, path). Dropping
/// the last handle removes the map entry, including when the owning
/// future is cancelled while waiting.
pub(crate) struct PathLock<'a> {
    locks: &'a Mutex<HashMap<PathKey, Arc<tokio::sync::Mutex<()>>>>,
    key: PathKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl PathLock<'_> {
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for PathLock<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // map + this handle
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use knowledge_core::store::memory::{InMemoryIndex, InMemoryVectorStore};

    fn datastore() -> Datastore {
        Datastore::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashingProvider::with_dims(16)),
        )
    }

    fn binding(provider: &str, model: &str, dims: usize) -> EmbeddingsProviderConfig {
        EmbeddingsProviderConfig {
            provider_type: provider.to_string(),
            model: model.to_string(),
            dims,
        }
    }

    #[tokio::test]
    async fn test_create_dataset_rejects_empty_id() {
        let ds = datastore();
        let err = ds.create_dataset(" ", Metadata::new(), false).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_update_dataset_merges_or_replaces_metadata() {
        let ds = datastore();
        let mut meta = Metadata::new();
        meta.insert("a".into(), 1.into());
        ds.create_dataset("d", meta, true).await.unwrap();

        let mut more = Metadata::new();
        more.insert("b".into(), 2.into());
        let updated = ds
            .update_dataset(
                "d",
                DatasetUpdate {
                    metadata: Some(more.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.metadata.len(), 2);

        let replaced = ds
            .update_dataset(
                "d",
                DatasetUpdate {
                    metadata: Some(more),
                    replace_metadata: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replaced.metadata.len(), 1);
        assert!(replaced.metadata.contains_key("b"));
    }

    #[tokio::test]
    async fn test_missing_dataset_operations() {
        let ds = datastore();
        assert!(matches!(
            ds.delete_dataset("nope").await.unwrap_err(),
            KnowledgeError::DatasetNotFound(_)
        ));
        assert!(matches!(
            ds.update_dataset("nope", DatasetUpdate::default())
                .await
                .unwrap_err(),
            KnowledgeError::DatasetNotFound(_)
        ));
    }

    #[test]
    fn test_embedder_for_prefers_dataset_model() {
        let ds = datastore();
        let mut dataset = Dataset::new("d");
        dataset.embeddings_provider_config = Some(binding("hash", "hash-8", 8));

        let embedder = ds
            .embedder_for(&dataset, ModelPreference::PreferDataset, false)
            .unwrap();
        assert_eq!(embedder.model_name(), "hash-8");
        assert_eq!(embedder.dims(), 8);

        let embedder = ds
            .embedder_for(&dataset, ModelPreference::PreferConfigured, false)
            .unwrap();
        assert_eq!(embedder.model_name(), "hash-16");
    }

    #[test]
    fn test_embedder_for_strict_mismatch() {
        let ds = datastore();
        let mut dataset = Dataset::new("d");
        dataset.embeddings_provider_config = Some(binding("hash", "hash-8", 8));
        let err = ds
            .embedder_for(&dataset, ModelPreference::PreferConfigured, true)
            .err()
            .unwrap();
        assert!(matches!(err, KnowledgeError::EmbeddingProviderMismatch { .. }));

        dataset.embeddings_provider_config = Some(binding("openai", "hash-16", 16));
        let err = ds
            .embedder_for(&dataset, ModelPreference::PreferDataset, true)
            .err()
            .unwrap();
        assert!(matches!(err, KnowledgeError::EmbeddingProviderMismatch { .. }));
    }

    #[test]
    fn test_path_locks_are_released() {
        let ds = datastore();
        let first = ds.path_lock("d", "/a");
        let second = ds.path_lock("d", "/a");
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        drop(second);
        assert_eq!(ds.path_locks.lock().unwrap().len(), 1);
        drop(first);
        assert!(ds.path_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_ingest_releases_path_lock() {
        let ds = datastore();
        ds.create_dataset("d", Metadata::new(), true).await.unwrap();
        let content = b"queued behind the held lock";

        let held = ds.path_lock("d", "/a.txt");
        let guard = held.lock().await;
        let opts = IngestOpts {
            file_metadata: Some(knowledge_core::models::FileMetadata {
                name: "a.txt".into(),
                absolute_path: "/a.txt".into(),
                size: content.len() as i64,
                modified_at: chrono::Utc::now(),
                checksum: None,
            }),
            ..Default::default()
        };
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ds.ingest("d", "a.txt", content, opts),
        )
        .await;
        assert!(waiting.is_err());

        drop(guard);
        drop(held);
        assert!(ds.path_locks.lock().unwrap().is_empty());
    }
}
