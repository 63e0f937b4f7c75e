//! Single-file ingestion: detect, dedupe, run the flow, embed, commit.

use std::sync::Arc;
use std::time::Instant;

use knowledge_core::dedup::DuplicatePolicy;
use knowledge_core::embedding::{EmbeddingCache, EmbeddingProvider};
use knowledge_core::error::KnowledgeError;
use knowledge_core::filetype::detect_filetype;
use knowledge_core::models::{
    content_checksum, keys, Dataset, Document, File, FileMetadata, IndexDocument, Metadata,
};
use knowledge_core::store::MetadataFilter;
use knowledge_core::transformers::ExtraMetadata;

use super::Datastore;
use crate::flows::IngestionFlow;

/// Which model wins when a dataset's binding and the configured provider
/// disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelPreference {
    #[default]
    PreferDataset,
    PreferConfigured,
}

#[derive(Clone, Default)]
pub struct IngestOpts {
    /// Identity of the file. Defaults to an in-memory file named after the
    /// `filename` argument.
    pub file_metadata: Option<FileMetadata>,
    /// Registered duplicate policy to use. Takes precedence over
    /// `is_duplicate_func`.
    pub is_duplicate_func_name: Option<String>,
    pub is_duplicate_func: Option<Arc<dyn DuplicatePolicy>>,
    /// Candidate flows; the first one supporting the detected filetype runs.
    pub ingestion_flows: Vec<IngestionFlow>,
    /// Added to every document, never overriding the pipeline's own keys.
    pub extra_metadata: Metadata,
    pub reuse_embeddings: bool,
    pub err_on_unsupported_file: bool,
    pub model_preference: ModelPreference,
    pub strict_embedding_config: bool,
    /// Shared across calls so identical chunks are embedded once.
    pub embedding_cache: Option<Arc<EmbeddingCache>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Document ids in chunk order.
    Ingested(Vec<String>),
    Duplicate,
    Unsupported { filetype: String },
    /// The flow produced no documents.
    Empty,
}

impl IngestOutcome {
    pub fn document_ids(&self) -> &[String] {
        match self {
            IngestOutcome::Ingested(ids) => ids,
            _ => &[],
        }
    }
}

impl Datastore {
    /// Ingest one file and return the ids of the documents it produced.
    /// Duplicates, empty files and (unless `err_on_unsupported_file`)
    /// unsupported files yield an empty list.
    pub async fn ingest(
        &self,
        dataset_id: &str,
        filename: &str,
        content: &[u8],
        opts: IngestOpts,
    ) -> Result<Vec<String>, KnowledgeError> {
        match self
            .ingest_with_outcome(dataset_id, filename, content, opts)
            .await?
        {
            IngestOutcome::Ingested(ids) => Ok(ids),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn ingest_with_outcome(
        &self,
        dataset_id: &str,
        filename: &str,
        content: &[u8],
        opts: IngestOpts,
    ) -> Result<IngestOutcome, KnowledgeError> {
        if filename.is_empty() {
            return Err(KnowledgeError::InvalidInput(
                "filename is required".to_string(),
            ));
        }

        let mut dataset = self.require_dataset(dataset_id, false).await?;
        let embedder = self.bind_embedder(&mut dataset, &opts).await?;

        let mut file_metadata = opts
            .file_metadata
            .clone()
            .unwrap_or_else(|| FileMetadata::for_content(filename, content));
        if file_metadata.checksum.is_none() {
            file_metadata.checksum = Some(content_checksum(content));
        }

        let path_lock = self.path_lock(dataset_id, &file_metadata.absolute_path);
        let _guard = path_lock.lock().await;
        self.ingest_locked(&dataset, filename, content, &file_metadata, embedder, &opts)
            .await
    }

    /// Attach the configured embedding binding to an unbound dataset, then
    /// resolve the provider to embed with.
    async fn bind_embedder(
        &self,
        dataset: &mut Dataset,
        opts: &IngestOpts,
    ) -> Result<Arc<dyn EmbeddingProvider>, KnowledgeError> {
        if dataset.embeddings_provider_config.is_none() && self.embedder.dims() > 0 {
            let binding = self.embedder.config();
            tracing::debug!(dataset = %dataset.id, binding = %binding, "binding dataset to embedding model");
            dataset.embeddings_provider_config = Some(binding);
            self.index
                .update_dataset(dataset)
                .await
                .map_err(KnowledgeError::index)?;
        }
        self.embedder_for(dataset, opts.model_preference, opts.strict_embedding_config)
    }

    fn resolve_dedup(&self, opts: &IngestOpts) -> Result<Arc<dyn DuplicatePolicy>, KnowledgeError> {
        if let Some(name) = opts.is_duplicate_func_name.as_deref().filter(|n| !n.is_empty()) {
            return self
                .dedup
                .get(name)
                .ok_or_else(|| KnowledgeError::unknown("deduplication function", name));
        }
        if let Some(policy) = &opts.is_duplicate_func {
            return Ok(policy.clone());
        }
        self.dedup
            .get("")
            .ok_or_else(|| KnowledgeError::unknown("deduplication function", ""))
    }

    fn unsupported(
        &self,
        filetype: &str,
        file: &FileMetadata,
        opts: &IngestOpts,
    ) -> Result<IngestOutcome, KnowledgeError> {
        tracing::info!(
            filename = %file.name,
            absolute_path = %file.absolute_path,
            filetype,
            status = "skipped",
            reason = "unsupported",
            "unsupported file type"
        );
        if opts.err_on_unsupported_file {
            return Err(KnowledgeError::UnsupportedFileType {
                filetype: filetype.to_string(),
            });
        }
        Ok(IngestOutcome::Unsupported {
            filetype: filetype.to_string(),
        })
    }

    async fn ingest_locked(
        &self,
        dataset: &Dataset,
        filename: &str,
        content: &[u8],
        file_metadata: &FileMetadata,
        embedder: Arc<dyn EmbeddingProvider>,
        opts: &IngestOpts,
    ) -> Result<IngestOutcome, KnowledgeError> {
        let started = Instant::now();
        let dataset_id = dataset.id.as_str();
        let policy = self.resolve_dedup(opts)?;

        let filetype = match detect_filetype(filename, content) {
            Ok(ft) => ft,
            Err(KnowledgeError::UnsupportedFileType { filetype }) => {
                return self.unsupported(&filetype, file_metadata, opts);
            }
            Err(e) => return Err(e),
        };

        let duplicate = policy
            .is_duplicate(self.index.as_ref(), dataset_id, file_metadata)
            .await
            .map_err(|e| {
                tracing::error!(dataset = dataset_id, filename, status = "failed", error = %e, "failed to check for duplicates");
                KnowledgeError::index(e)
            })?;
        if duplicate {
            tracing::info!(
                dataset = dataset_id,
                filename,
                absolute_path = %file_metadata.absolute_path,
                status = "skipped",
                reason = "duplicate",
                policy = policy.name(),
                "ignoring duplicate document"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let mut flow = opts
            .ingestion_flows
            .iter()
            .find(|f| f.supports_filetype(filetype))
            .cloned()
            .unwrap_or_default();
        flow.fill_defaults(filetype, &self.splitter_opts)?;
        if !flow.can_load() {
            return self.unsupported(filetype.name(), file_metadata, opts);
        }

        let mut identity = Metadata::new();
        identity.insert(keys::FILENAME.into(), filename.into());
        identity.insert(
            keys::ABSOLUTE_PATH.into(),
            file_metadata.absolute_path.clone().into(),
        );
        identity.insert(keys::FILE_SIZE.into(), file_metadata.size.into());
        identity.insert(keys::EMBEDDING_MODEL.into(), embedder.model_name().into());
        flow.transformations
            .push(Arc::new(ExtraMetadata::mandatory(identity, &opts.extra_metadata)));

        let mut docs = match flow.run(content, filename, filetype).await {
            Ok(docs) => docs,
            Err(KnowledgeError::UnsupportedFileType { filetype }) => {
                return self.unsupported(&filetype, file_metadata, opts);
            }
            Err(e) => {
                tracing::error!(dataset = dataset_id, filename, filetype = %filetype, status = "failed", error = %e, "ingestion flow failed");
                return Err(e);
            }
        };

        if docs.is_empty() {
            tracing::info!(
                dataset = dataset_id,
                filename,
                filetype = %filetype,
                status = "skipped",
                num_documents = 0,
                "ingested document"
            );
            return Ok(IngestOutcome::Empty);
        }

        for (i, doc) in docs.iter_mut().enumerate() {
            doc.metadata.insert(keys::DOC_INDEX.into(), i.into());
        }

        self.vectorstore
            .create_collection(dataset_id, false)
            .await
            .map_err(KnowledgeError::vector_store)?;

        let mut stale = MetadataFilter::new();
        stale.insert(
            keys::ABSOLUTE_PATH.to_string(),
            file_metadata.absolute_path.clone(),
        );
        let removed = self
            .vectorstore
            .remove_documents(dataset_id, &stale)
            .await
            .map_err(|e| {
                tracing::error!(dataset = dataset_id, filename, component = "vectorstore", status = "failed", error = %e, "failed to remove existing documents");
                KnowledgeError::vector_store(e)
            })?;
        if removed > 0 {
            tracing::debug!(dataset = dataset_id, filename, num_documents = removed, "removed previous documents");
        }

        if opts.reuse_embeddings {
            let reused = self.reuse_embeddings(&mut docs, embedder.model_name(), opts).await;
            if reused > 0 {
                tracing::debug!(dataset = dataset_id, filename, reused, "reusing existing embeddings");
            }
        }

        let add_started = Instant::now();
        let document_ids = self
            .vectorstore
            .add_documents(dataset_id, &mut docs, embedder.as_ref())
            .await
            .map_err(|e| {
                tracing::error!(dataset = dataset_id, filename, component = "vectorstore", status = "failed", error = %e, "failed to add documents");
                KnowledgeError::vector_store(e)
            })?;
        tracing::debug!(
            dataset = dataset_id,
            filename,
            component = "vectorstore",
            num_documents = document_ids.len(),
            duration = ?add_started.elapsed(),
            "added documents"
        );
        if let Some(cache) = &opts.embedding_cache {
            cache.remember(embedder.model_name(), &docs);
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let file = File {
            id: file_id.clone(),
            dataset_id: dataset_id.to_string(),
            metadata: file_metadata.clone(),
            documents: document_ids
                .iter()
                .enumerate()
                .map(|(index, id)| IndexDocument {
                    id: id.clone(),
                    file_id: file_id.clone(),
                    dataset_id: dataset_id.to_string(),
                    index,
                })
                .collect(),
        };
        if let Err(e) = self.index.create_file(&file).await {
            tracing::error!(
                dataset = dataset_id,
                filename,
                absolute_path = %file_metadata.absolute_path,
                component = "index",
                status = "failed",
                document_ids = ?document_ids,
                error = %e,
                "documents are in the vector store but the file could not be indexed"
            );
            return Err(KnowledgeError::Inconsistent {
                dataset: dataset_id.to_string(),
                path: file_metadata.absolute_path.clone(),
                document_ids,
                source: e.into(),
            });
        }

        tracing::info!(
            dataset = dataset_id,
            filename,
            filetype = %filetype,
            absolute_path = %file_metadata.absolute_path,
            status = "finished",
            num_documents = document_ids.len(),
            duration = ?started.elapsed(),
            "ingested document"
        );
        Ok(IngestOutcome::Ingested(document_ids))
    }

    /// Fill in vectors for chunks whose content was already embedded with
    /// `model`, from the run cache first and then the vector store.
    async fn reuse_embeddings(&self, docs: &mut [Document], model: &str, opts: &IngestOpts) -> usize {
        let mut reused = opts
            .embedding_cache
            .as_ref()
            .map(|cache| cache.fill(model, docs))
            .unwrap_or(0);

        let mut filter = MetadataFilter::new();
        filter.insert(keys::EMBEDDING_MODEL.to_string(), model.to_string());
        for doc in docs.iter_mut().filter(|d| d.embedding.is_none()) {
            match self
                .vectorstore
                .get_documents(None, &filter, Some(&doc.content))
                .await
            {
                Ok(existing) => {
                    if let Some(embedding) = existing.into_iter().find_map(|d| d.embedding) {
                        doc.embedding = Some(embedding);
                        reused += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "failed to look up documents for embedding reuse");
                }
            }
        }
        reused
    }
}
