//! JSON snapshots of datasets with their files, documents and vectors.
//!
//! Documents are exported with their embeddings, so importing a snapshot
//! never calls the embedding provider unless a document lacks a vector.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use knowledge_core::error::KnowledgeError;
use knowledge_core::models::{keys, Dataset, Document, File, FileMetadata, IndexDocument};
use knowledge_core::store::MetadataFilter;

use super::Datastore;

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub datasets: Vec<ExportedDataset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedDataset {
    pub dataset: Dataset,
    pub files: Vec<ExportedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedFile {
    pub id: String,
    pub metadata: FileMetadata,
    /// Documents in chunk order.
    pub documents: Vec<Document>,
}

fn doc_index(doc: &Document) -> u64 {
    doc.metadata
        .get(keys::DOC_INDEX)
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::MAX)
}

impl Datastore {
    /// Snapshot `dataset_ids`, or every dataset when the list is empty.
    pub async fn export_datasets(&self, dataset_ids: &[String]) -> Result<ExportFile, KnowledgeError> {
        let datasets = if dataset_ids.is_empty() {
            self.list_datasets().await?
        } else {
            let mut out = Vec::with_capacity(dataset_ids.len());
            for id in dataset_ids {
                out.push(self.require_dataset(id, false).await?);
            }
            out
        };

        let mut exported = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            let with_files = self.require_dataset(&dataset.id, true).await?;
            let mut files = Vec::with_capacity(with_files.files.len());
            for file in &with_files.files {
                files.push(self.export_file(file).await?);
            }
            exported.push(ExportedDataset {
                dataset: Dataset {
                    files: Vec::new(),
                    ..with_files
                },
                files,
            });
        }

        Ok(ExportFile {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            datasets: exported,
        })
    }

    async fn export_file(&self, file: &File) -> Result<ExportedFile, KnowledgeError> {
        let mut filter = MetadataFilter::new();
        filter.insert(
            keys::ABSOLUTE_PATH.to_string(),
            file.metadata.absolute_path.clone(),
        );
        let ids = file.document_ids();
        let mut documents: Vec<Document> = self
            .vectorstore
            .get_documents(Some(&file.dataset_id), &filter, None)
            .await
            .map_err(KnowledgeError::vector_store)?
            .into_iter()
            .filter(|d| ids.contains(&d.id))
            .collect();
        documents.sort_by_key(doc_index);
        if documents.len() != ids.len() {
            tracing::warn!(
                dataset = %file.dataset_id,
                absolute_path = %file.metadata.absolute_path,
                indexed = ids.len(),
                found = documents.len(),
                "file has documents missing from the vector store"
            );
        }
        Ok(ExportedFile {
            id: file.id.clone(),
            metadata: file.metadata.clone(),
            documents,
        })
    }

    /// Recreate the datasets of a snapshot. Existing datasets are not
    /// overwritten: importing one fails with `InvalidInput`.
    pub async fn import_datasets(&self, export: ExportFile) -> Result<Vec<String>, KnowledgeError> {
        if export.version != EXPORT_VERSION {
            return Err(KnowledgeError::InvalidInput(format!(
                "unsupported export version {} (expected {})",
                export.version, EXPORT_VERSION
            )));
        }
        for entry in &export.datasets {
            if self.get_dataset(&entry.dataset.id, false).await?.is_some() {
                return Err(KnowledgeError::InvalidInput(format!(
                    "dataset {:?} already exists",
                    entry.dataset.id
                )));
            }
        }

        let mut imported = Vec::with_capacity(export.datasets.len());
        for entry in export.datasets {
            let dataset = entry.dataset;
            self.index
                .create_dataset(&dataset, true)
                .await
                .map_err(KnowledgeError::index)?;
            self.vectorstore
                .create_collection(&dataset.id, false)
                .await
                .map_err(KnowledgeError::vector_store)?;
            let embedder = self.embedder_for(&dataset, Default::default(), false)?;

            for file in entry.files {
                let mut documents = file.documents;
                let ids = self
                    .vectorstore
                    .add_documents(&dataset.id, &mut documents, embedder.as_ref())
                    .await
                    .map_err(KnowledgeError::vector_store)?;
                let record = File {
                    id: file.id.clone(),
                    dataset_id: dataset.id.clone(),
                    metadata: file.metadata,
                    documents: ids
                        .iter()
                        .enumerate()
                        .map(|(index, id)| IndexDocument {
                            id: id.clone(),
                            file_id: file.id.clone(),
                            dataset_id: dataset.id.clone(),
                            index,
                        })
                        .collect(),
                };
                if let Err(e) = self.index.create_file(&record).await {
                    return Err(KnowledgeError::Inconsistent {
                        dataset: dataset.id.clone(),
                        path: record.metadata.absolute_path.clone(),
                        document_ids: ids,
                        source: e.into(),
                    });
                }
            }
            tracing::info!(dataset = %dataset.id, "imported dataset");
            imported.push(dataset.id);
        }
        Ok(imported)
    }

    /// Write a snapshot to `output`, or to stdout when `None`.
    pub async fn export_datasets_to_file(
        &self,
        output: Option<&Path>,
        dataset_ids: &[String],
    ) -> Result<()> {
        let export = self.export_datasets(dataset_ids).await?;
        let json = serde_json::to_string_pretty(&export)?;

        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(path, &json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                eprintln!(
                    "Exported {} datasets to {}",
                    export.datasets.len(),
                    path.display()
                );
            }
            None => println!("{}", json),
        }
        Ok(())
    }

    pub async fn import_datasets_from_file(&self, path: &Path) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read export file: {}", path.display()))?;
        let export: ExportFile =
            serde_json::from_str(&content).with_context(|| "Failed to parse export file")?;
        Ok(self.import_datasets(export).await?)
    }
}
