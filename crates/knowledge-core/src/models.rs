//! Core data models shared by the index, the vector store and the pipeline.
//!
//! - [`Dataset`]: named corpus bound to one embedding configuration.
//! - [`File`]: an ingested source file and the ids of its chunks.
//! - [`Document`]: a chunk as stored in the vector store.
//! - [`RetrievalResponse`]: per-dataset retrieval results for one query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Free-form JSON metadata attached to datasets and documents.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata keys written by the ingestion pipeline onto every chunk.
pub mod keys {
    pub const FILENAME: &str = "filename";
    pub const ABSOLUTE_PATH: &str = "absPath";
    pub const FILE_SIZE: &str = "fileSize";
    pub const EMBEDDING_MODEL: &str = "embeddingModel";
    pub const DOC_INDEX: &str = "docIndex";

    /// Keys that user-supplied metadata can never overwrite.
    pub const PROTECTED: &[&str] = &[FILENAME, ABSOLUTE_PATH];
}

/// The embedding configuration a dataset is permanently bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingsProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub model: String,
    #[serde(default)]
    pub dims: usize,
}

impl std::fmt::Display for EmbeddingsProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_type, self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings_provider_config: Option<EmbeddingsProviderConfig>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
}

impl Dataset {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            embeddings_provider_config: None,
            metadata: Metadata::new(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub absolute_path: String,
    pub size: i64,
    pub modified_at: DateTime<Utc>,
    /// Hex SHA-256 of the ingested bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl FileMetadata {
    /// Metadata for an in-memory payload with no filesystem backing.
    pub fn for_content(filename: &str, content: &[u8]) -> Self {
        Self {
            name: filename.to_string(),
            absolute_path: filename.to_string(),
            size: content.len() as i64,
            modified_at: Utc::now(),
            checksum: Some(content_checksum(content)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub dataset_id: String,
    pub metadata: FileMetadata,
    #[serde(default)]
    pub documents: Vec<IndexDocument>,
}

impl File {
    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }
}

/// Index-side record of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub file_id: String,
    pub dataset_id: String,
    pub index: usize,
}

/// A chunk as produced by the pipeline and stored in the vector store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            metadata,
            ..Default::default()
        }
    }

    /// Metadata value rendered as a string, for equality filters.
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(value_as_string)
    }

    pub fn content_hash(&self) -> String {
        content_checksum(self.content.as_bytes())
    }
}

/// Render a JSON value the way equality filters compare it: strings
/// without quotes, everything else in its JSON form.
pub fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Hex SHA-256 of a byte slice.
pub fn content_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRetrievalResponse {
    pub dataset_id: String,
    pub result_documents: Vec<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResponse {
    /// The query after all query modifiers ran.
    pub query: String,
    pub responses: Vec<DatasetRetrievalResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = content_checksum(b"hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_checksum(b"hello"));
        assert_ne!(a, content_checksum(b"hello!"));
    }

    #[test]
    fn test_metadata_str_renders_non_strings() {
        let mut meta = Metadata::new();
        meta.insert("name".into(), "a.txt".into());
        meta.insert("size".into(), 42.into());
        let doc = Document::with_metadata("x", meta);
        assert_eq!(doc.metadata_str("name").as_deref(), Some("a.txt"));
        assert_eq!(doc.metadata_str("size").as_deref(), Some("42"));
        assert_eq!(doc.metadata_str("missing"), None);
    }

    #[test]
    fn test_file_metadata_for_content() {
        let fm = FileMetadata::for_content("notes.md", b"# hi");
        assert_eq!(fm.absolute_path, "notes.md");
        assert_eq!(fm.size, 4);
        assert_eq!(fm.checksum, Some(content_checksum(b"# hi")));
    }

    #[test]
    fn test_embeddings_config_serializes_type_key() {
        let cfg = EmbeddingsProviderConfig {
            provider_type: "openai".into(),
            model: "text-embedding-3-small".into(),
            dims: 1536,
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["type"], "openai");
        assert_eq!(cfg.to_string(), "openai/text-embedding-3-small");
    }
}
