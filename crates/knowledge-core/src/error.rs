//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Storage backends and embedding providers report failures as
//! [`anyhow::Error`]; the pipeline wraps them into the matching
//! [`KnowledgeError`] variant so callers can branch on the failure class
//! (skip an unsupported file, retry a vector store outage, repair an
//! inconsistent dataset).

use thiserror::Error;

/// Boxed source error carried by wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// No ingestion flow or loader can handle the detected filetype.
    #[error("unsupported file type: {filetype}")]
    UnsupportedFileType { filetype: String },

    /// A document loader failed to parse its input.
    #[error("failed to load document with {loader:?} loader: {source}")]
    Loader {
        loader: String,
        #[source]
        source: BoxError,
    },

    /// A format converter failed and the flow marked it as mandatory.
    #[error("failed to convert document with {converter:?} converter: {source}")]
    Converter {
        converter: String,
        #[source]
        source: BoxError,
    },

    /// A text splitter or transformer rejected its input.
    #[error("transformer {name:?} failed: {source}")]
    Transformer {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("dataset {0:?} not found")]
    DatasetNotFound(String),

    /// Raised only in strict mode, when the configured embedding provider
    /// differs from the one the dataset is bound to.
    #[error("embeddings provider mismatch for dataset {dataset:?}: dataset uses {attached}, configured provider is {configured}")]
    EmbeddingProviderMismatch {
        dataset: String,
        attached: String,
        configured: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown {kind} {name:?}")]
    UnknownComponent { kind: &'static str, name: String },

    #[error("embedding failed: {0}")]
    Embedding(#[source] BoxError),

    #[error("vector store error: {0}")]
    VectorStore(#[source] BoxError),

    #[error("index error: {0}")]
    Index(#[source] BoxError),

    /// The vector store accepted the documents but the index commit failed.
    /// The listed document ids exist in the vector store without a file
    /// record and need repair (re-ingest or delete by id).
    #[error("inconsistent state for {path:?} in dataset {dataset:?}: {} documents committed to the vector store but index commit failed: {source}", .document_ids.len())]
    Inconsistent {
        dataset: String,
        path: String,
        document_ids: Vec<String>,
        #[source]
        source: BoxError,
    },
}

impl KnowledgeError {
    pub fn vector_store(err: impl Into<anyhow::Error>) -> Self {
        KnowledgeError::VectorStore(boxed(err))
    }

    pub fn index(err: impl Into<anyhow::Error>) -> Self {
        KnowledgeError::Index(boxed(err))
    }

    pub fn embedding(err: impl Into<anyhow::Error>) -> Self {
        KnowledgeError::Embedding(boxed(err))
    }

    pub fn loader(loader: &str, err: impl Into<anyhow::Error>) -> Self {
        KnowledgeError::Loader {
            loader: loader.to_string(),
            source: boxed(err),
        }
    }

    pub fn converter(converter: &str, err: impl Into<anyhow::Error>) -> Self {
        KnowledgeError::Converter {
            converter: converter.to_string(),
            source: boxed(err),
        }
    }

    pub fn transformer(name: &str, err: impl Into<anyhow::Error>) -> Self {
        KnowledgeError::Transformer {
            name: name.to_string(),
            source: boxed(err),
        }
    }

    pub fn unknown(kind: &'static str, name: &str) -> Self {
        KnowledgeError::UnknownComponent {
            kind,
            name: name.to_string(),
        }
    }

    /// True for failures the caller may treat as "skip this file".
    pub fn is_unsupported(&self) -> bool {
        matches!(self, KnowledgeError::UnsupportedFileType { .. })
    }
}

fn boxed(err: impl Into<anyhow::Error>) -> BoxError {
    let err: anyhow::Error = err.into();
    err.into()
}

/// Decode a component options blob into its typed options struct.
///
/// A missing blob (`None` or JSON `null`) decodes to `T::default()`.
pub fn decode_options<T>(
    kind: &'static str,
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<T, KnowledgeError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match options {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            KnowledgeError::InvalidConfig(format!("invalid options for {} {:?}: {}", kind, name, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    #[serde(default, rename_all = "camelCase")]
    struct Opts {
        chunk_size: usize,
        name: String,
    }

    #[test]
    fn test_decode_options_missing_is_default() {
        let opts: Opts = decode_options("splitter", "text", None).unwrap();
        assert_eq!(opts, Opts::default());
        let opts: Opts =
            decode_options("splitter", "text", Some(&serde_json::Value::Null)).unwrap();
        assert_eq!(opts, Opts::default());
    }

    #[test]
    fn test_decode_options_typed() {
        let value = serde_json::json!({"chunkSize": 12, "name": "x"});
        let opts: Opts = decode_options("splitter", "text", Some(&value)).unwrap();
        assert_eq!(opts.chunk_size, 12);
        assert_eq!(opts.name, "x");
    }

    #[test]
    fn test_decode_options_bad_type() {
        let value = serde_json::json!({"chunkSize": "big"});
        let err = decode_options::<Opts>("splitter", "text", Some(&value)).unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidConfig(_)));
    }

    #[test]
    fn test_inconsistent_display_counts_documents() {
        let err = KnowledgeError::Inconsistent {
            dataset: "ds".into(),
            path: "/a.txt".into(),
            document_ids: vec!["a".into(), "b".into()],
            source: anyhow::anyhow!("disk full").into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 documents"));
        assert!(msg.contains("disk full"));
    }
}
