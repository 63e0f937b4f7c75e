//! Configuration parsing and validation.
//!
//! Knowledge is configured through a TOML file (default:
//! `config/know.toml`). Every section except `[db]` is optional and falls
//! back to the defaults below.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/knowledge.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [textsplitter]
//! chunk_size = 2048
//! chunk_overlap = 256
//!
//! [ingest]
//! concurrency = 10
//! dedupe_func = "file_metadata"
//!
//! [retrieval]
//! top_k = 10
//!
//! [flows]
//! file = "./config/flows.toml"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use knowledge_core::textsplitter::{
    TextSplitterOpts, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_ENCODING_NAME,
    DEFAULT_MODEL_NAME,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub textsplitter: TextSplitterConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub flows: FlowsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Embedding batches in flight per `add_documents` call.
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_embed_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TextSplitterConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_encoding_name")]
    pub encoding_name: String,
}

impl Default for TextSplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            model_name: default_model_name(),
            encoding_name: default_encoding_name(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}
fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}
fn default_encoding_name() -> String {
    DEFAULT_ENCODING_NAME.to_string()
}

impl TextSplitterConfig {
    pub fn opts(&self) -> TextSplitterOpts {
        TextSplitterOpts {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            model_name: self.model_name.clone(),
            encoding_name: self.encoding_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_true")]
    pub reuse_embeddings: bool,
    #[serde(default)]
    pub dedupe_func: String,
    #[serde(default)]
    pub err_on_unsupported_file: bool,
    #[serde(default)]
    pub exit_on_failed_file: bool,
    #[serde(default)]
    pub ignore_extensions: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
    /// Re-bind datasets to the configured embedding model on mismatch
    /// instead of keeping the dataset's model.
    #[serde(default)]
    pub prefer_new_embedding_model: bool,
    /// Fail on an embedding provider mismatch.
    #[serde(default)]
    pub strict_embedding_config: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_ingest_concurrency(),
            reuse_embeddings: true,
            dedupe_func: String::new(),
            err_on_unsupported_file: false,
            exit_on_failed_file: false,
            ignore_extensions: Vec::new(),
            include_hidden: false,
            prefer_new_embedding_model: false,
            strict_embedding_config: false,
        }
    }
}

fn default_ingest_concurrency() -> usize {
    10
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    knowledge_core::retrieval::DEFAULT_TOP_K
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FlowsConfig {
    /// Flow configuration file (JSON or TOML) or `blueprint:<name>`.
    #[serde(default)]
    pub file: Option<String>,
    /// Flow to use when a dataset has no explicit mapping.
    #[serde(default)]
    pub flow: Option<String>,
}

impl Config {
    /// Config used when no file is available: a local database and the
    /// offline hashing embedder.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/knowledge.sqlite"),
            },
            embedding: EmbeddingConfig {
                provider: "hash".to_string(),
                model: Some("hash-256".to_string()),
                dims: Some(256),
                ..Default::default()
            },
            textsplitter: TextSplitterConfig::default(),
            ingest: IngestConfig::default(),
            retrieval: RetrievalConfig::default(),
            flows: FlowsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.textsplitter.chunk_size == 0 {
            anyhow::bail!("textsplitter.chunk_size must be > 0");
        }
        if self.textsplitter.chunk_overlap >= self.textsplitter.chunk_size {
            anyhow::bail!("textsplitter.chunk_overlap must be < textsplitter.chunk_size");
        }
        if self.ingest.concurrency == 0 {
            anyhow::bail!("ingest.concurrency must be >= 1");
        }
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            anyhow::bail!("embedding.batch_size and embedding.concurrency must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "hash" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or local.",
                other
            ),
        }

        if self.embedding.is_enabled() && self.embedding.provider != "local" {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() && self.embedding.provider != "hash" {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("[db]\npath = \"/tmp/k.sqlite\"\n").unwrap();
        assert_eq!(config.textsplitter.chunk_size, 2048);
        assert_eq!(config.textsplitter.chunk_overlap, 256);
        assert_eq!(config.textsplitter.model_name, "gpt-4o");
        assert_eq!(config.ingest.concurrency, 10);
        assert!(config.ingest.reuse_embeddings);
        assert_eq!(config.retrieval.top_k, 10);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_overlap_must_be_smaller() {
        let err = parse("[db]\npath = \"x\"\n[textsplitter]\nchunk_size = 10\nchunk_overlap = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_enabled_provider_needs_model_and_dims() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\nmodel = \"hash-64\"\ndims = 64\n"
        )
        .is_ok());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 64\n").is_ok());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"bogus\"\n").is_err());
    }

    #[test]
    fn test_minimal_is_valid() {
        Config::minimal().validate().unwrap();
    }
}
