//! Embedding provider trait and vector utilities.
//!
//! Defines the async [`EmbeddingProvider`] trait that all embedding
//! backends implement, the batched worker pool used by vector stores to
//! fill in missing vectors ([`embed_missing`]), a scoped reuse cache
//! ([`EmbeddingCache`]), and pure helpers for vector serialization and
//! similarity.
//!
//! Concrete providers (OpenAI, Ollama, hashing, fastembed) live in the
//! `knowledge` app crate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::models::{content_checksum, Document, EmbeddingsProviderConfig};

/// Trait for embedding providers.
///
/// A provider is identified by its type and model; datasets are bound to
/// that pair on first ingestion and every later embedding call for the
/// dataset goes through a provider for the same model (see
/// [`with_model`](EmbeddingProvider::with_model)).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider family (e.g. `"openai"`).
    fn provider_type(&self) -> &str;
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// A provider of the same family configured for another model.
    fn with_model(&self, model: &str, dims: usize) -> Arc<dyn EmbeddingProvider>;

    fn config(&self) -> EmbeddingsProviderConfig {
        EmbeddingsProviderConfig {
            provider_type: self.provider_type().to_string(),
            model: self.model_name().to_string(),
            dims: self.dims(),
        }
    }
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Fill in the embedding of every document that has none.
///
/// Documents are grouped into batches of `batch_size`; at most
/// `concurrency` batches are in flight at once. Each batch result is
/// written into its own slot of a pre-sized buffer and the vectors are
/// assigned back to the documents afterwards, on the calling task.
///
/// Returns the number of documents embedded. The first failed batch fails
/// the whole call and leaves `docs` untouched.
pub async fn embed_missing(
    docs: &mut [Document],
    embedder: &dyn EmbeddingProvider,
    concurrency: usize,
    batch_size: usize,
) -> Result<usize> {
    let missing: Vec<usize> = docs
        .iter()
        .enumerate()
        .filter(|(_, d)| d.embedding.is_none())
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let batches: Vec<Vec<usize>> = missing
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();
    let jobs: Vec<(usize, Vec<String>)> = batches
        .iter()
        .enumerate()
        .map(|(slot, idxs)| (slot, idxs.iter().map(|&i| docs[i].content.clone()).collect()))
        .collect();

    let mut results: Vec<Option<Vec<Vec<f32>>>> = vec![None; batches.len()];
    let done: Vec<(usize, Vec<Vec<f32>>)> = stream::iter(jobs)
        .map(|(slot, texts)| async move {
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                bail!(
                    "embedding provider returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                );
            }
            Ok::<_, anyhow::Error>((slot, vectors))
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;
    for (slot, vectors) in done {
        results[slot] = Some(vectors);
    }

    for (idxs, vectors) in batches.iter().zip(results) {
        let vectors = vectors.ok_or_else(|| anyhow::anyhow!("missing embedding batch result"))?;
        for (&i, v) in idxs.iter().zip(vectors) {
            docs[i].embedding = Some(v);
        }
    }
    Ok(missing.len())
}

/// Reuse cache for embeddings, keyed by model and content hash.
///
/// Scoped to whoever owns it (typically one directory ingestion run), so
/// identical chunks across files are embedded once.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<(String, String), Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str, content: &str) -> Option<Vec<f32>> {
        let key = (model.to_string(), content_checksum(content.as_bytes()));
        self.entries.read().ok()?.get(&key).cloned()
    }

    pub fn insert(&self, model: &str, content: &str, embedding: Vec<f32>) {
        let key = (model.to_string(), content_checksum(content.as_bytes()));
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, embedding);
        }
    }

    /// Attach cached vectors to documents that have none. Returns the
    /// number of documents filled.
    pub fn fill(&self, model: &str, docs: &mut [Document]) -> usize {
        let mut filled = 0;
        for doc in docs.iter_mut().filter(|d| d.embedding.is_none()) {
            if let Some(v) = self.get(model, &doc.content) {
                doc.embedding = Some(v);
                filled += 1;
            }
        }
        filled
    }

    /// Remember every embedded document.
    pub fn remember(&self, model: &str, docs: &[Document]) {
        for doc in docs {
            if let Some(v) = &doc.embedding {
                self.insert(model, &doc.content, v.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use knowledge_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths. Similarity scores reported by the vector
/// stores are this value (one minus cosine distance).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic provider: vector = [len, vowels, 1.0]; counts calls.
    pub struct CountingEmbedder {
        pub model: String,
        pub calls: Arc<AtomicUsize>,
        pub texts: Arc<AtomicUsize>,
    }

    impl CountingEmbedder {
        pub fn new(model: &str) -> Self {
            Self {
                model: model.to_string(),
                calls: Arc::new(AtomicUsize::new(0)),
                texts: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn provider_type(&self) -> &str {
            "test"
        }
        fn model_name(&self) -> &str {
            &self.model
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.len() as f32, vowels as f32, 1.0]
                })
                .collect())
        }
        fn with_model(&self, model: &str, _dims: usize) -> Arc<dyn EmbeddingProvider> {
            Arc::new(CountingEmbedder {
                model: model.to_string(),
                calls: self.calls.clone(),
                texts: self.texts.clone(),
            })
        }
    }
}
