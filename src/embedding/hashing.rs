//! Feature-hashing embedder.
//!
//! Each lowercase alphanumeric token is hashed with SHA-256 into one of
//! `dims` buckets with a ±1 sign taken from the hash; the resulting
//! vector is L2-normalized. Texts sharing vocabulary score high under
//! cosine similarity. Deterministic and offline.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use knowledge_core::embedding::EmbeddingProvider;

use crate::config::EmbeddingConfig;

pub const DEFAULT_HASH_DIMS: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingProvider {
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let dims = config.dims.unwrap_or(DEFAULT_HASH_DIMS);
        if dims == 0 {
            bail!("embedding.dims must be > 0 for the hash provider");
        }
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| format!("hash-{}", dims));
        Ok(Self { model, dims })
    }

    pub fn with_dims(dims: usize) -> Self {
        Self {
            model: format!("hash-{}", dims),
            dims: dims.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(word);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn provider_type(&self) -> &str {
        "hash"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn with_model(&self, model: &str, dims: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(Self {
            model: model.to_string(),
            dims: dims.max(1),
        })
    }
}
