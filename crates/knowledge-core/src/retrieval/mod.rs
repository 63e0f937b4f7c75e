//! Retrieval flow: query modifiers → retriever → postprocessors.
//!
//! ```text
//! query ──► QueryModifier* ──► Retriever (per dataset) ──► Postprocessor* ──► RetrievalResponse
//! ```
//!
//! Every component is resolved by name from a registry and configured from
//! a JSON options blob decoded into its typed options struct.

pub mod postprocessors;
pub mod querymodifiers;
pub mod retrievers;

use std::sync::Arc;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::KnowledgeError;
use crate::models::{DatasetRetrievalResponse, Document, RetrievalResponse};
use crate::store::VectorStore;

pub use postprocessors::{get_postprocessor, SimilarityPostprocessor};
pub use querymodifiers::get_query_modifier;
pub use retrievers::{get_retriever, BasicRetriever};

pub const DEFAULT_TOP_K: usize = 10;

/// Rewrites the query before retrieval.
pub trait QueryModifier: Send + Sync {
    fn name(&self) -> &str;
    fn modify(&self, query: &str) -> Result<String, KnowledgeError>;
}

/// Fetches candidate documents for one dataset.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    async fn retrieve(
        &self,
        store: &dyn VectorStore,
        embedder: &dyn EmbeddingProvider,
        query: &str,
        dataset_id: &str,
        top_k: usize,
    ) -> Result<Vec<Document>, KnowledgeError>;
}

/// Filters or rewrites the per-dataset results.
pub trait Postprocessor: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, response: &mut RetrievalResponse) -> Result<(), KnowledgeError>;
}

/// A dataset to search and the embedder bound to it.
pub struct RetrievalTarget {
    pub dataset_id: String,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

#[derive(Clone, Default)]
pub struct RetrievalFlow {
    pub query_modifiers: Vec<Arc<dyn QueryModifier>>,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub postprocessors: Vec<Arc<dyn Postprocessor>>,
}

impl RetrievalFlow {
    pub fn fill_defaults(&mut self) {
        if self.retriever.is_none() {
            self.retriever = Some(Arc::new(BasicRetriever::default()));
        }
    }

    pub async fn run(
        &self,
        store: &dyn VectorStore,
        query: &str,
        targets: &[RetrievalTarget],
        top_k: usize,
    ) -> Result<RetrievalResponse, KnowledgeError> {
        let mut query = query.to_string();
        for modifier in &self.query_modifiers {
            query = modifier.modify(&query)?;
            tracing::debug!(modifier = modifier.name(), query = %query, "modified query");
        }

        let default_retriever: Arc<dyn Retriever> = Arc::new(BasicRetriever::default());
        let retriever = self.retriever.as_ref().unwrap_or(&default_retriever);

        let mut response = RetrievalResponse {
            query: query.clone(),
            responses: Vec::with_capacity(targets.len()),
        };
        for target in targets {
            let docs = retriever
                .retrieve(store, target.embedder.as_ref(), &query, &target.dataset_id, top_k)
                .await?;
            tracing::debug!(
                dataset = %target.dataset_id,
                retriever = retriever.name(),
                num_documents = docs.len(),
                "retrieved documents"
            );
            response.responses.push(DatasetRetrievalResponse {
                dataset_id: target.dataset_id.clone(),
                result_documents: docs,
            });
        }

        for pp in &self.postprocessors {
            pp.process(&mut response)?;
        }
        Ok(response)
    }
}
