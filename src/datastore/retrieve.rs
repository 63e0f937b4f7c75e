use knowledge_core::error::KnowledgeError;
use knowledge_core::models::RetrievalResponse;
use knowledge_core::retrieval::{RetrievalFlow, RetrievalTarget, DEFAULT_TOP_K};

use super::{Datastore, ModelPreference};

#[derive(Clone)]
pub struct RetrieveOpts {
    pub top_k: usize,
    /// Flow to run; the default flow (basic retriever, no modifiers or
    /// postprocessors) when unset.
    pub flow: Option<RetrievalFlow>,
}

impl Default for RetrieveOpts {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            flow: None,
        }
    }
}

impl Datastore {
    /// Query `dataset_ids`, embedding the query with each dataset's bound
    /// model.
    pub async fn retrieve(
        &self,
        dataset_ids: &[String],
        query: &str,
        opts: RetrieveOpts,
    ) -> Result<RetrievalResponse, KnowledgeError> {
        if query.trim().is_empty() {
            return Err(KnowledgeError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }
        if dataset_ids.is_empty() {
            return Err(KnowledgeError::InvalidInput(
                "at least one dataset is required".to_string(),
            ));
        }
        if opts.top_k == 0 {
            return Err(KnowledgeError::InvalidInput(
                "top_k must be at least 1".to_string(),
            ));
        }

        let mut targets = Vec::with_capacity(dataset_ids.len());
        for id in dataset_ids {
            let dataset = self.require_dataset(id, false).await?;
            targets.push(RetrievalTarget {
                dataset_id: dataset.id.clone(),
                embedder: self.embedder_for(&dataset, ModelPreference::PreferDataset, false)?,
            });
        }

        let mut flow = opts.flow.unwrap_or_default();
        flow.fill_defaults();
        let response = flow
            .run(self.vectorstore.as_ref(), query, &targets, opts.top_k)
            .await?;

        tracing::debug!(
            datasets = ?dataset_ids,
            num_documents = response
                .responses
                .iter()
                .map(|r| r.result_documents.len())
                .sum::<usize>(),
            "retrieved"
        );
        Ok(response)
    }
}
