use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Retriever;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{decode_options, KnowledgeError};
use crate::models::Document;
use crate::store::{MetadataFilter, VectorStore};

pub const BASIC: &str = "basic";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BasicRetrieverOpts {
    /// Overrides the caller's top-k when set.
    pub top_k: Option<usize>,
    /// Metadata equality filter applied in the vector store.
    #[serde(rename = "where")]
    pub filter: MetadataFilter,
}

/// Embeds the query with the dataset's embedder and runs a similarity
/// search on the dataset's collection.
#[derive(Debug, Clone, Default)]
pub struct BasicRetriever {
    pub top_k: Option<usize>,
    pub filter: MetadataFilter,
}

#[async_trait]
impl Retriever for BasicRetriever {
    fn name(&self) -> &str {
        BASIC
    }

    async fn retrieve(
        &self,
        store: &dyn VectorStore,
        embedder: &dyn EmbeddingProvider,
        query: &str,
        dataset_id: &str,
        top_k: usize,
    ) -> Result<Vec<Document>, KnowledgeError> {
        let k = self.top_k.unwrap_or(top_k);
        let query_embedding = embed_query(embedder, query)
            .await
            .map_err(KnowledgeError::embedding)?;
        store
            .similarity_search(dataset_id, &query_embedding, k, &self.filter)
            .await
            .map_err(KnowledgeError::vector_store)
    }
}

pub fn get_retriever(
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<Arc<dyn Retriever>, KnowledgeError> {
    match name {
        BASIC | "default" => {
            let opts: BasicRetrieverOpts = decode_options("retriever", name, options)?;
            Ok(Arc::new(BasicRetriever {
                top_k: opts.top_k,
                filter: opts.filter,
            }))
        }
        other => Err(KnowledgeError::unknown("retriever", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::CountingEmbedder;
    use crate::store::memory::InMemoryVectorStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_basic_retriever_applies_where_and_top_k() {
        let store = InMemoryVectorStore::new();
        let embedder = CountingEmbedder::new("m");
        store.create_collection("ds", false).await.unwrap();
        let mut docs: Vec<Document> = ["alpha", "beta", "gamma", "delta"]
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let meta = json!({"group": if i % 2 == 0 { "even" } else { "odd" }});
                Document::with_metadata(*c, meta.as_object().cloned().unwrap())
            })
            .collect();
        store.add_documents("ds", &mut docs, &embedder).await.unwrap();

        let retriever = get_retriever("basic", Some(&json!({"where": {"group": "even"}}))).unwrap();
        let hits = retriever
            .retrieve(&store, &embedder, "alpha", "ds", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|d| d.metadata["group"] == "even"));

        let retriever = get_retriever("basic", Some(&json!({"topK": 1}))).unwrap();
        let hits = retriever
            .retrieve(&store, &embedder, "alpha", "ds", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_is_vector_store_error() {
        let store = InMemoryVectorStore::new();
        let embedder = CountingEmbedder::new("m");
        let err = BasicRetriever::default()
            .retrieve(&store, &embedder, "q", "missing", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::VectorStore(_)));
    }
}
