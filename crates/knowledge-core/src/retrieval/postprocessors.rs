use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Postprocessor;
use crate::error::{decode_options, KnowledgeError};
use crate::models::RetrievalResponse;
use crate::transformers::{get_transformer, Transformer};

pub const SIMILARITY: &str = "similarity";
pub const KEYWORDS: &str = "keywords";
pub const CONTENT_FILTER: &str = "content_filter";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimilarityOpts {
    pub threshold: f32,
    pub keep_min: usize,
}

/// Drops documents scoring below `threshold`, except that while fewer than
/// `keep_min` documents have been kept, below-threshold documents are kept
/// too. Works on the retriever's order (descending score) and never
/// reorders.
#[derive(Debug, Clone, Default)]
pub struct SimilarityPostprocessor {
    pub threshold: f32,
    pub keep_min: usize,
}

impl Postprocessor for SimilarityPostprocessor {
    fn name(&self) -> &str {
        SIMILARITY
    }

    fn process(&self, response: &mut RetrievalResponse) -> Result<(), KnowledgeError> {
        for resp in response.responses.iter_mut() {
            let before = resp.result_documents.len();
            let mut kept = 0usize;
            resp.result_documents.retain(|doc| {
                let score = doc.similarity_score.unwrap_or(0.0);
                if score >= self.threshold || kept < self.keep_min {
                    kept += 1;
                    true
                } else {
                    false
                }
            });
            tracing::debug!(
                dataset = %resp.dataset_id,
                before,
                after = kept,
                threshold = self.threshold,
                keep_min = self.keep_min,
                "filtered documents by similarity"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeywordsOpts {
    pub keywords: Vec<String>,
    /// Require every keyword instead of any.
    pub match_all: bool,
}

/// Keeps documents mentioning the keywords (case-insensitive).
#[derive(Debug, Clone)]
pub struct KeywordsPostprocessor {
    keywords: Vec<String>,
    match_all: bool,
}

impl KeywordsPostprocessor {
    pub fn new(keywords: Vec<String>, match_all: bool) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            match_all,
        }
    }
}

impl Postprocessor for KeywordsPostprocessor {
    fn name(&self) -> &str {
        KEYWORDS
    }

    fn process(&self, response: &mut RetrievalResponse) -> Result<(), KnowledgeError> {
        if self.keywords.is_empty() {
            return Ok(());
        }
        for resp in response.responses.iter_mut() {
            resp.result_documents.retain(|doc| {
                let content = doc.content.to_lowercase();
                if self.match_all {
                    self.keywords.iter().all(|k| content.contains(k))
                } else {
                    self.keywords.iter().any(|k| content.contains(k))
                }
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContentFilterOpts {
    pub contains: Vec<String>,
    pub not_contains: Vec<String>,
}

/// Case-sensitive substring include/exclude filter.
#[derive(Debug, Clone)]
pub struct ContentFilterPostprocessor {
    opts: ContentFilterOpts,
}

impl Postprocessor for ContentFilterPostprocessor {
    fn name(&self) -> &str {
        CONTENT_FILTER
    }

    fn process(&self, response: &mut RetrievalResponse) -> Result<(), KnowledgeError> {
        for resp in response.responses.iter_mut() {
            resp.result_documents.retain(|doc| {
                self.opts.contains.iter().all(|s| doc.content.contains(s.as_str()))
                    && !self
                        .opts
                        .not_contains
                        .iter()
                        .any(|s| doc.content.contains(s.as_str()))
            });
        }
        Ok(())
    }
}

/// Runs a document transformer over each dataset's results.
pub struct TransformerPostprocessor {
    transformer: Arc<dyn Transformer>,
}

impl TransformerPostprocessor {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        Self { transformer }
    }
}

impl Postprocessor for TransformerPostprocessor {
    fn name(&self) -> &str {
        self.transformer.name()
    }

    fn process(&self, response: &mut RetrievalResponse) -> Result<(), KnowledgeError> {
        for resp in response.responses.iter_mut() {
            let docs = std::mem::take(&mut resp.result_documents);
            resp.result_documents = self.transformer.transform(docs)?;
        }
        Ok(())
    }
}

/// Resolve a postprocessor by name. Names not matching a built-in
/// postprocessor are tried as transformers.
pub fn get_postprocessor(
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<Arc<dyn Postprocessor>, KnowledgeError> {
    match name {
        SIMILARITY => {
            let opts: SimilarityOpts = decode_options("postprocessor", name, options)?;
            Ok(Arc::new(SimilarityPostprocessor {
                threshold: opts.threshold,
                keep_min: opts.keep_min,
            }))
        }
        KEYWORDS => {
            let opts: KeywordsOpts = decode_options("postprocessor", name, options)?;
            Ok(Arc::new(KeywordsPostprocessor::new(opts.keywords, opts.match_all)))
        }
        CONTENT_FILTER => {
            let opts: ContentFilterOpts = decode_options("postprocessor", name, options)?;
            Ok(Arc::new(ContentFilterPostprocessor { opts }))
        }
        other => match get_transformer(other, options) {
            Ok(t) => Ok(Arc::new(TransformerPostprocessor::new(t))),
            Err(KnowledgeError::UnknownComponent { .. }) => {
                Err(KnowledgeError::unknown("postprocessor", other))
            }
            Err(e) => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetRetrievalResponse, Document};
    use serde_json::json;

    fn response(scores: &[f32]) -> RetrievalResponse {
        RetrievalResponse {
            query: "q".into(),
            responses: vec![DatasetRetrievalResponse {
                dataset_id: "ds".into(),
                result_documents: scores
                    .iter()
                    .map(|s| Document {
                        similarity_score: Some(*s),
                        ..Document::new(format!("doc {s}"))
                    })
                    .collect(),
            }],
        }
    }

    fn scores(resp: &RetrievalResponse) -> Vec<f32> {
        resp.responses[0]
            .result_documents
            .iter()
            .filter_map(|d| d.similarity_score)
            .collect()
    }

    #[test]
    fn test_similarity_keep_min_three() {
        let mut resp = response(&[0.9, 0.7, 0.5, 0.3, 0.1]);
        SimilarityPostprocessor {
            threshold: 0.6,
            keep_min: 3,
        }
        .process(&mut resp)
        .unwrap();
        assert_eq!(scores(&resp), vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn test_similarity_keep_min_one() {
        let mut resp = response(&[0.9, 0.7, 0.5, 0.3, 0.1]);
        SimilarityPostprocessor {
            threshold: 0.6,
            keep_min: 1,
        }
        .process(&mut resp)
        .unwrap();
        assert_eq!(scores(&resp), vec![0.9, 0.7]);
    }

    #[test]
    fn test_similarity_keeps_min_when_all_below() {
        let mut resp = response(&[0.4, 0.3, 0.2]);
        let pp = get_postprocessor("similarity", Some(&json!({"threshold": 0.8, "keepMin": 2}))).unwrap();
        pp.process(&mut resp).unwrap();
        assert_eq!(scores(&resp), vec![0.4, 0.3]);
    }

    #[test]
    fn test_similarity_never_reorders() {
        let mut resp = response(&[0.2, 0.9, 0.1, 0.8]);
        SimilarityPostprocessor {
            threshold: 0.5,
            keep_min: 0,
        }
        .process(&mut resp)
        .unwrap();
        assert_eq!(scores(&resp), vec![0.9, 0.8]);
    }

    #[test]
    fn test_keywords_any_and_all() {
        let mut resp = response(&[0.9, 0.8]);
        resp.responses[0].result_documents[0].content = "Rust async runtime".into();
        resp.responses[0].result_documents[1].content = "Go runtime".into();

        let mut any = resp.clone();
        get_postprocessor("keywords", Some(&json!({"keywords": ["RUNTIME"]})))
            .unwrap()
            .process(&mut any)
            .unwrap();
        assert_eq!(any.responses[0].result_documents.len(), 2);

        get_postprocessor("keywords", Some(&json!({"keywords": ["rust", "runtime"], "matchAll": true})))
            .unwrap()
            .process(&mut resp)
            .unwrap();
        assert_eq!(resp.responses[0].result_documents.len(), 1);
    }

    #[test]
    fn test_content_filter() {
        let mut resp = response(&[0.9, 0.8, 0.7]);
        resp.responses[0].result_documents[1].content = "DRAFT doc".into();
        get_postprocessor("content_filter", Some(&json!({"notContains": ["DRAFT"]})))
            .unwrap()
            .process(&mut resp)
            .unwrap();
        assert_eq!(scores(&resp), vec![0.9, 0.7]);
    }

    #[test]
    fn test_transformer_as_postprocessor() {
        let mut resp = response(&[0.9]);
        let pp = get_postprocessor("extra_metadata", Some(&json!({"metadata": {"source": "kb"}}))).unwrap();
        assert_eq!(pp.name(), "extra_metadata");
        pp.process(&mut resp).unwrap();
        assert_eq!(resp.responses[0].result_documents[0].metadata["source"], "kb");
        assert!(matches!(
            get_postprocessor("nope", None),
            Err(KnowledgeError::UnknownComponent { kind: "postprocessor", .. })
        ));
    }
}
