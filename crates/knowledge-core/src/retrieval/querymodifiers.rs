use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::QueryModifier;
use crate::error::{decode_options, KnowledgeError};

pub const NORMALIZE: &str = "normalize";
pub const PREFIX: &str = "prefix";

/// Trims the query and collapses internal whitespace.
#[derive(Debug, Default)]
pub struct NormalizeQuery;

impl QueryModifier for NormalizeQuery {
    fn name(&self) -> &str {
        NORMALIZE
    }

    fn modify(&self, query: &str) -> Result<String, KnowledgeError> {
        Ok(query.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixQueryOpts {
    pub prefix: String,
}

/// Prepends a fixed instruction, as some embedding models expect
/// (e.g. `"query: "` for E5 models).
#[derive(Debug)]
pub struct PrefixQuery {
    prefix: String,
}

impl PrefixQuery {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl QueryModifier for PrefixQuery {
    fn name(&self) -> &str {
        PREFIX
    }

    fn modify(&self, query: &str) -> Result<String, KnowledgeError> {
        if query.starts_with(&self.prefix) {
            return Ok(query.to_string());
        }
        Ok(format!("{}{}", self.prefix, query))
    }
}

pub fn get_query_modifier(
    name: &str,
    options: Option<&serde_json::Value>,
) -> Result<Arc<dyn QueryModifier>, KnowledgeError> {
    match name {
        NORMALIZE => Ok(Arc::new(NormalizeQuery)),
        PREFIX => {
            let opts: PrefixQueryOpts = decode_options("query modifier", name, options)?;
            Ok(Arc::new(PrefixQuery::new(opts.prefix)))
        }
        other => Err(KnowledgeError::unknown("query modifier", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(NormalizeQuery.modify("  a \n b\tc ").unwrap(), "a b c");
    }

    #[test]
    fn test_prefix_is_idempotent() {
        let m = get_query_modifier("prefix", Some(&serde_json::json!({"prefix": "query: "}))).unwrap();
        let once = m.modify("rust").unwrap();
        assert_eq!(once, "query: rust");
        assert_eq!(m.modify(&once).unwrap(), once);
    }
}
