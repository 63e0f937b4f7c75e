//! Duplicate-detection policies consulted before a file is parsed.
//!
//! A policy only reads the index; it never writes. A positive answer makes
//! ingestion return without touching either store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::FileMetadata;
use crate::store::Index;

pub const UPSERT: &str = "upsert";
pub const FILE_METADATA: &str = "file_metadata";
pub const CONTENT_HASH: &str = "content_hash";

#[async_trait]
pub trait DuplicatePolicy: Send + Sync {
    fn name(&self) -> &str;

    async fn is_duplicate(&self, index: &dyn Index, dataset_id: &str, file: &FileMetadata)
        -> Result<bool>;
}

/// Never a duplicate: every ingest replaces the previous version.
#[derive(Debug, Default)]
pub struct Upsert;

#[async_trait]
impl DuplicatePolicy for Upsert {
    fn name(&self) -> &str {
        UPSERT
    }

    async fn is_duplicate(&self, _: &dyn Index, _: &str, _: &FileMetadata) -> Result<bool> {
        Ok(false)
    }
}

/// Duplicate when a file with the same path, size and modification time is
/// already indexed.
#[derive(Debug, Default)]
pub struct SameFileMetadata;

#[async_trait]
impl DuplicatePolicy for SameFileMetadata {
    fn name(&self) -> &str {
        FILE_METADATA
    }

    async fn is_duplicate(
        &self,
        index: &dyn Index,
        dataset_id: &str,
        file: &FileMetadata,
    ) -> Result<bool> {
        let existing = index
            .find_files_by_path(dataset_id, &file.absolute_path)
            .await?;
        Ok(existing.iter().any(|f| {
            f.metadata.size == file.size
                && f.metadata.modified_at.timestamp() == file.modified_at.timestamp()
        }))
    }
}

/// Duplicate when any indexed file in the dataset has the same checksum.
#[derive(Debug, Default)]
pub struct SameContentHash;

#[async_trait]
impl DuplicatePolicy for SameContentHash {
    fn name(&self) -> &str {
        CONTENT_HASH
    }

    async fn is_duplicate(
        &self,
        index: &dyn Index,
        dataset_id: &str,
        file: &FileMetadata,
    ) -> Result<bool> {
        let Some(checksum) = file.checksum.as_deref() else {
            return Ok(false);
        };
        Ok(index.find_file_by_checksum(dataset_id, checksum).await?.is_some())
    }
}

/// Name → policy lookup. Starts with the built-ins; callers can register
/// their own.
#[derive(Clone)]
pub struct DedupRegistry {
    policies: HashMap<String, Arc<dyn DuplicatePolicy>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            policies: HashMap::new(),
        };
        registry.register(UPSERT, Arc::new(Upsert));
        registry.register("none", Arc::new(Upsert));
        registry.register(FILE_METADATA, Arc::new(SameFileMetadata));
        registry.register(CONTENT_HASH, Arc::new(SameContentHash));
        registry
    }

    pub fn register(&mut self, name: &str, policy: Arc<dyn DuplicatePolicy>) {
        self.policies.insert(name.to_string(), policy);
    }

    /// Resolve a policy; an empty name selects the default ([`Upsert`]).
    pub fn get(&self, name: &str) -> Option<Arc<dyn DuplicatePolicy>> {
        let name = if name.is_empty() { UPSERT } else { name };
        self.policies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DedupRegistry {
    fn default() -> Self {
        Self::new()
    }
}
