//! SQLite-backed [`VectorStore`] implementation.
//!
//! Each dataset is a row in `collections`; its chunks live in `embeddings`
//! with the vector stored as a little-endian f32 BLOB. Similarity search is
//! a brute-force cosine scan over the collection, computed in Rust.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;

use knowledge_core::embedding::{
    blob_to_vec, cosine_similarity, embed_missing, vec_to_blob, EmbeddingProvider,
};
use knowledge_core::models::{Document, Metadata};
use knowledge_core::store::{matches_filter, rank_by_similarity, MetadataFilter, VectorStore};

use crate::db::begin_write;

pub struct SqliteVectorStore {
    pool: SqlitePool,
    /// Serializes first-time collection creation.
    create_lock: Mutex<()>,
    concurrency: usize,
    batch_size: usize,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            create_lock: Mutex::new(()),
            concurrency: 4,
            batch_size: 64,
        }
    }

    pub fn with_embedding_limits(mut self, concurrency: usize, batch_size: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.batch_size = batch_size.max(1);
        self
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    let blob: Vec<u8> = row.get("embedding");
    Ok(Document {
        id: row.get("id"),
        content: row.get("content"),
        metadata,
        embedding: Some(blob_to_vec(&blob)),
        similarity_score: None,
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn create_collection(&self, collection: &str, err_on_exists: bool) -> Result<()> {
        let _guard = self.create_lock.lock().await;
        if self.collection_exists(collection).await? {
            if err_on_exists {
                bail!("collection {:?} already exists", collection);
            }
            return Ok(());
        }
        sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(collection)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_collection(&self, collection: &str) -> Result<()> {
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        docs: &mut [Document],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<String>> {
        if !self.collection_exists(collection).await? {
            bail!("collection {:?} not found", collection);
        }
        for doc in docs.iter_mut().filter(|d| d.id.is_empty()) {
            doc.id = uuid::Uuid::new_v4().to_string();
        }
        embed_missing(docs, embedder, self.concurrency, self.batch_size).await?;

        let mut tx = begin_write(&self.pool).await?;
        for doc in docs.iter() {
            let vector = doc
                .embedding
                .as_ref()
                .ok_or_else(|| anyhow!("document {} has no embedding", doc.id))?;
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, collection, content, content_hash, metadata_json, embedding, dims)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding,
                    dims = excluded.dims
                "#,
            )
            .bind(&doc.id)
            .bind(collection)
            .bind(&doc.content)
            .bind(doc.content_hash())
            .bind(serde_json::to_string(&doc.metadata)?)
            .bind(vec_to_blob(vector))
            .bind(vector.len() as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(docs.iter().map(|d| d.id.clone()).collect())
    }

    async fn remove_document(&self, collection: &str, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM embeddings WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_documents(&self, collection: &str, filter: &MetadataFilter) -> Result<usize> {
        if filter.is_empty() {
            bail!("refusing to remove documents with an empty filter");
        }
        let rows = sqlx::query("SELECT id, metadata_json FROM embeddings WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut ids = Vec::new();
        for row in rows {
            let metadata: Metadata = serde_json::from_str(row.get("metadata_json"))?;
            if matches_filter(&metadata, filter) {
                ids.push(row.get::<String, _>("id"));
            }
        }

        let mut tx = begin_write(&self.pool).await?;
        for id in &ids {
            sqlx::query("DELETE FROM embeddings WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(ids.len())
    }

    async fn get_documents(
        &self,
        collection: Option<&str>,
        filter: &MetadataFilter,
        content: Option<&str>,
    ) -> Result<Vec<Document>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, content, metadata_json, embedding FROM embeddings WHERE 1 = 1",
        );
        if let Some(c) = collection {
            qb.push(" AND collection = ").push_bind(c);
        }
        if let Some(text) = content {
            let hash = knowledge_core::models::content_checksum(text.as_bytes());
            qb.push(" AND content_hash = ").push_bind(hash);
            qb.push(" AND content = ").push_bind(text);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut docs = Vec::new();
        for row in &rows {
            let doc = row_to_document(row)?;
            if matches_filter(&doc.metadata, filter) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query_embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Document>> {
        if !self.collection_exists(collection).await? {
            bail!("collection {:?} not found", collection);
        }
        let rows = sqlx::query(
            "SELECT id, content, metadata_json, embedding FROM embeddings WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut doc = row_to_document(row)?;
            if !matches_filter(&doc.metadata, filter) {
                continue;
            }
            let score = doc
                .embedding
                .as_deref()
                .map(|v| cosine_similarity(query_embedding, v))
                .unwrap_or(0.0);
            doc.similarity_score = Some(score);
            hits.push(doc);
        }
        rank_by_similarity(&mut hits, k);
        Ok(hits)
    }
}
