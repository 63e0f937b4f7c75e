//! SQLite-backed [`Index`]: datasets → files → documents.
//!
//! Deleting a dataset cascades to its files, and deleting a file cascades
//! to its document records (`PRAGMA foreign_keys` is enabled in [`crate::db`]).

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use knowledge_core::models::{
    Dataset, EmbeddingsProviderConfig, File, FileMetadata, IndexDocument, Metadata,
};
use knowledge_core::store::Index;

use crate::db::begin_write;

const FILE_COLUMNS: &str = "id, dataset_id, name, absolute_path, size, modified_at, checksum";

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_documents(&self, file_id: &str) -> Result<Vec<IndexDocument>> {
        let rows = sqlx::query(
            "SELECT id, file_id, dataset_id, doc_index FROM documents WHERE file_id = ? ORDER BY doc_index",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_index_document).collect())
    }

    async fn files_with_documents(&self, rows: Vec<SqliteRow>) -> Result<Vec<File>> {
        let mut files = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut file = row_to_file(row);
            file.documents = self.load_documents(&file.id).await?;
            files.push(file);
        }
        Ok(files)
    }
}

fn row_to_index_document(row: &SqliteRow) -> IndexDocument {
    let index: i64 = row.get("doc_index");
    IndexDocument {
        id: row.get("id"),
        file_id: row.get("file_id"),
        dataset_id: row.get("dataset_id"),
        index: index.max(0) as usize,
    }
}

fn row_to_file(row: &SqliteRow) -> File {
    let modified_at: i64 = row.get("modified_at");
    File {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        metadata: FileMetadata {
            name: row.get("name"),
            absolute_path: row.get("absolute_path"),
            size: row.get("size"),
            modified_at: DateTime::<Utc>::from_timestamp(modified_at, 0).unwrap_or_default(),
            checksum: row.get("checksum"),
        },
        documents: Vec::new(),
    }
}

fn row_to_dataset(row: &SqliteRow) -> Result<Dataset> {
    let embeddings: Option<String> = row.get("embeddings_config");
    let embeddings_provider_config = match embeddings {
        Some(json) => Some(serde_json::from_str::<EmbeddingsProviderConfig>(&json)?),
        None => None,
    };
    let metadata_json: String = row.get("metadata_json");
    Ok(Dataset {
        id: row.get("id"),
        embeddings_provider_config,
        metadata: serde_json::from_str::<Metadata>(&metadata_json)?,
        files: Vec::new(),
    })
}

fn embeddings_json(dataset: &Dataset) -> Result<Option<String>> {
    Ok(match &dataset.embeddings_provider_config {
        Some(cfg) => Some(serde_json::to_string(cfg)?),
        None => None,
    })
}

#[async_trait]
impl Index for SqliteIndex {
    async fn create_dataset(&self, dataset: &Dataset, err_on_exists: bool) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO datasets (id, embeddings_config, metadata_json) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&dataset.id)
        .bind(embeddings_json(dataset)?)
        .bind(serde_json::to_string(&dataset.metadata)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 && err_on_exists {
            bail!("dataset {:?} already exists", dataset.id);
        }
        Ok(())
    }

    async fn get_dataset(&self, dataset_id: &str, include_files: bool) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT id, embeddings_config, metadata_json FROM datasets WHERE id = ?")
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut dataset = row_to_dataset(&row)?;
        if include_files {
            let rows = sqlx::query(&format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE dataset_id = ? ORDER BY absolute_path"
            ))
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await?;
            dataset.files = self.files_with_documents(rows).await?;
        }
        Ok(Some(dataset))
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT id, embeddings_config, metadata_json FROM datasets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_dataset).collect()
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        let result =
            sqlx::query("UPDATE datasets SET embeddings_config = ?, metadata_json = ? WHERE id = ?")
                .bind(embeddings_json(dataset)?)
                .bind(serde_json::to_string(&dataset.metadata)?)
                .bind(&dataset.id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("dataset {:?} not found", dataset.id);
        }
        Ok(())
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_file(&self, file: &File) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM datasets WHERE id = ?")
            .bind(&file.dataset_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            bail!("dataset {:?} not found", file.dataset_id);
        }

        sqlx::query("DELETE FROM files WHERE (dataset_id = ? AND absolute_path = ?) OR id = ?")
            .bind(&file.dataset_id)
            .bind(&file.metadata.absolute_path)
            .bind(&file.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "INSERT INTO files ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&file.id)
        .bind(&file.dataset_id)
        .bind(&file.metadata.name)
        .bind(&file.metadata.absolute_path)
        .bind(file.metadata.size)
        .bind(file.metadata.modified_at.timestamp())
        .bind(&file.metadata.checksum)
        .execute(&mut *tx)
        .await?;

        for doc in &file.documents {
            sqlx::query(
                "INSERT OR REPLACE INTO documents (id, file_id, dataset_id, doc_index) VALUES (?, ?, ?, ?)",
            )
            .bind(&doc.id)
            .bind(&file.id)
            .bind(&file.dataset_id)
            .bind(doc.index as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_file(&self, dataset_id: &str, file_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE dataset_id = ? AND id = ?")
            .bind(dataset_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_file(&self, dataset_id: &str, file_id: &str) -> Result<Option<File>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE dataset_id = ? AND id = ?"
        ))
        .bind(dataset_id)
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.files_with_documents(rows).await?.into_iter().next())
    }

    async fn find_files_by_path(&self, dataset_id: &str, absolute_path: &str) -> Result<Vec<File>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE dataset_id = ? AND absolute_path = ?"
        ))
        .bind(dataset_id)
        .bind(absolute_path)
        .fetch_all(&self.pool)
        .await?;
        self.files_with_documents(rows).await
    }

    async fn find_files_by_prefix(&self, dataset_id: &str, prefix: &str) -> Result<Vec<File>> {
        // substr counts characters for TEXT values, matching chars().count().
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE dataset_id = ? AND substr(absolute_path, 1, ?) = ? ORDER BY absolute_path"
        ))
        .bind(dataset_id)
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        self.files_with_documents(rows).await
    }

    async fn find_file_by_checksum(&self, dataset_id: &str, checksum: &str) -> Result<Option<File>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE dataset_id = ? AND checksum = ? LIMIT 1"
        ))
        .bind(dataset_id)
        .bind(checksum)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.files_with_documents(rows).await?.into_iter().next())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<IndexDocument>> {
        let row =
            sqlx::query("SELECT id, file_id, dataset_id, doc_index FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.as_ref().map(row_to_index_document))
    }

    async fn delete_document(&self, dataset_id: &str, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE dataset_id = ? AND id = ?")
            .bind(dataset_id)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
