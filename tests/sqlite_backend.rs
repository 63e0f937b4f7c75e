//! SQLite index and vector store against a scratch database.

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

use knowledge::datastore::{Datastore, FileRef, IngestOpts, RetrieveOpts};
use knowledge::db::connect_path;
use knowledge::embedding::HashingProvider;
use knowledge::migrate::run_migrations;
use knowledge::sqlite_index::SqliteIndex;
use knowledge::sqlite_store::SqliteVectorStore;
use knowledge_core::embedding::EmbeddingProvider;
use knowledge_core::models::{keys, Dataset, Document, File, FileMetadata, IndexDocument, Metadata};
use knowledge_core::store::{Index, MetadataFilter, VectorStore};

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("data").join("know.sqlite"))
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    (tmp, pool)
}

fn file(dataset: &str, id: &str, path: &str, docs: &[&str]) -> File {
    File {
        id: id.to_string(),
        dataset_id: dataset.to_string(),
        metadata: FileMetadata {
            name: path.rsplit('/').next().unwrap().to_string(),
            absolute_path: path.to_string(),
            size: 10,
            modified_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            checksum: Some(format!("sum-{id}")),
        },
        documents: docs
            .iter()
            .enumerate()
            .map(|(index, d)| IndexDocument {
                id: d.to_string(),
                file_id: id.to_string(),
                dataset_id: dataset.to_string(),
                index,
            })
            .collect(),
    }
}

fn doc(content: &str, path: &str) -> Document {
    let mut metadata = Metadata::new();
    metadata.insert(keys::ABSOLUTE_PATH.into(), path.into());
    Document::with_metadata(content, metadata)
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, pool) = setup().await;
    run_migrations(&pool).await.unwrap();
    let index = SqliteIndex::new(pool);
    assert!(index.list_datasets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_index_dataset_lifecycle() {
    let (_tmp, pool) = setup().await;
    let index = SqliteIndex::new(pool);

    let mut ds = Dataset::new("docs");
    ds.metadata.insert("owner".into(), "platform".into());
    index.create_dataset(&ds, true).await.unwrap();
    index.create_dataset(&ds, false).await.unwrap();
    assert!(index.create_dataset(&ds, true).await.is_err());

    ds.embeddings_provider_config = Some(HashingProvider::with_dims(8).config());
    index.update_dataset(&ds).await.unwrap();
    let loaded = index.get_dataset("docs", false).await.unwrap().unwrap();
    assert_eq!(loaded, ds);

    assert!(index.update_dataset(&Dataset::new("ghost")).await.is_err());

    index.delete_dataset("docs").await.unwrap();
    assert!(index.get_dataset("docs", false).await.unwrap().is_none());
}

#[tokio::test]
async fn test_index_files_replace_by_path() {
    let (_tmp, pool) = setup().await;
    let index = SqliteIndex::new(pool);
    index.create_dataset(&Dataset::new("ds"), true).await.unwrap();

    index
        .create_file(&file("ds", "f1", "/a/one.txt", &["d1", "d2"]))
        .await
        .unwrap();
    index
        .create_file(&file("ds", "f2", "/a/one.txt", &["d3"]))
        .await
        .unwrap();
    index
        .create_file(&file("ds", "f3", "/b/two.txt", &["d4"]))
        .await
        .unwrap();

    let files = index.find_files_by_path("ds", "/a/one.txt").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, "f2");
    assert_eq!(files[0].document_ids(), vec!["d3"]);
    assert!(index.get_document("d1").await.unwrap().is_none());

    let by_prefix = index.find_files_by_prefix("ds", "/a/").await.unwrap();
    assert_eq!(by_prefix.len(), 1);
    let by_sum = index.find_file_by_checksum("ds", "sum-f3").await.unwrap().unwrap();
    assert_eq!(by_sum.metadata.absolute_path, "/b/two.txt");

    let ds = index.get_dataset("ds", true).await.unwrap().unwrap();
    let paths: Vec<&str> = ds.files.iter().map(|f| f.metadata.absolute_path.as_str()).collect();
    assert_eq!(paths, vec!["/a/one.txt", "/b/two.txt"]);

    assert!(index
        .create_file(&file("missing", "f9", "/x", &[]))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_index_concurrent_file_writes() {
    let (_tmp, pool) = setup().await;
    let index = Arc::new(SqliteIndex::new(pool));
    index.create_dataset(&Dataset::new("ds"), true).await.unwrap();

    for round in 0..5 {
        let mut tasks = Vec::new();
        for i in 0..10 {
            let index = index.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("f{round}-{i}");
                let doc = format!("d{round}-{i}");
                index
                    .create_file(&file("ds", &id, &format!("/r{round}/{i}.txt"), &[doc.as_str()]))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    let ds = index.get_dataset("ds", true).await.unwrap().unwrap();
    assert_eq!(ds.files.len(), 50);
}

#[tokio::test]
async fn test_index_delete_cascades() {
    let (_tmp, pool) = setup().await;
    let index = SqliteIndex::new(pool);
    index.create_dataset(&Dataset::new("ds"), true).await.unwrap();
    index
        .create_file(&file("ds", "f1", "/a.txt", &["d1", "d2"]))
        .await
        .unwrap();

    index.delete_document("ds", "d1").await.unwrap();
    let f = index.get_file("ds", "f1").await.unwrap().unwrap();
    assert_eq!(f.document_ids(), vec!["d2"]);

    index.delete_file("ds", "f1").await.unwrap();
    assert!(index.get_document("d2").await.unwrap().is_none());

    index
        .create_file(&file("ds", "f2", "/b.txt", &["d5"]))
        .await
        .unwrap();
    index.delete_dataset("ds").await.unwrap();
    assert!(index.get_document("d5").await.unwrap().is_none());
}

#[tokio::test]
async fn test_vector_store_documents() {
    let (_tmp, pool) = setup().await;
    let store = SqliteVectorStore::new(pool);
    let embedder = HashingProvider::with_dims(32);

    store.create_collection("ds", true).await.unwrap();
    store.create_collection("ds", false).await.unwrap();
    assert!(store.create_collection("ds", true).await.is_err());

    let mut docs = vec![
        doc("rust borrow checker", "/a.txt"),
        doc("tomato soup recipe", "/b.txt"),
        doc("rust borrow checker", "/c.txt"),
    ];
    let ids = store.add_documents("ds", &mut docs, &embedder).await.unwrap();
    assert_eq!(ids.len(), 3);
    assert!(docs.iter().all(|d| d.embedding.as_ref().map(Vec::len) == Some(32)));

    let mut filter = MetadataFilter::new();
    filter.insert(keys::ABSOLUTE_PATH.into(), "/b.txt".into());
    let hits = store.get_documents(Some("ds"), &filter, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, ids[1]);

    let same = store
        .get_documents(None, &MetadataFilter::new(), Some("rust borrow checker"))
        .await
        .unwrap();
    assert_eq!(same.len(), 2);

    let query = embedder.embed_text("borrow checker");
    let ranked = store
        .similarity_search("ds", &query, 2, &MetadataFilter::new())
        .await
        .unwrap();
    assert_eq!(ranked.len(), 2);
    assert!(ranked.iter().all(|d| d.content.contains("rust")));

    assert!(store.remove_documents("ds", &MetadataFilter::new()).await.is_err());
    assert_eq!(store.remove_documents("ds", &filter).await.unwrap(), 1);
    store.remove_document("ds", &ids[0]).await.unwrap();
    let left = store
        .get_documents(Some("ds"), &MetadataFilter::new(), None)
        .await
        .unwrap();
    assert_eq!(left.len(), 1);

    store.remove_collection("ds").await.unwrap();
    assert!(store
        .similarity_search("ds", &query, 2, &MetadataFilter::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_vector_store_requires_collection() {
    let (_tmp, pool) = setup().await;
    let store = SqliteVectorStore::new(pool);
    let mut docs = vec![doc("x", "/x")];
    assert!(store
        .add_documents("nope", &mut docs, &HashingProvider::with_dims(4))
        .await
        .is_err());
}

async fn open_datastore(db_path: &Path) -> Datastore {
    let pool = connect_path(db_path).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingProvider::with_dims(64));
    Datastore::new(
        Arc::new(SqliteIndex::new(pool.clone())),
        Arc::new(SqliteVectorStore::new(pool)),
        embedder,
    )
}

#[tokio::test]
async fn test_datastore_persists_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("know.sqlite");

    let datastore = open_datastore(&db_path).await;
    datastore
        .create_dataset("kb", Metadata::new(), true)
        .await
        .unwrap();
    let content = b"# Deploy\n\nRun the release pipeline.\n\n# Rollback\n\nRevert the last tag.";
    let ids = datastore
        .ingest(
            "kb",
            "runbook.md",
            content,
            IngestOpts {
                file_metadata: Some(FileMetadata {
                    name: "runbook.md".into(),
                    absolute_path: "/ops/runbook.md".into(),
                    size: content.len() as i64,
                    modified_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                    checksum: None,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    drop(datastore);

    let datastore = open_datastore(&db_path).await;
    let dataset = datastore.get_dataset("kb", false).await.unwrap().unwrap();
    assert_eq!(
        dataset.embeddings_provider_config.map(|c| c.model),
        Some("hash-64".to_string())
    );
    let file = datastore
        .find_file("kb", &FileRef::Path("/ops/runbook.md".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file.document_ids(), ids);

    let response = datastore
        .retrieve(&["kb".to_string()], "revert the tag", RetrieveOpts::default())
        .await
        .unwrap();
    let top = &response.responses[0].result_documents[0];
    assert!(top.content.contains("Revert"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_datastore_concurrent_ingest() {
    let tmp = TempDir::new().unwrap();
    let datastore = Arc::new(open_datastore(&tmp.path().join("know.sqlite")).await);
    datastore
        .create_dataset("kb", Metadata::new(), true)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..30 {
        let datastore = datastore.clone();
        tasks.push(tokio::spawn(async move {
            let content = format!("note {i} about release train {i}");
            let path = format!("/notes/{i}.txt");
            datastore
                .ingest(
                    "kb",
                    &format!("{i}.txt"),
                    content.as_bytes(),
                    IngestOpts {
                        file_metadata: Some(FileMetadata {
                            name: format!("{i}.txt"),
                            absolute_path: path,
                            size: content.len() as i64,
                            modified_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                            checksum: None,
                        }),
                        ..Default::default()
                    },
                )
                .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 1);
    }

    let dataset = datastore.get_dataset("kb", true).await.unwrap().unwrap();
    assert_eq!(dataset.files.len(), 30);
    let file = datastore
        .find_file("kb", &FileRef::Path("/notes/7.txt".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file.documents.len(), 1);
}
