//! # Knowledge
//!
//! Dataset ingestion and retrieval for retrieval-augmented generation.
//!
//! Files are detected, converted, loaded, split into chunks, transformed,
//! embedded and stored per dataset; queries run through a retrieval flow
//! against one or more datasets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────────────┐   ┌──────────────┐
//! │ ingest_paths │──▶│ Datastore::ingest          │──▶│ VectorStore  │
//! │ walk + pool  │   │ flow → dedupe → embed      │   │ Index        │
//! └──────────────┘   └────────────────────────────┘   └──────┬───────┘
//!                                                           │
//!                    ┌────────────────────────────┐          │
//!                    │ Datastore::retrieve        │◀─────────┘
//!                    │ modifiers → retriever → pp │
//!                    └────────────────────────────┘
//! ```
//!
//! Pipeline logic that does no I/O (models, errors, splitters,
//! transformers, store traits, retrieval flow) lives in `knowledge_core`.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`datastore`] | Ingest, retrieve and dataset/file operations |
//! | [`flows`] | Ingestion flows and the flow configuration file |
//! | [`documentloader`] | Bytes → documents per filetype |
//! | [`converter`] | Format conversion ahead of loading |
//! | [`extract`] | PDF and OOXML text extraction |
//! | [`embedding`] | Embedding providers |
//! | [`sqlite_store`] / [`sqlite_index`] | SQLite backends |
//! | [`ingest_paths`] | Directory ingestion worker pool |
//! | [`db`] / [`migrate`] | Database connection and schema |

pub mod config;
pub mod converter;
pub mod datastore;
pub mod db;
pub mod documentloader;
pub mod embedding;
pub mod extract;
pub mod flows;
pub mod ingest_paths;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod sqlite_index;
pub mod sqlite_store;
