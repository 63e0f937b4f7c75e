//! # Knowledge Core
//!
//! Shared pipeline logic for Knowledge: data models, the error taxonomy,
//! filetype detection, text splitting, document transformers, embedding
//! capability, store abstractions, deduplication policies and the
//! retrieval flow.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! runtime-specific dependencies. Concrete backends (SQLite, HTTP
//! embedding providers, document loaders) live in the `knowledge` app
//! crate and plug in through the traits defined here.

pub mod dedup;
pub mod embedding;
pub mod error;
pub mod filetype;
pub mod models;
pub mod retrieval;
pub mod store;
pub mod textsplitter;
pub mod transformers;
