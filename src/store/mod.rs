//! Persistent record store abstraction.
//!
//! The [`DocumentStore`] trait is the keyed `(scope, path)` record store the
//! persistence mediator writes through, plus the per-scope [`Dataset`]
//! registry that pins each scope's embedding identity. Two backends ship:
//!
//! - [`sqlite::SqliteStore`]: the production store over a `sqlx` pool.
//! - [`memory::InMemoryStore`]: `HashMap`-backed, for tests.
//!
//! Every method is a single transactional call. Implementations must be
//! `Send + Sync` so the ingest pipeline can drive them from concurrent tasks.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Dataset, Document, DocumentUpdate};

/// Abstract storage backend for documents, chunk records, and datasets.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ping`](DocumentStore::ping) | Reachability check before a batch |
/// | [`get_by_path`](DocumentStore::get_by_path) | Look up one document |
/// | [`create`](DocumentStore::create) | Insert a new document; conflicts on an existing key |
/// | [`update_fields`](DocumentStore::update_fields) | Overwrite or reactivate |
/// | [`soft_delete`](DocumentStore::soft_delete) | Clear the active flag |
/// | [`list_active_paths`](DocumentStore::list_active_paths) | Paths of active documents in a scope |
/// | [`replace_chunks`](DocumentStore::replace_chunks) | Swap the chunk records of one source key |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get_by_path(&self, scope: &str, path: &str) -> Result<Option<Document>>;

    /// Insert a document. Fails with
    /// [`PersistenceConflict`](crate::error::HarnessError::PersistenceConflict)
    /// when `(scope, path)` already exists.
    async fn create(&self, doc: &Document) -> Result<()>;

    async fn update_fields(&self, scope: &str, path: &str, update: &DocumentUpdate) -> Result<()>;

    /// Returns `true` if an active record was deactivated.
    async fn soft_delete(&self, scope: &str, path: &str) -> Result<bool>;

    /// Sorted ascending.
    async fn list_active_paths(&self, scope: &str) -> Result<Vec<String>>;

    async fn replace_chunks(&self, source_key: &str, chunks: &[Chunk]) -> Result<()>;

    async fn chunks_for(&self, source_key: &str) -> Result<Vec<Chunk>>;

    async fn get_dataset(&self, scope: &str) -> Result<Option<Dataset>>;

    /// Insert the dataset row if the scope has none; an existing row is kept.
    async fn record_dataset(&self, dataset: &Dataset) -> Result<()>;

    async fn set_dataset_dims(&self, scope: &str, dims: usize) -> Result<()>;
}
