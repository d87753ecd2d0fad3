//! Independent queryable indexes over chunks.
//!
//! Each [`IndexChannel`] answers `query(text, scope, limit)` with its own
//! ranking, and every write and read is scoped by the `"{scope}:"` prefix of
//! the chunk's source key. Entries are keyed by `(chunk_id, source_key)`, so
//! re-upserting the same unit replaces it rather than duplicating it.
//!
//! | Channel | Backends | Ranks by |
//! |---------|----------|----------|
//! | [`term`] | SQLite FTS5, in-memory BM25 | lexical match statistics |
//! | [`vector`] | SQLite BLOBs, in-memory | cosine similarity to the query embedding |

pub mod term;
pub mod vector;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChannelHit};

pub const TERM: &str = "term";
pub const VECTOR: &str = "vector";

#[async_trait]
pub trait IndexChannel: Send + Sync {
    /// Stable channel name used in fusion components and reports.
    fn name(&self) -> &str;

    /// Insert or replace one unit.
    async fn upsert(&self, chunk_id: &str, text: &str, source_key: &str) -> Result<()>;

    /// Atomically swap every unit under `source_key` for `chunks`.
    async fn replace_source(&self, source_key: &str, chunks: &[Chunk]) -> Result<()>;

    /// Remove every unit under `source_key`; returns the number removed.
    async fn delete_source(&self, source_key: &str) -> Result<u64>;

    /// Ranked hits within `scope`, best first.
    async fn query(&self, text: &str, scope: &str, limit: usize) -> Result<Vec<ChannelHit>>;

    /// Number of distinct units indexed within `scope`.
    async fn count(&self, scope: &str) -> Result<usize>;
}

/// `"{scope}:"`, the prefix every source key in a scope starts with.
pub(crate) fn scope_prefix(scope: &str) -> String {
    format!("{}:", scope)
}

/// Sort hits best first; ties break on chunk id, then source key.
pub(crate) fn sort_hits(hits: &mut [ChannelHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
            .then_with(|| a.source_key.cmp(&b.source_key))
    });
}
