//! Core data models used throughout the harness.
//!
//! These types represent the source items, documents, chunks, and retrieval
//! candidates that flow through the ingestion and query pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where a piece of raw content came from, as reported by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Raw item produced by a document source before normalization.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Path relative to the scope root, `/`-separated.
    pub path: String,
    pub content: String,
    pub provenance: Provenance,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SourceItem {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            provenance: Provenance::default(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Persisted document record, unique on `(scope, path)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub scope: String,
    pub path: String,
    pub content_hash: String,
    pub body: String,
    pub active: bool,
    pub provenance: Provenance,
    pub metadata_json: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields written by an overwrite or reactivation.
#[derive(Debug, Clone)]
pub enum DocumentUpdate {
    /// Content changed (or forced): replace everything and mark active.
    Content {
        content_hash: String,
        body: String,
        provenance: Provenance,
        metadata_json: String,
    },
    /// Hash unchanged but the record was soft-deleted.
    Reactivate,
}

/// A contiguous text unit of a document; the retrievable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// `sha256(text) + ":" + seq`.
    pub id: String,
    /// `scope + ":" + path`.
    pub source_key: String,
    pub seq: i64,
    pub text: String,
}

/// Build the `"{scope}:{path}"` key shared by every chunk of a document.
pub fn source_key(scope: &str, path: &str) -> String {
    format!("{}:{}", scope, path)
}

/// Split a source key back into `(scope, path)`.
///
/// Scopes never contain `:`, so the first separator is the boundary.
pub fn split_source_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Which embedding backend and model produced a dataset's vectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingIdentity {
    pub backend: String,
    pub model: String,
}

impl EmbeddingIdentity {
    pub fn new(backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for EmbeddingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend, self.model)
    }
}

/// Per-scope record of the embedding identity bound at first ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub scope: String,
    pub identity: EmbeddingIdentity,
    pub dims: Option<usize>,
    pub created_at: i64,
}

/// Outcome of one persistence-mediator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertStatus {
    Created,
    Updated,
    Skipped,
    Failed,
}

/// One row of a channel's ranked answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHit {
    pub chunk_id: String,
    pub source_key: String,
    pub score: f64,
    /// Chunk text, as stored in the channel.
    pub text: String,
}

/// A fused (and possibly reranked) retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub chunk_id: String,
    pub source_key: String,
    pub text: String,
    /// Final ordering score.
    pub score: f64,
    /// Weighted RRF score before any rerank blending.
    pub fused_score: f64,
    /// Raw channel score keyed by channel name.
    pub channel_scores: BTreeMap<String, f64>,
    /// Every contribution that went into `score`, keyed by component name.
    pub components: BTreeMap<String, f64>,
}

impl Candidate {
    pub fn path(&self) -> &str {
        split_source_key(&self.source_key)
            .map(|(_, p)| p)
            .unwrap_or(&self.source_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_round_trip_keeps_colons_in_path() {
        let key = source_key("notes", "dir/a:b.md");
        assert_eq!(key, "notes:dir/a:b.md");
        assert_eq!(split_source_key(&key), Some(("notes", "dir/a:b.md")));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(
            EmbeddingIdentity::new("ollama", "nomic-embed-text").to_string(),
            "ollama/nomic-embed-text"
        );
    }
}
