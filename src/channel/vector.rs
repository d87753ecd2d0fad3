//! Vector channel.
//!
//! [`VectorChannel`] embeds with the scope's recorded identity (see
//! [`IdentityBinder`]) and ranks stored vectors by cosine similarity.
//! Storage sits behind [`VectorIndex`]; every stored vector carries the
//! identity string of the model that produced it, and search only compares
//! against vectors of the query's model.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use super::{scope_prefix, sort_hits, IndexChannel, VECTOR};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, IdentityBinder};
use crate::error::HarnessError;
use crate::models::{split_source_key, Chunk, ChannelHit};

#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub source_key: String,
    pub model: String,
    pub vector: Vec<f32>,
    pub text: String,
}

/// Storage for embedded chunks.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn put(&self, entry: &VectorEntry) -> Result<()>;

    async fn replace_source(&self, source_key: &str, entries: &[VectorEntry]) -> Result<()>;

    async fn delete_source(&self, source_key: &str) -> Result<u64>;

    async fn search(
        &self,
        scope: &str,
        model: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ChannelHit>>;

    async fn count(&self, scope: &str) -> Result<usize>;
}

pub struct VectorChannel {
    index: Arc<dyn VectorIndex>,
    binder: Arc<IdentityBinder>,
}

impl VectorChannel {
    pub fn new(index: Arc<dyn VectorIndex>, binder: Arc<IdentityBinder>) -> Self {
        Self { index, binder }
    }
}

fn scope_of(source_key: &str) -> Result<&str> {
    split_source_key(source_key)
        .map(|(scope, _)| scope)
        .ok_or_else(|| anyhow::anyhow!("malformed source key: {}", source_key))
}

#[async_trait]
impl IndexChannel for VectorChannel {
    fn name(&self) -> &str {
        VECTOR
    }

    async fn upsert(&self, chunk_id: &str, text: &str, source_key: &str) -> Result<()> {
        let scope = scope_of(source_key)?;
        let embedder = self.binder.bind_for_ingest(scope).await?;
        let vector = embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        self.binder.record_dims(scope, vector.len()).await?;
        self.index
            .put(&VectorEntry {
                chunk_id: chunk_id.to_string(),
                source_key: source_key.to_string(),
                model: embedder.identity().to_string(),
                vector,
                text: text.to_string(),
            })
            .await
    }

    async fn replace_source(&self, source_key: &str, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return self.index.replace_source(source_key, &[]).await;
        }
        let scope = scope_of(source_key)?;
        let embedder = self.binder.bind_for_ingest(scope).await?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }
        if let Some(first) = vectors.first() {
            self.binder.record_dims(scope, first.len()).await?;
        }

        let model = embedder.identity().to_string();
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(c, vector)| VectorEntry {
                chunk_id: c.id.clone(),
                source_key: source_key.to_string(),
                model: model.clone(),
                vector,
                text: c.text.clone(),
            })
            .collect();
        self.index.replace_source(source_key, &entries).await
    }

    async fn delete_source(&self, source_key: &str) -> Result<u64> {
        self.index.delete_source(source_key).await
    }

    async fn query(&self, text: &str, scope: &str, limit: usize) -> Result<Vec<ChannelHit>> {
        let embedder = match self.binder.bind_for_query(scope).await? {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let query_vec = embedder
            .embed_query(text)
            .await
            .map_err(|e| HarnessError::channel_unavailable(VECTOR, e))?;
        self.index
            .search(scope, &embedder.identity().to_string(), &query_vec, limit)
            .await
    }

    async fn count(&self, scope: &str) -> Result<usize> {
        self.index.count(scope).await
    }
}

// ============ SQLite index ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const INSERT_VECTOR: &str = r#"
    INSERT INTO chunk_vectors (chunk_id, source_key, model, dims, embedding, snippet)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(chunk_id, source_key) DO UPDATE SET
        model = excluded.model,
        dims = excluded.dims,
        embedding = excluded.embedding,
        snippet = excluded.snippet
"#;

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn put(&self, entry: &VectorEntry) -> Result<()> {
        sqlx::query(INSERT_VECTOR)
            .bind(&entry.chunk_id)
            .bind(&entry.source_key)
            .bind(&entry.model)
            .bind(entry.vector.len() as i64)
            .bind(vec_to_blob(&entry.vector))
            .bind(&entry.text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_source(&self, source_key: &str, entries: &[VectorEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE source_key = ?")
            .bind(source_key)
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            sqlx::query(INSERT_VECTOR)
                .bind(&entry.chunk_id)
                .bind(&entry.source_key)
                .bind(&entry.model)
                .bind(entry.vector.len() as i64)
                .bind(vec_to_blob(&entry.vector))
                .bind(&entry.text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_source(&self, source_key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE source_key = ?")
            .bind(source_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn search(
        &self,
        scope: &str,
        model: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ChannelHit>> {
        let prefix = scope_prefix(scope);
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, source_key, embedding, snippet
            FROM chunk_vectors
            WHERE model = ? AND substr(source_key, 1, ?) = ?
            "#,
        )
        .bind(model)
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<ChannelHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ChannelHit {
                    chunk_id: row.get("chunk_id"),
                    source_key: row.get("source_key"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)) as f64,
                    text: row.get("snippet"),
                }
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, scope: &str) -> Result<usize> {
        let prefix = scope_prefix(scope);
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunk_vectors WHERE substr(source_key, 1, ?) = ?",
        )
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as usize)
    }
}

// ============ In-memory index ============

/// Brute-force cosine search over an in-memory list.
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: RwLock<Vec<VectorEntry>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn put(&self, entry: &VectorEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| !(e.chunk_id == entry.chunk_id && e.source_key == entry.source_key));
        entries.push(entry.clone());
        Ok(())
    }

    async fn replace_source(&self, source_key: &str, new_entries: &[VectorEntry]) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.source_key != source_key);
        entries.extend_from_slice(new_entries);
        Ok(())
    }

    async fn delete_source(&self, source_key: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.source_key != source_key);
        Ok((before - entries.len()) as u64)
    }

    async fn search(
        &self,
        scope: &str,
        model: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ChannelHit>> {
        let prefix = scope_prefix(scope);
        let entries = self.entries.read().await;
        let mut hits: Vec<ChannelHit> = entries
            .iter()
            .filter(|e| e.model == model && e.source_key.starts_with(&prefix))
            .map(|e| ChannelHit {
                chunk_id: e.chunk_id.clone(),
                source_key: e.source_key.clone(),
                score: cosine_similarity(query, &e.vector) as f64,
                text: e.text.clone(),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, scope: &str) -> Result<usize> {
        let prefix = scope_prefix(scope);
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.source_key.starts_with(&prefix))
            .count())
    }
}
