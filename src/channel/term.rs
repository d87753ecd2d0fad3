//! Term (lexical) channel.
//!
//! [`FtsTermChannel`] sits on the SQLite `chunks_fts` FTS5 table
//! (`porter unicode61` tokenizer) and ranks by BM25. Query text is reduced
//! to alphanumeric tokens, each quoted and OR-ed, so identifiers such as
//! `PROJ-1234` never reach the FTS5 query parser as operators.
//!
//! [`MemoryTermChannel`] implements the same contract with an Okapi BM25
//! scorer over in-memory token lists, for tests.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use super::{scope_prefix, sort_hits, IndexChannel, TERM};
use crate::models::{Chunk, ChannelHit};
use crate::normalize::word_tokens;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Build an FTS5 MATCH expression from free text; `None` if no tokens.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = word_tokens(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

pub struct FtsTermChannel {
    pool: SqlitePool,
}

impl FtsTermChannel {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexChannel for FtsTermChannel {
    fn name(&self) -> &str {
        TERM
    }

    async fn upsert(&self, chunk_id: &str, text: &str, source_key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ? AND source_key = ?")
            .bind(chunk_id)
            .bind(source_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, source_key, text) VALUES (?, ?, ?)")
            .bind(chunk_id)
            .bind(source_key)
            .bind(text)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_source(&self, source_key: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE source_key = ?")
            .bind(source_key)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            sqlx::query("INSERT INTO chunks_fts (chunk_id, source_key, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(source_key)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_source(&self, source_key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks_fts WHERE source_key = ?")
            .bind(source_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, text: &str, scope: &str, limit: usize) -> Result<Vec<ChannelHit>> {
        let expr = match fts_match_expression(text) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let prefix = scope_prefix(scope);

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, source_key, text, bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ? AND substr(source_key, 1, ?) = ?
            ORDER BY rank, chunk_id
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChannelHit {
                    chunk_id: row.get("chunk_id"),
                    source_key: row.get("source_key"),
                    // bm25() is lower-is-better
                    score: -rank,
                    text: row.get("text"),
                }
            })
            .collect())
    }

    async fn count(&self, scope: &str) -> Result<usize> {
        let prefix = scope_prefix(scope);
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM (SELECT DISTINCT chunk_id, source_key FROM chunks_fts WHERE substr(source_key, 1, ?) = ?)",
        )
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as usize)
    }
}

struct TermEntry {
    chunk_id: String,
    source_key: String,
    text: String,
    tokens: Vec<String>,
}

/// In-memory BM25 term channel.
#[derive(Default)]
pub struct MemoryTermChannel {
    entries: RwLock<Vec<TermEntry>>,
}

impl MemoryTermChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry(chunk_id: &str, text: &str, source_key: &str) -> TermEntry {
    TermEntry {
        chunk_id: chunk_id.to_string(),
        source_key: source_key.to_string(),
        text: text.to_string(),
        tokens: word_tokens(text),
    }
}

#[async_trait]
impl IndexChannel for MemoryTermChannel {
    fn name(&self) -> &str {
        TERM
    }

    async fn upsert(&self, chunk_id: &str, text: &str, source_key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| !(e.chunk_id == chunk_id && e.source_key == source_key));
        entries.push(entry(chunk_id, text, source_key));
        Ok(())
    }

    async fn replace_source(&self, source_key: &str, chunks: &[Chunk]) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.source_key != source_key);
        entries.extend(chunks.iter().map(|c| entry(&c.id, &c.text, source_key)));
        Ok(())
    }

    async fn delete_source(&self, source_key: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.source_key != source_key);
        Ok((before - entries.len()) as u64)
    }

    async fn query(&self, text: &str, scope: &str, limit: usize) -> Result<Vec<ChannelHit>> {
        let mut query_terms = word_tokens(text);
        query_terms.sort();
        query_terms.dedup();
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let prefix = scope_prefix(scope);
        let entries = self.entries.read().await;
        let scoped: Vec<&TermEntry> = entries
            .iter()
            .filter(|e| e.source_key.starts_with(&prefix))
            .collect();
        if scoped.is_empty() {
            return Ok(Vec::new());
        }

        let n = scoped.len() as f64;
        let avgdl = scoped.iter().map(|e| e.tokens.len()).sum::<usize>() as f64 / n;
        let mut df: HashMap<&str, usize> = HashMap::new();
        for e in &scoped {
            let unique: HashSet<&str> = e.tokens.iter().map(String::as_str).collect();
            for t in &query_terms {
                if unique.contains(t.as_str()) {
                    *df.entry(t.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut hits: Vec<ChannelHit> = scoped
            .iter()
            .filter_map(|e| {
                let dl = e.tokens.len() as f64;
                let mut score = 0.0;
                for t in &query_terms {
                    let tf = e.tokens.iter().filter(|tok| *tok == t).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let d = *df.get(t.as_str()).unwrap_or(&0) as f64;
                    let idf = ((n - d + 0.5) / (d + 0.5) + 1.0).ln();
                    let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl.max(1.0));
                    score += idf * tf * (BM25_K1 + 1.0) / (tf + norm);
                }
                (score > 0.0).then(|| ChannelHit {
                    chunk_id: e.chunk_id.clone(),
                    source_key: e.source_key.clone(),
                    score,
                    text: e.text.clone(),
                })
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, scope: &str) -> Result<usize> {
        let prefix = scope_prefix(scope);
        let entries = self.entries.read().await;
        let distinct: HashSet<(&str, &str)> = entries
            .iter()
            .filter(|e| e.source_key.starts_with(&prefix))
            .map(|e| (e.chunk_id.as_str(), e.source_key.as_str()))
            .collect();
        Ok(distinct.len())
    }
}
