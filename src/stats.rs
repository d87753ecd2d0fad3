//! Index statistics.
//!
//! `corpus stats` summarises what is indexed per scope: active and inactive
//! documents, chunk records, vectors, and the recorded embedding identity.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeStats {
    pub scope: String,
    pub active_docs: i64,
    pub inactive_docs: i64,
    pub chunks: i64,
    pub vectors: i64,
    pub embedding: Option<String>,
    pub dims: Option<i64>,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<Vec<ScopeStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            s.scope AS scope,
            (SELECT COUNT(*) FROM documents d WHERE d.scope = s.scope AND d.active = 1) AS active_docs,
            (SELECT COUNT(*) FROM documents d WHERE d.scope = s.scope AND d.active = 0) AS inactive_docs,
            (SELECT COUNT(*) FROM chunks c
                WHERE substr(c.source_key, 1, length(s.scope) + 1) = s.scope || ':') AS chunks,
            (SELECT COUNT(*) FROM chunk_vectors v
                WHERE substr(v.source_key, 1, length(s.scope) + 1) = s.scope || ':') AS vectors,
            ds.embedding_backend AS backend,
            ds.embedding_model AS model,
            ds.dims AS dims
        FROM (SELECT scope FROM documents UNION SELECT scope FROM datasets) s
        LEFT JOIN datasets ds ON ds.scope = s.scope
        ORDER BY s.scope
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let backend: Option<String> = row.get("backend");
            let model: Option<String> = row.get("model");
            ScopeStats {
                scope: row.get("scope"),
                active_docs: row.get("active_docs"),
                inactive_docs: row.get("inactive_docs"),
                chunks: row.get("chunks"),
                vectors: row.get("vectors"),
                embedding: backend.zip(model).map(|(b, m)| format!("{}/{}", b, m)),
                dims: row.get("dims"),
            }
        })
        .collect())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let scopes = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Corpus Harness: Index Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));

    if scopes.is_empty() {
        println!();
        println!("  (nothing indexed yet)");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  {:<16} {:>7} {:>9} {:>8} {:>8}   {}",
        "SCOPE", "ACTIVE", "INACTIVE", "CHUNKS", "VECTORS", "EMBEDDING"
    );
    println!("  {}", "-".repeat(76));
    for s in &scopes {
        let embedding = match (&s.embedding, s.dims) {
            (Some(id), Some(d)) => format!("{} ({}d)", id, d),
            (Some(id), None) => id.clone(),
            (None, _) => "none".to_string(),
        };
        println!(
            "  {:<16} {:>7} {:>9} {:>8} {:>8}   {}",
            s.scope, s.active_docs, s.inactive_docs, s.chunks, s.vectors, embedding
        );
    }
    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
