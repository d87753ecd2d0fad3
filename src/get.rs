//! Document lookup by `(scope, path)`.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::models::{source_key, Provenance};
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub scope: String,
    pub path: String,
    pub content_hash: String,
    pub active: bool,
    pub provenance: Provenance,
    pub created_at: String,
    pub updated_at: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub id: String,
    pub seq: i64,
    pub text: String,
}

pub async fn get_document(store: &dyn DocumentStore, scope: &str, path: &str) -> Result<DocumentView> {
    let doc = match store.get_by_path(scope, path).await? {
        Some(d) => d,
        None => bail!("document not found: {}:{}", scope, path),
    };
    let chunks = store
        .chunks_for(&source_key(scope, path))
        .await?
        .into_iter()
        .map(|c| ChunkView {
            id: c.id,
            seq: c.seq,
            text: c.text,
        })
        .collect();

    Ok(DocumentView {
        id: doc.id,
        scope: doc.scope,
        path: doc.path,
        content_hash: doc.content_hash,
        active: doc.active,
        provenance: doc.provenance,
        created_at: format_ts_iso(doc.created_at),
        updated_at: format_ts_iso(doc.updated_at),
        body: doc.body,
        metadata: serde_json::from_str(&doc.metadata_json).unwrap_or(serde_json::json!({})),
        chunks,
    })
}

pub async fn run_get(config: &Config, scope: &str, path: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::new(pool.clone()));
    let result = get_document(store.as_ref(), scope, path).await;
    pool.close().await;
    let doc = result?;

    println!("--- Document ---");
    println!("id:            {}", doc.id);
    println!("scope:         {}", doc.scope);
    println!("path:          {}", doc.path);
    println!("active:        {}", doc.active);
    println!("content_hash:  {}", doc.content_hash);
    if let Some(ref etag) = doc.provenance.etag {
        println!("etag:          {}", etag);
    }
    if let Some(ref modified) = doc.provenance.last_modified {
        println!("last_modified: {}", modified);
    }
    println!("created_at:    {}", doc.created_at);
    println!("updated_at:    {}", doc.updated_at);
    println!("metadata:      {}", doc.metadata);
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {}] {}", chunk.seq, chunk.id);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
