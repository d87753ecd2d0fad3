//! Document persistence mediator.
//!
//! [`upsert`] is the single write path for one source item:
//!
//! 1. normalize the raw content and hash it (an empty result is a
//!    [`Validation`](HarnessError::Validation) failure);
//! 2. look the record up by `(scope, path)`;
//! 3. decide:
//!
//! | Existing record | Hash | `force` | Status | Re-split + re-index |
//! |-----------------|------|---------|--------|---------------------|
//! | none | - | - | `created` | yes |
//! | active | same | no | `skipped` | no |
//! | inactive | same | no | `updated` (reactivated) | no, channels restored from stored chunks |
//! | any | changed | - | `updated` | yes |
//! | any | - | yes | `updated` | yes |
//!
//! The document row is written after the chunk store and every channel hold
//! the new chunks, so a failed index write leaves the old hash in place and
//! the next run retries the item instead of skipping it.
//!
//! Calls for the same `(scope, path)` are serialized through [`KeyLocks`];
//! calls for different keys run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::chunk::chunk_document;
use crate::error::HarnessError;
use crate::ingest::PipelineContext;
use crate::models::{source_key, Chunk, Document, DocumentUpdate, SourceItem, UpsertStatus};
use crate::normalize::{content_hash, normalize};

/// Per-key async locks. An entry lives only while some caller holds or
/// waits on it.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Hand back a lock from [`lock_for`](Self::lock_for); the entry is
    /// dropped once no other caller references it.
    pub async fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// What one mediator call did.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    pub status: UpsertStatus,
    /// Chunks written to the channels (0 when nothing was re-indexed).
    pub chunks: usize,
}

/// Upsert one item into `ctx.scope`.
pub async fn upsert(ctx: &PipelineContext, item: &SourceItem, force: bool) -> Result<PersistOutcome> {
    if item.path.trim().is_empty() {
        return Err(HarnessError::validation(&item.path, "empty path").into());
    }
    let body = normalize(&item.content, &ctx.normalize);
    if body.is_empty() {
        return Err(HarnessError::validation(&item.path, "no content after normalization").into());
    }
    let hash = content_hash(&body);
    let key = source_key(&ctx.scope, &item.path);

    let lock = ctx.locks.lock_for(&key).await;
    let outcome = {
        let _guard = lock.lock().await;
        upsert_locked(ctx, item, &key, hash, body, force).await
    };
    ctx.locks.release(&key, lock).await;
    outcome
}

async fn upsert_locked(
    ctx: &PipelineContext,
    item: &SourceItem,
    key: &str,
    hash: String,
    body: String,
    force: bool,
) -> Result<PersistOutcome> {
    let existing = ctx.store.get_by_path(&ctx.scope, &item.path).await?;

    if let Some(doc) = &existing {
        if doc.content_hash == hash && !force {
            if doc.active {
                debug!(path = %item.path, "unchanged");
                return Ok(PersistOutcome {
                    status: UpsertStatus::Skipped,
                    chunks: 0,
                });
            }
            let stored = ctx.store.chunks_for(key).await?;
            index_chunks(ctx, key, &stored).await?;
            ctx.store
                .update_fields(&ctx.scope, &item.path, &DocumentUpdate::Reactivate)
                .await?;
            debug!(path = %item.path, "reactivated");
            return Ok(PersistOutcome {
                status: UpsertStatus::Updated,
                chunks: 0,
            });
        }
    }

    let chunks = chunk_document(ctx.splitter.as_ref(), &ctx.scope, &item.path, &body);
    ctx.store.replace_chunks(key, &chunks).await?;
    index_chunks(ctx, key, &chunks).await?;

    let metadata_json = serde_json::to_string(&item.metadata)?;
    let status = match existing {
        None => {
            let now = chrono::Utc::now().timestamp();
            ctx.store
                .create(&Document {
                    id: Uuid::new_v4().to_string(),
                    scope: ctx.scope.clone(),
                    path: item.path.clone(),
                    content_hash: hash,
                    body,
                    active: true,
                    provenance: item.provenance.clone(),
                    metadata_json,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            UpsertStatus::Created
        }
        Some(_) => {
            ctx.store
                .update_fields(
                    &ctx.scope,
                    &item.path,
                    &DocumentUpdate::Content {
                        content_hash: hash,
                        body,
                        provenance: item.provenance.clone(),
                        metadata_json,
                    },
                )
                .await?;
            UpsertStatus::Updated
        }
    };
    debug!(path = %item.path, ?status, chunks = chunks.len(), "persisted");

    Ok(PersistOutcome {
        status,
        chunks: chunks.len(),
    })
}

async fn index_chunks(ctx: &PipelineContext, key: &str, chunks: &[Chunk]) -> Result<()> {
    for channel in &ctx.channels {
        channel.replace_source(key, chunks).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::term::MemoryTermChannel;
    use crate::channel::IndexChannel;
    use crate::store::memory::InMemoryStore;
    use crate::store::DocumentStore;

    fn ctx() -> (PipelineContext, Arc<dyn DocumentStore>, Arc<dyn IndexChannel>) {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
        let term: Arc<dyn IndexChannel> = Arc::new(MemoryTermChannel::new());
        let ctx = PipelineContext::builder(store.clone(), "notes")
            .channel(term.clone())
            .build();
        (ctx, store, term)
    }

    #[tokio::test]
    async fn test_create_then_skip_then_update() {
        let (ctx, store, term) = ctx();
        let item = SourceItem::new("a.md", "hello world\r\n");

        let first = upsert(&ctx, &item, false).await.unwrap();
        assert_eq!(first.status, UpsertStatus::Created);
        assert_eq!(first.chunks, 1);

        // CRLF vs LF normalizes to the same hash.
        let same = SourceItem::new("a.md", "hello world\n");
        assert_eq!(upsert(&ctx, &same, false).await.unwrap().status, UpsertStatus::Skipped);

        let changed = SourceItem::new("a.md", "hello there");
        assert_eq!(upsert(&ctx, &changed, false).await.unwrap().status, UpsertStatus::Updated);
        let doc = store.get_by_path("notes", "a.md").await.unwrap().unwrap();
        assert_eq!(doc.body, "hello there");
        assert_eq!(term.count("notes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_rewrites_unchanged() {
        let (ctx, _, _) = ctx();
        let item = SourceItem::new("a.md", "same");
        upsert(&ctx, &item, false).await.unwrap();
        let forced = upsert(&ctx, &item, true).await.unwrap();
        assert_eq!(forced.status, UpsertStatus::Updated);
        assert_eq!(forced.chunks, 1);
    }

    #[tokio::test]
    async fn test_reactivate_inactive_without_resplitting() {
        let (ctx, store, term) = ctx();
        let item = SourceItem::new("a.md", "quokka facts");
        upsert(&ctx, &item, false).await.unwrap();
        store.soft_delete("notes", "a.md").await.unwrap();
        term.delete_source("notes:a.md").await.unwrap();

        let outcome = upsert(&ctx, &item, false).await.unwrap();
        assert_eq!(outcome.status, UpsertStatus::Updated);
        assert_eq!(outcome.chunks, 0);
        assert!(store.get_by_path("notes", "a.md").await.unwrap().unwrap().active);
        assert_eq!(term.query("quokka", "notes", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_content_is_validation_error() {
        let (ctx, _, _) = ctx();
        let err = upsert(&ctx, &SourceItem::new("a.md", " \n\n\t"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_is_stored() {
        let (ctx, store, _) = ctx();
        let mut item = SourceItem::new("a.md", "body");
        item.metadata
            .insert("title".into(), serde_json::Value::String("A".into()));
        upsert(&ctx, &item, false).await.unwrap();
        let doc = store.get_by_path("notes", "a.md").await.unwrap().unwrap();
        assert_eq!(doc.metadata_json, r#"{"title":"A"}"#);
    }

    #[tokio::test]
    async fn test_lock_map_empties_after_writes() {
        let (ctx, _, _) = ctx();
        let items: Vec<SourceItem> = (0..20)
            .map(|i| SourceItem::new(format!("doc-{}.md", i % 5), format!("body {}", i)))
            .collect();
        let outcomes =
            futures::future::join_all(items.iter().map(|item| upsert(&ctx, item, false))).await;
        assert!(outcomes.iter().all(|o| o.is_ok()));

        // Rejected items leave nothing behind.
        assert!(upsert(&ctx, &SourceItem::new("blank.md", "  \n"), false).await.is_err());
        assert_eq!(ctx.locks.len().await, 0);
    }

    #[tokio::test]
    async fn test_release_keeps_entry_while_shared() {
        let locks = KeyLocks::default();
        let first = locks.lock_for("k").await;
        let second = locks.lock_for("k").await;
        assert!(Arc::ptr_eq(&first, &second));

        locks.release("k", first).await;
        assert_eq!(locks.len().await, 1);
        locks.release("k", second).await;
        assert_eq!(locks.len().await, 0);
    }
}
