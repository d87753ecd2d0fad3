//! Ingestion pipeline orchestration.
//!
//! Coordinates the sync flow: source → stages → persistence mediator
//! (normalize, hash, create/update/skip) → chunking → every index channel.
//!
//! Everything a pipeline call needs travels in an explicit
//! [`PipelineContext`]. [`run_batch`] drives the mediator over a batch with
//! bounded concurrency and partial-failure semantics: a failing item is
//! counted and its message recorded, and the batch carries on. Only an
//! unreachable store aborts the batch, and it is checked before any item is
//! touched.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::channel::term::FtsTermChannel;
use crate::channel::IndexChannel;
use crate::chunk::{chunk_document, SplitPolicy, StructuredSplitter};
use crate::config::{Config, NormalizeConfig};
use crate::db;
use crate::models::{source_key, SourceItem, UpsertStatus};
use crate::normalize::{content_hash, normalize};
use crate::persist::{self, KeyLocks};
use crate::progress::{IngestProgressEvent, IngestProgressReporter, NoProgress, ProgressMode};
use crate::search::sqlite_vector_channel;
use crate::source;
use crate::stage::StagePipeline;
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

/// Explicit state shared by every pipeline call for one scope.
pub struct PipelineContext {
    pub store: Arc<dyn DocumentStore>,
    pub channels: Vec<Arc<dyn IndexChannel>>,
    pub splitter: Arc<dyn SplitPolicy>,
    pub normalize: NormalizeConfig,
    pub scope: String,
    pub concurrency: usize,
    pub progress: Box<dyn IngestProgressReporter>,
    pub(crate) locks: KeyLocks,
}

impl PipelineContext {
    pub fn builder(store: Arc<dyn DocumentStore>, scope: &str) -> PipelineContextBuilder {
        PipelineContextBuilder {
            store,
            scope: scope.to_string(),
            channels: Vec::new(),
            splitter: None,
            normalize: NormalizeConfig::default(),
            concurrency: 4,
            progress: None,
        }
    }
}

pub struct PipelineContextBuilder {
    store: Arc<dyn DocumentStore>,
    scope: String,
    channels: Vec<Arc<dyn IndexChannel>>,
    splitter: Option<Arc<dyn SplitPolicy>>,
    normalize: NormalizeConfig,
    concurrency: usize,
    progress: Option<Box<dyn IngestProgressReporter>>,
}

impl PipelineContextBuilder {
    pub fn channel(mut self, channel: Arc<dyn IndexChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn splitter(mut self, splitter: Arc<dyn SplitPolicy>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn normalize(mut self, normalize: NormalizeConfig) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn progress(mut self, progress: Box<dyn IngestProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn build(self) -> PipelineContext {
        PipelineContext {
            store: self.store,
            channels: self.channels,
            splitter: self
                .splitter
                .unwrap_or_else(|| Arc::new(StructuredSplitter::from_config(&Default::default()))),
            normalize: self.normalize,
            scope: self.scope,
            concurrency: self.concurrency,
            progress: self.progress.unwrap_or_else(|| Box::new(NoProgress)),
            locks: KeyLocks::default(),
        }
    }
}

/// Accumulated outcome of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub deactivated: u64,
    pub chunks_written: u64,
    /// Chunks written per channel name.
    pub indexed: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl IngestStats {
    fn start() -> Self {
        Self {
            started_at: chrono::Utc::now().to_rfc3339(),
            ..Self::default()
        }
    }

    fn record_failure(&mut self, path: &str, err: &anyhow::Error) {
        warn!(path, error = %format!("{:#}", err), "item failed");
        self.failed += 1;
        self.errors.push(format!("{}: {:#}", path, err));
    }

    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }
}

/// Persist and index `items` into `ctx.scope`.
pub async fn run_batch(
    ctx: &PipelineContext,
    items: Vec<SourceItem>,
    force: bool,
) -> Result<IngestStats> {
    ctx.store
        .ping()
        .await
        .context("persistent store unreachable; batch aborted")?;

    let total = items.len() as u64;
    let mut stats = IngestStats::start();

    let mut results = stream::iter(items)
        .map(|item| async move {
            let outcome = persist::upsert(ctx, &item, force).await;
            (item.path, outcome)
        })
        .buffer_unordered(ctx.concurrency.max(1));

    while let Some((path, outcome)) = results.next().await {
        match outcome {
            Ok(o) => {
                match o.status {
                    UpsertStatus::Created => stats.created += 1,
                    UpsertStatus::Updated => stats.updated += 1,
                    UpsertStatus::Skipped => stats.skipped += 1,
                    UpsertStatus::Failed => stats.failed += 1,
                }
                if o.chunks > 0 {
                    stats.chunks_written += o.chunks as u64;
                    for channel in &ctx.channels {
                        *stats.indexed.entry(channel.name().to_string()).or_insert(0) +=
                            o.chunks as u64;
                    }
                }
            }
            Err(e) => stats.record_failure(&path, &e),
        }
        ctx.progress.report(IngestProgressEvent::Ingesting {
            scope: ctx.scope.clone(),
            n: stats.processed(),
            total,
        });
    }

    stats.completed_at = Some(chrono::Utc::now().to_rfc3339());
    Ok(stats)
}

/// Drop index entries for active documents not in `seen`, then soft-delete
/// them. A channel failure leaves the document active so the next cleanup
/// retries it.
pub async fn cleanup(
    ctx: &PipelineContext,
    seen: &HashSet<String>,
    stats: &mut IngestStats,
) -> Result<()> {
    let stale: Vec<String> = ctx
        .store
        .list_active_paths(&ctx.scope)
        .await?
        .into_iter()
        .filter(|p| !seen.contains(p))
        .collect();

    for path in stale {
        let key = source_key(&ctx.scope, &path);
        let result: Result<bool> = async {
            for channel in &ctx.channels {
                channel.delete_source(&key).await?;
            }
            ctx.store.soft_delete(&ctx.scope, &path).await
        }
        .await;
        match result {
            Ok(true) => {
                info!(path = %path, "deactivated");
                stats.deactivated += 1;
            }
            Ok(false) => {}
            Err(e) => stats.record_failure(&path, &e),
        }
    }

    ctx.progress.report(IngestProgressEvent::Cleanup {
        scope: ctx.scope.clone(),
        deactivated: stats.deactivated,
    });
    Ok(())
}

/// What a sync would do, without writing anything.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DryRunReport {
    pub items: u64,
    pub would_create: u64,
    pub would_update: u64,
    pub would_skip: u64,
    pub invalid: u64,
    pub estimated_chunks: u64,
}

pub async fn dry_run(ctx: &PipelineContext, items: &[SourceItem], force: bool) -> Result<DryRunReport> {
    ctx.store.ping().await.context("persistent store unreachable")?;
    let mut report = DryRunReport {
        items: items.len() as u64,
        ..DryRunReport::default()
    };
    for item in items {
        let body = normalize(&item.content, &ctx.normalize);
        if body.is_empty() || item.path.trim().is_empty() {
            report.invalid += 1;
            continue;
        }
        let chunks = || chunk_document(ctx.splitter.as_ref(), &ctx.scope, &item.path, &body).len() as u64;
        match ctx.store.get_by_path(&ctx.scope, &item.path).await? {
            None => {
                report.would_create += 1;
                report.estimated_chunks += chunks();
            }
            Some(doc) if doc.content_hash == content_hash(&body) && !force => {
                if doc.active {
                    report.would_skip += 1;
                } else {
                    report.would_update += 1;
                }
            }
            Some(_) => {
                report.would_update += 1;
                report.estimated_chunks += chunks();
            }
        }
    }
    Ok(report)
}

pub struct SyncOptions {
    pub force: bool,
    pub cleanup: bool,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub progress: ProgressMode,
}

/// `corpus sync`: scan `[source]`, ingest into SQLite, print a summary.
pub async fn run_sync(config: &Config, options: SyncOptions) -> Result<()> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::new(pool.clone()));
    let scope = config.source.scope.as_str();

    let mut builder = PipelineContext::builder(store, scope)
        .channel(Arc::new(FtsTermChannel::new(pool.clone())))
        .splitter(Arc::new(StructuredSplitter::from_config(&config.chunking)))
        .normalize(config.normalize.clone())
        .concurrency(config.ingest.concurrency)
        .progress(options.progress.reporter());
    if config.embedding.is_enabled() {
        builder = builder.channel(Arc::new(sqlite_vector_channel(config, &pool)));
    }
    let ctx = builder.build();

    ctx.progress.report(IngestProgressEvent::Discovering {
        scope: scope.to_string(),
    });
    let discovered = source::scan(&config.source)?;
    let mut items = StagePipeline::from_config(&config.ingest)?.run(discovered);
    let seen: HashSet<String> = items.iter().map(|i| i.path.clone()).collect();
    if let Some(limit) = options.limit {
        items.truncate(limit);
    }

    if options.dry_run {
        let report = dry_run(&ctx, &items, options.force).await?;
        println!("sync {} (dry-run)", scope);
        println!("  items found: {}", report.items);
        println!("  would create: {}", report.would_create);
        println!("  would update: {}", report.would_update);
        println!("  would skip: {}", report.would_skip);
        println!("  invalid: {}", report.invalid);
        println!("  estimated chunks: {}", report.estimated_chunks);
        pool.close().await;
        return Ok(());
    }

    let fetched = items.len();
    let mut stats = run_batch(&ctx, items, options.force).await?;
    if options.cleanup {
        cleanup(&ctx, &seen, &mut stats).await?;
    }

    println!("sync {}", scope);
    println!("  fetched: {} items", fetched);
    println!("  created: {}", stats.created);
    println!("  updated: {}", stats.updated);
    println!("  skipped: {}", stats.skipped);
    println!("  failed: {}", stats.failed);
    if options.cleanup {
        println!("  deactivated: {}", stats.deactivated);
    }
    println!("  chunks written: {}", stats.chunks_written);
    for (channel, n) in &stats.indexed {
        println!("  indexed ({}): {}", channel, n);
    }
    for err in &stats.errors {
        println!("  error: {}", err);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::term::MemoryTermChannel;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use crate::models::{ChannelHit, Chunk, Dataset, Document, DocumentUpdate};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DownStore;

    #[async_trait]
    impl DocumentStore for DownStore {
        async fn ping(&self) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn get_by_path(&self, _: &str, _: &str) -> Result<Option<Document>> {
            unreachable!()
        }
        async fn create(&self, _: &Document) -> Result<()> {
            unreachable!()
        }
        async fn update_fields(&self, _: &str, _: &str, _: &DocumentUpdate) -> Result<()> {
            unreachable!()
        }
        async fn soft_delete(&self, _: &str, _: &str) -> Result<bool> {
            unreachable!()
        }
        async fn list_active_paths(&self, _: &str) -> Result<Vec<String>> {
            unreachable!()
        }
        async fn replace_chunks(&self, _: &str, _: &[Chunk]) -> Result<()> {
            unreachable!()
        }
        async fn chunks_for(&self, _: &str) -> Result<Vec<Chunk>> {
            unreachable!()
        }
        async fn get_dataset(&self, _: &str) -> Result<Option<Dataset>> {
            unreachable!()
        }
        async fn record_dataset(&self, _: &Dataset) -> Result<()> {
            unreachable!()
        }
        async fn set_dataset_dims(&self, _: &str, _: usize) -> Result<()> {
            unreachable!()
        }
    }

    fn memory_ctx() -> PipelineContext {
        PipelineContext::builder(Arc::new(InMemoryStore::new()), "notes")
            .channel(Arc::new(MemoryTermChannel::new()))
            .build()
    }

    #[tokio::test]
    async fn test_bad_item_does_not_abort_batch() {
        let ctx = memory_ctx();
        let items = vec![
            SourceItem::new("good.md", "fine content"),
            SourceItem::new("blank.md", "   \n"),
            SourceItem::new("also.md", "more content"),
        ];
        let stats = run_batch(&ctx, items, false).await.unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].starts_with("blank.md"));
        assert_eq!(stats.indexed["term"], 2);
        assert!(stats.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_store_aborts_batch() {
        let ctx = PipelineContext::builder(Arc::new(DownStore), "notes").build();
        let err = run_batch(&ctx, vec![SourceItem::new("a.md", "x")], false)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("unreachable"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let ctx = memory_ctx();
        let items = vec![SourceItem::new("a.md", "alpha"), SourceItem::new("b.md", "")];
        let report = dry_run(&ctx, &items, false).await.unwrap();
        assert_eq!(report.would_create, 1);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.estimated_chunks, 1);
        assert!(ctx.store.list_active_paths("notes").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_deactivates_unseen() {
        let ctx = memory_ctx();
        run_batch(
            &ctx,
            vec![SourceItem::new("a.md", "alpha"), SourceItem::new("b.md", "beta")],
            false,
        )
        .await
        .unwrap();

        let seen: HashSet<String> = ["a.md".to_string()].into_iter().collect();
        let mut stats = IngestStats::default();
        cleanup(&ctx, &seen, &mut stats).await.unwrap();
        assert_eq!(stats.deactivated, 1);
        assert_eq!(ctx.store.list_active_paths("notes").await.unwrap(), vec!["a.md"]);
        assert_eq!(ctx.channels[0].count("notes").await.unwrap(), 1);
    }

    /// Term channel whose first `delete_source` fails.
    struct FlakyDelete {
        inner: MemoryTermChannel,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl IndexChannel for FlakyDelete {
        fn name(&self) -> &str {
            self.inner.name()
        }
        async fn upsert(&self, chunk_id: &str, text: &str, source_key: &str) -> Result<()> {
            self.inner.upsert(chunk_id, text, source_key).await
        }
        async fn replace_source(&self, source_key: &str, chunks: &[Chunk]) -> Result<()> {
            self.inner.replace_source(source_key, chunks).await
        }
        async fn delete_source(&self, source_key: &str) -> Result<u64> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                anyhow::bail!("index locked");
            }
            self.inner.delete_source(source_key).await
        }
        async fn query(&self, text: &str, scope: &str, limit: usize) -> Result<Vec<ChannelHit>> {
            self.inner.query(text, scope, limit).await
        }
        async fn count(&self, scope: &str) -> Result<usize> {
            self.inner.count(scope).await
        }
    }

    #[tokio::test]
    async fn test_cleanup_retries_after_channel_failure() {
        let channel = Arc::new(FlakyDelete {
            inner: MemoryTermChannel::new(),
            failed_once: AtomicBool::new(false),
        });
        let ctx = PipelineContext::builder(Arc::new(InMemoryStore::new()), "notes")
            .channel(channel.clone())
            .build();
        run_batch(
            &ctx,
            vec![
                SourceItem::new("a.md", "alpha"),
                SourceItem::new("b.md", "zucchini harvest"),
            ],
            false,
        )
        .await
        .unwrap();
        let seen: HashSet<String> = ["a.md".to_string()].into_iter().collect();

        let mut first = IngestStats::default();
        cleanup(&ctx, &seen, &mut first).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.deactivated, 0);
        let doc = ctx.store.get_by_path("notes", "b.md").await.unwrap().unwrap();
        assert!(doc.active);

        let mut second = IngestStats::default();
        cleanup(&ctx, &seen, &mut second).await.unwrap();
        assert_eq!(second.failed, 0);
        assert_eq!(second.deactivated, 1);
        let doc = ctx.store.get_by_path("notes", "b.md").await.unwrap().unwrap();
        assert!(!doc.active);
        assert!(channel.query("zucchini", "notes", 10).await.unwrap().is_empty());
    }
}
