//! Query flow: channel fan-out, fusion, optional rerank.
//!
//! [`SearchService::search`] queries the selected channels concurrently,
//! each under `retrieval.channel_timeout_secs`. A channel that errors or
//! times out is reported as
//! [`ChannelUnavailable`](crate::error::HarnessError::ChannelUnavailable),
//! logged, and left out of fusion; the query still answers from the rest.
//! The outcome lists which channels were used and which were excluded.
//!
//! | Mode | Channels |
//! |------|----------|
//! | `term` | term |
//! | `vector` | vector |
//! | `fused` | every configured channel |
//!
//! Single-channel modes still go through [`fuse`], which preserves the
//! channel's own ordering.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::channel::term::FtsTermChannel;
use crate::channel::vector::{SqliteVectorIndex, VectorChannel};
use crate::channel::{IndexChannel, TERM, VECTOR};
use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding::{ConfigEmbedderFactory, IdentityBinder};
use crate::error::HarnessError;
use crate::fusion::{fuse, ChannelRanking};
use crate::models::Candidate;
use crate::rerank::{create_reranker, JudgeCache, Reranker, SqliteJudgeCache};
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Term,
    Vector,
    Fused,
}

impl SearchMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "term" => Ok(Self::Term),
            "vector" => Ok(Self::Vector),
            "fused" => Ok(Self::Fused),
            _ => bail!("Unknown search mode: {}. Use term, vector, or fused.", mode),
        }
    }

    fn includes(&self, channel: &str) -> bool {
        match self {
            Self::Term => channel == TERM,
            Self::Vector => channel == VECTOR,
            Self::Fused => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedChannel {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub candidates: Vec<Candidate>,
    pub channels_used: Vec<String>,
    pub excluded: Vec<ExcludedChannel>,
    pub reranked: bool,
}

pub struct WeightedChannel {
    pub channel: Arc<dyn IndexChannel>,
    pub weight: f64,
}

pub struct SearchService {
    channels: Vec<WeightedChannel>,
    reranker: Option<Reranker>,
    retrieval: RetrievalConfig,
}

impl SearchService {
    pub fn new(retrieval: RetrievalConfig) -> Self {
        Self {
            channels: Vec::new(),
            reranker: None,
            retrieval,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn IndexChannel>, weight: f64) -> Self {
        self.channels.push(WeightedChannel { channel, weight });
        self
    }

    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    pub async fn search(
        &self,
        query: &str,
        scope: &str,
        mode: SearchMode,
        rerank: bool,
        limit: usize,
    ) -> Result<SearchOutcome> {
        if query.trim().is_empty() {
            return Ok(SearchOutcome::default());
        }

        let selected: Vec<&WeightedChannel> = self
            .channels
            .iter()
            .filter(|c| mode.includes(c.channel.name()))
            .collect();
        if selected.is_empty() {
            bail!(
                "Mode {:?} has no configured channel. Set [embedding] provider in config for vector search.",
                mode
            );
        }
        let reranker = match (rerank, &self.reranker) {
            (false, _) => None,
            (true, Some(r)) => Some(r),
            (true, None) => bail!("Reranking requested but [rerank] is not enabled in config"),
        };

        let timeout = Duration::from_secs(self.retrieval.channel_timeout_secs);
        let candidate_k = self.retrieval.candidate_k;
        let answers = join_all(selected.iter().map(|wc| async move {
            let name = wc.channel.name().to_string();
            let answer =
                match tokio::time::timeout(timeout, wc.channel.query(query, scope, candidate_k))
                    .await
                {
                    Ok(Ok(hits)) => Ok(hits),
                    Ok(Err(e)) => match e.downcast::<HarnessError>() {
                        Ok(domain @ HarnessError::ChannelUnavailable { .. }) => Err(domain),
                        Ok(other) => Err(HarnessError::channel_unavailable(&name, other)),
                        Err(e) => Err(HarnessError::channel_unavailable(&name, e)),
                    },
                    Err(_) => Err(HarnessError::channel_unavailable(
                        &name,
                        format!("timed out after {}s", timeout.as_secs()),
                    )),
                };
            (name, wc.weight, answer)
        }))
        .await;

        let mut outcome = SearchOutcome::default();
        let mut rankings = Vec::new();
        for (name, weight, answer) in answers {
            match answer {
                Ok(hits) => {
                    debug!(channel = %name, hits = hits.len(), "channel answered");
                    outcome.channels_used.push(name.clone());
                    rankings.push(ChannelRanking::new(name, weight, hits));
                }
                Err(e) => {
                    warn!(channel = %name, error = %e, "excluding channel from fusion");
                    let reason = match e {
                        HarnessError::ChannelUnavailable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    outcome.excluded.push(ExcludedChannel {
                        channel: name,
                        reason,
                    });
                }
            }
        }

        let fuse_n = if reranker.is_some() {
            limit.max(candidate_k)
        } else {
            limit
        };
        let mut candidates = fuse(&rankings, self.retrieval.rrf_k, fuse_n);

        if let Some(reranker) = reranker {
            candidates = reranker.rerank(query, candidates).await;
            outcome.reranked = true;
        }
        candidates.truncate(limit);
        outcome.candidates = candidates;
        Ok(outcome)
    }
}

/// Term channel plus, when embeddings are enabled, the vector channel,
/// over one SQLite pool.
pub fn sqlite_service(config: &Config, pool: &SqlitePool, with_rerank: bool) -> Result<SearchService> {
    let mut service = SearchService::new(config.retrieval.clone()).with_channel(
        Arc::new(FtsTermChannel::new(pool.clone())),
        config.retrieval.term_weight,
    );
    if config.embedding.is_enabled() {
        service = service.with_channel(
            Arc::new(sqlite_vector_channel(config, pool)),
            config.retrieval.vector_weight,
        );
    }
    if with_rerank {
        let cache: Option<Arc<dyn JudgeCache>> = config.rerank.cache.then(|| {
            Arc::new(SqliteJudgeCache::new(pool.clone(), config.rerank.cache_ttl_hours))
                as Arc<dyn JudgeCache>
        });
        if let Some(reranker) = create_reranker(&config.rerank, cache)? {
            service = service.with_reranker(reranker);
        }
    }
    Ok(service)
}

pub fn sqlite_vector_channel(config: &Config, pool: &SqlitePool) -> VectorChannel {
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::new(pool.clone()));
    let factory = Arc::new(ConfigEmbedderFactory::new(config.embedding.clone()));
    VectorChannel::new(
        Arc::new(SqliteVectorIndex::new(pool.clone())),
        Arc::new(IdentityBinder::new(store, factory)),
    )
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    rerank: bool,
    limit: Option<usize>,
    explain: bool,
) -> Result<()> {
    let mode = SearchMode::parse(mode)?;
    let pool = db::connect(config).await?;
    let service = sqlite_service(config, &pool, rerank)?;
    let limit = limit.unwrap_or(config.retrieval.top_n);

    let outcome = service
        .search(query, &config.source.scope, mode, rerank, limit)
        .await?;
    pool.close().await;

    for excluded in &outcome.excluded {
        println!("(channel {} excluded: {})", excluded.channel, excluded.reason);
    }
    if outcome.candidates.is_empty() {
        println!("No results.");
        return Ok(());
    }

    println!("channels: {}", outcome.channels_used.join(", "));
    println!();
    for (i, c) in outcome.candidates.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, c.score, c.path());
        println!("    chunk: {}", c.chunk_id);
        let excerpt: String = c.text.chars().take(200).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        if explain {
            println!("    fused: {:.6}", c.fused_score);
            for (channel, raw) in &c.channel_scores {
                println!("    {} score: {:.4}", channel, raw);
            }
            for (component, value) in &c.components {
                println!("    {} = {:.6}", component, value);
            }
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::term::MemoryTermChannel;
    use crate::chunk::assign_identities;
    use crate::models::{ChannelHit, Chunk};
    use async_trait::async_trait;

    struct BrokenChannel;

    #[async_trait]
    impl IndexChannel for BrokenChannel {
        fn name(&self) -> &str {
            VECTOR
        }
        async fn upsert(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn replace_source(&self, _: &str, _: &[Chunk]) -> Result<()> {
            Ok(())
        }
        async fn delete_source(&self, _: &str) -> Result<u64> {
            Ok(0)
        }
        async fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<ChannelHit>> {
            bail!("embedding backend unreachable")
        }
        async fn count(&self, _: &str) -> Result<usize> {
            Ok(0)
        }
    }

    async fn term_channel() -> Arc<dyn IndexChannel> {
        let ch = MemoryTermChannel::new();
        let chunks = assign_identities("s", "a.md", vec!["deploy the service".into()]);
        ch.replace_source("s:a.md", &chunks).await.unwrap();
        Arc::new(ch)
    }

    #[tokio::test]
    async fn test_failing_channel_is_excluded_not_fatal() {
        let service = SearchService::new(RetrievalConfig::default())
            .with_channel(term_channel().await, 1.0)
            .with_channel(Arc::new(BrokenChannel), 1.0);

        let outcome = service
            .search("deploy", "s", SearchMode::Fused, false, 10)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.channels_used, vec!["term"]);
        assert_eq!(outcome.excluded.len(), 1);
        assert_eq!(outcome.excluded[0].channel, "vector");
    }

    #[tokio::test]
    async fn test_mode_selects_channels() {
        let service = SearchService::new(RetrievalConfig::default())
            .with_channel(term_channel().await, 1.0);
        assert!(service
            .search("deploy", "s", SearchMode::Vector, false, 10)
            .await
            .is_err());
        let outcome = service
            .search("deploy", "s", SearchMode::Term, false, 10)
            .await
            .unwrap();
        assert_eq!(outcome.candidates[0].path(), "a.md");
    }

    #[tokio::test]
    async fn test_rerank_without_reranker_is_an_error() {
        let service = SearchService::new(RetrievalConfig::default())
            .with_channel(term_channel().await, 1.0);
        assert!(service
            .search("deploy", "s", SearchMode::Term, true, 10)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_blank_query_returns_nothing() {
        let service = SearchService::new(RetrievalConfig::default())
            .with_channel(term_channel().await, 1.0);
        let outcome = service
            .search("   ", "s", SearchMode::Term, false, 10)
            .await
            .unwrap();
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(SearchMode::parse("fused").unwrap(), SearchMode::Fused);
        assert!(SearchMode::parse("hybrid").is_err());
    }
}
