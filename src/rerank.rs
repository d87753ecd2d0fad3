//! Judge-based reranking with position-aware blending.
//!
//! Each of the first `max_candidates` fused candidates is sent to a binary
//! relevance [`Judge`] together with the query. The judge's answer maps to a
//! rerank score in `[0, 1]`, which is blended with the candidate's raw
//! fused score:
//!
//! ```text
//! blended = clamp(w(rank) * rerank + (1 - w(rank)) * fused, 0, 1)
//! ```
//!
//! `w(rank)` comes from [`PositionSchedule`]: 0-based ranks below
//! `top_tier_end` use `top_tier_weight` (default 0.75), ranks below
//! `mid_tier_end` use `mid_tier_weight` (0.60), the rest `tail_weight` (0.40).
//!
//! Judge calls run concurrently, each under its own timeout. A failed,
//! timed-out, or unparseable judgment scores the neutral `0.5` for that
//! candidate only, so reranking never drops or fails a candidate.
//! Candidates past `max_candidates` are not judged; they follow the judged
//! set in fused order and never score above its lowest member.
//!
//! Successful judgments can be memoised in a [`JudgeCache`] keyed on
//! query, chunk id and judge model, so repeated queries only pay for
//! candidates the judge has not seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RerankConfig;
use crate::error::HarnessError;
use crate::fusion::sort_candidates;
use crate::http::{self, JsonEndpoint};
use crate::models::Candidate;

pub const NEUTRAL_SCORE: f64 = 0.5;
const RELEVANT_SCORE: f64 = 0.95;
const RELEVANT_CONFIDENCE: f64 = 0.9;
const NOT_RELEVANT_SCORE: f64 = 0.05;
const NOT_RELEVANT_CONFIDENCE: f64 = 0.1;
const JUDGE_MAX_RETRIES: u32 = 2;

pub const RERANK_SYSTEM: &str = "You are a relevance judge. Your task is to determine if a document is relevant to a search query.\n\
Respond with ONLY 'Yes' if the document answers or relates to the query, or 'No' if it does not.\n\
Do not explain your reasoning. Answer with a single word: Yes or No.";

/// A black-box relevance classifier.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// A parsed judge answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Judgment {
    pub relevant: bool,
    pub score: f64,
    pub confidence: f64,
}

/// Build the user prompt; the document is cut to `max_doc_chars` chars.
pub fn build_prompt(query: &str, document: &str, max_doc_chars: usize) -> String {
    let document = if document.chars().count() > max_doc_chars {
        let cut: String = document.chars().take(max_doc_chars).collect();
        format!("{}...", cut)
    } else {
        document.to_string()
    };
    format!(
        "Query: {}\n\nDocument:\n{}\n\nIs this document relevant to the query? Answer Yes or No:",
        query, document
    )
}

/// `"yes..."` is relevant, any other non-empty answer is not.
pub fn parse_judgment(response: &str) -> Result<Judgment, HarnessError> {
    let answer = response.trim().to_lowercase();
    if answer.is_empty() {
        return Err(HarnessError::JudgeFailure("empty judge response".into()));
    }
    if answer.starts_with("yes") {
        Ok(Judgment {
            relevant: true,
            score: RELEVANT_SCORE,
            confidence: RELEVANT_CONFIDENCE,
        })
    } else {
        Ok(Judgment {
            relevant: false,
            score: NOT_RELEVANT_SCORE,
            confidence: NOT_RELEVANT_CONFIDENCE,
        })
    }
}

/// Judge weight by 0-based position in the fused list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSchedule {
    pub top_tier_end: usize,
    pub mid_tier_end: usize,
    pub top_tier_weight: f64,
    pub mid_tier_weight: f64,
    pub tail_weight: f64,
}

impl PositionSchedule {
    pub fn from_config(config: &RerankConfig) -> Self {
        Self {
            top_tier_end: config.top_tier_end,
            mid_tier_end: config.mid_tier_end,
            top_tier_weight: config.top_tier_weight,
            mid_tier_weight: config.mid_tier_weight,
            tail_weight: config.tail_weight,
        }
    }

    pub fn weight(&self, rank: usize) -> f64 {
        if rank < self.top_tier_end {
            self.top_tier_weight
        } else if rank < self.mid_tier_end {
            self.mid_tier_weight
        } else {
            self.tail_weight
        }
    }
}

impl Default for PositionSchedule {
    fn default() -> Self {
        Self::from_config(&RerankConfig::default())
    }
}

pub struct Reranker {
    judge: Box<dyn Judge>,
    schedule: PositionSchedule,
    max_candidates: usize,
    max_doc_chars: usize,
    timeout: Duration,
    cache: Option<Arc<dyn JudgeCache>>,
    model: String,
}

impl Reranker {
    pub fn new(judge: Box<dyn Judge>, config: &RerankConfig) -> Self {
        Self {
            judge,
            schedule: PositionSchedule::from_config(config),
            max_candidates: config.max_candidates,
            max_doc_chars: config.max_doc_chars,
            timeout: Duration::from_secs(config.timeout_secs),
            cache: None,
            model: config.model.clone().unwrap_or_else(|| "default".to_string()),
        }
    }

    /// Memoise judgments in `cache`. `model` is part of every key.
    pub fn with_cache(mut self, cache: Arc<dyn JudgeCache>, model: &str) -> Self {
        self.cache = Some(cache);
        self.model = model.to_string();
        self
    }

    async fn judge_one(&self, query: &str, candidate: &Candidate) -> Result<f64> {
        let prompt = build_prompt(query, &candidate.text, self.max_doc_chars);
        match tokio::time::timeout(self.timeout, self.judge.generate(&prompt)).await {
            Ok(Ok(response)) => Ok(parse_judgment(&response)?.score),
            Ok(Err(e)) => Err(HarnessError::JudgeFailure(e.to_string()).into()),
            Err(_) => Err(HarnessError::JudgeFailure(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            ))
            .into()),
        }
    }

    /// Cached score if present, else a fresh judgment. Failures score
    /// neutral and are never cached.
    async fn score_one(&self, query: &str, candidate: &Candidate) -> f64 {
        let key = judge_cache_key(query, &candidate.chunk_id, &self.model);
        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(score)) => {
                    debug!(chunk_id = %candidate.chunk_id, score, "judge cache hit");
                    return score;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "judge cache read failed"),
            }
        }

        match self.judge_one(query, candidate).await {
            Ok(score) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.put(&key, score).await {
                        warn!(error = %e, "judge cache write failed");
                    }
                }
                score
            }
            Err(e) => {
                warn!(chunk_id = %candidate.chunk_id, error = %e, "judge failed, using neutral score");
                NEUTRAL_SCORE
            }
        }
    }

    /// Rerank `candidates` (already in fused order). Returns every input
    /// candidate: the judged head re-sorted by blended score, then the
    /// unjudged tail in fused order.
    pub async fn rerank(&self, query: &str, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }

        let judged_len = candidates.len().min(self.max_candidates);
        let rerank_scores: Vec<f64> = join_all(
            candidates[..judged_len]
                .iter()
                .map(|c| self.score_one(query, c)),
        )
        .await;

        let tail = candidates.split_off(judged_len);
        let mut judged = candidates;
        for ((rank, candidate), rerank) in judged.iter_mut().enumerate().zip(rerank_scores) {
            let weight = self.schedule.weight(rank);
            candidate.score = blend(weight, rerank, candidate.fused_score);
            candidate.components.insert("rerank".to_string(), rerank);
            candidate
                .components
                .insert("blend_weight".to_string(), weight);
            debug!(
                rank = rank + 1,
                chunk_id = %candidate.chunk_id,
                rerank,
                weight,
                blended = candidate.score,
                "blended"
            );
        }
        sort_candidates(&mut judged);

        let floor = judged.last().map(|c| c.score).unwrap_or(f64::INFINITY);
        for mut candidate in tail {
            candidate.score = candidate.fused_score.min(floor);
            judged.push(candidate);
        }
        judged
    }
}

pub fn blend(weight: f64, rerank: f64, fused: f64) -> f64 {
    (weight * rerank + (1.0 - weight) * fused).clamp(0.0, 1.0)
}

// ============ Judge cache ============

/// `sha256("rerank:" + query + ":" + chunk_id + ":" + model)`, hex.
pub fn judge_cache_key(query: &str, chunk_id: &str, model: &str) -> String {
    hex::encode(Sha256::digest(
        format!("rerank:{}:{}:{}", query, chunk_id, model).as_bytes(),
    ))
}

/// Persistent store of judge scores.
#[async_trait]
pub trait JudgeCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<f64>>;
    async fn put(&self, key: &str, score: f64) -> Result<()>;
}

/// `judge_cache` table; entries older than the TTL are deleted on read.
pub struct SqliteJudgeCache {
    pool: SqlitePool,
    ttl_secs: i64,
}

impl SqliteJudgeCache {
    pub fn new(pool: SqlitePool, ttl_hours: u64) -> Self {
        Self {
            pool,
            ttl_secs: i64::try_from(ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX),
        }
    }
}

#[async_trait]
impl JudgeCache for SqliteJudgeCache {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        let row: Option<(f64, i64)> =
            sqlx::query_as("SELECT score, created_at FROM judge_cache WHERE cache_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        let Some((score, created_at)) = row else {
            return Ok(None);
        };
        if chrono::Utc::now().timestamp().saturating_sub(created_at) > self.ttl_secs {
            sqlx::query("DELETE FROM judge_cache WHERE cache_key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(score))
    }

    async fn put(&self, key: &str, score: f64) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO judge_cache (cache_key, score, created_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(score)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local cache with no expiry.
#[derive(Default)]
pub struct MemoryJudgeCache {
    entries: Mutex<HashMap<String, f64>>,
}

impl MemoryJudgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl JudgeCache for MemoryJudgeCache {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.entries.lock().await.get(key).copied())
    }

    async fn put(&self, key: &str, score: f64) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), score);
        Ok(())
    }
}

// ============ Judge backends ============

/// Ollama `/api/generate`, non-streaming.
pub struct OllamaJudge {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaJudge {
    pub fn new(config: &RerankConfig, model: &str) -> Result<Self> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Judge for OllamaJudge {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "system": RERANK_SYSTEM,
            "stream": false,
            "options": { "temperature": 0.0, "num_predict": 5 },
        });
        let endpoint = JsonEndpoint {
            label: "Ollama judge",
            url: self.url.clone(),
            bearer: None,
        };
        let value = http::post_json_with_retry(&self.client, &endpoint, &body, JUDGE_MAX_RETRIES).await?;
        parse_ollama_response(&value)
    }
}

pub fn parse_ollama_response(value: &serde_json::Value) -> Result<String> {
    value["response"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Ollama judge response missing 'response'"))
}

/// OpenAI chat completions.
pub struct OpenAiJudge {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiJudge {
    pub fn new(config: &RerankConfig, model: &str) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Judge for OpenAiJudge {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": RERANK_SYSTEM },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.0,
            "max_tokens": 5,
        });
        let endpoint = JsonEndpoint {
            label: "OpenAI judge",
            url: self.url.clone(),
            bearer: Some(self.api_key.clone()),
        };
        let value = http::post_json_with_retry(&self.client, &endpoint, &body, JUDGE_MAX_RETRIES).await?;
        parse_chat_response(&value)
    }
}

pub fn parse_chat_response(value: &serde_json::Value) -> Result<String> {
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("OpenAI judge response missing message content"))
}

/// Build the configured reranker, or `None` when reranking is disabled.
/// `cache`, when given, memoises judgments under the configured model.
pub fn create_reranker(
    config: &RerankConfig,
    cache: Option<Arc<dyn JudgeCache>>,
) -> Result<Option<Reranker>> {
    if !config.enabled || config.provider == "disabled" {
        return Ok(None);
    }
    let model = config
        .model
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("rerank.model required for provider {}", config.provider))?;
    let judge: Box<dyn Judge> = match config.provider.as_str() {
        "ollama" => Box::new(OllamaJudge::new(config, model)?),
        "openai" => Box::new(OpenAiJudge::new(config, model)?),
        other => anyhow::bail!("Unknown rerank provider: {}", other),
    };
    let reranker = Reranker::new(judge, config);
    Ok(Some(match cache {
        Some(cache) => reranker.with_cache(cache, model),
        None => reranker,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingJudge;

    #[async_trait]
    impl Judge for FailingJudge {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("judge offline")
        }
    }

    /// Says yes only when the document mentions `keyword`.
    struct KeywordJudge(&'static str);

    #[async_trait]
    impl Judge for KeywordJudge {
        async fn generate(&self, prompt: &str) -> Result<String> {
            let document = prompt.split("Document:\n").nth(1).unwrap_or_default();
            Ok(if document.contains(self.0) { "Yes" } else { "No" }.to_string())
        }
    }

    /// Always "No"; counts calls.
    struct CountingJudge(Arc<AtomicUsize>);

    #[async_trait]
    impl Judge for CountingJudge {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("No".into())
        }
    }

    struct SlowJudge;

    #[async_trait]
    impl Judge for SlowJudge {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("Yes".into())
        }
    }

    fn candidate(id: &str, text: &str, fused: f64) -> Candidate {
        Candidate {
            chunk_id: id.to_string(),
            source_key: format!("s:{}.md", id),
            text: text.to_string(),
            score: fused,
            fused_score: fused,
            channel_scores: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }

    fn three() -> Vec<Candidate> {
        vec![
            candidate("a", "alpha", 3.0 / 61.0),
            candidate("b", "beta", 2.0 / 62.0),
            candidate("c", "gamma", 1.0 / 63.0),
        ]
    }

    #[test]
    fn test_parse_judgment() {
        let yes = parse_judgment("  Yes, clearly").unwrap();
        assert!(yes.relevant);
        assert_eq!(yes.score, 0.95);
        let no = parse_judgment("No").unwrap();
        assert!(!no.relevant);
        assert_eq!(no.confidence, 0.1);
        assert!(matches!(
            parse_judgment("   "),
            Err(HarnessError::JudgeFailure(_))
        ));
    }

    #[test]
    fn test_prompt_truncates_document() {
        let prompt = build_prompt("q", "abcdef", 3);
        assert!(prompt.contains("Document:\nabc...\n"));
        assert!(prompt.starts_with("Query: q\n\n"));
        assert!(prompt.ends_with("Answer Yes or No:"));
    }

    #[test]
    fn test_position_schedule_tiers() {
        let s = PositionSchedule::default();
        assert_eq!(s.weight(0), 0.75);
        assert_eq!(s.weight(2), 0.75);
        assert_eq!(s.weight(3), 0.60);
        assert_eq!(s.weight(9), 0.60);
        assert_eq!(s.weight(10), 0.40);
    }

    #[tokio::test]
    async fn test_all_judges_failing_keeps_every_candidate_neutral() {
        let reranker = Reranker::new(Box::new(FailingJudge), &RerankConfig::default());
        let out = reranker.rerank("q", three()).await;

        assert_eq!(out.len(), 3);
        for c in &out {
            assert_eq!(c.components["rerank"], NEUTRAL_SCORE);
            assert!((0.0..=1.0).contains(&c.score));
        }
        // Top tier: 0.75 * 0.5 + 0.25 * fused; fused order survives.
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!((out[0].score - (0.375 + 0.25 * 3.0 / 61.0)).abs() < 1e-12);
        assert!((out[2].score - (0.375 + 0.25 * 1.0 / 63.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_uniform_verdict_keeps_close_fused_order() {
        // Fused scores a few thousandths apart, spanning the tier boundary.
        let input = vec![
            candidate("c0", "one", 2.0 / 61.0),
            candidate("c1", "two", 2.0 / 62.5),
            candidate("c2", "three", 1.0 / 61.0 + 1.0 / 70.0),
            candidate("c3", "four", 1.0 / 61.0 + 1.0 / 71.0),
            candidate("c4", "five", 1.0 / 80.0),
        ];
        let reranker = Reranker::new(Box::new(KeywordJudge("nowhere")), &RerankConfig::default());
        let out = reranker.rerank("q", input.clone()).await;
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4"]);
        assert!((out[0].score - (0.75 * 0.05 + 0.25 * 2.0 / 61.0)).abs() < 1e-12);

        let reranker = Reranker::new(Box::new(FailingJudge), &RerankConfig::default());
        let out = reranker.rerank("q", input).await;
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[test]
    fn test_blend_clamps_to_unit_interval() {
        assert_eq!(blend(0.4, 1.0, 3.0), 1.0);
        assert_eq!(blend(0.75, 0.0, -1.0), 0.0);
        assert!((blend(0.6, 0.5, 0.25) - 0.4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_judge_promotes_relevant_candidate() {
        let reranker = Reranker::new(Box::new(KeywordJudge("gamma")), &RerankConfig::default());
        let out = reranker.rerank("q", three()).await;
        assert_eq!(out[0].chunk_id, "c");
        for pair in out.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_timeout_scores_neutral() {
        let config = RerankConfig {
            timeout_secs: 0,
            ..RerankConfig::default()
        };
        let reranker = Reranker::new(Box::new(SlowJudge), &config);
        let out = reranker.rerank("q", three()).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|c| c.components["rerank"] == NEUTRAL_SCORE));
    }

    #[tokio::test]
    async fn test_candidates_past_limit_are_not_judged() {
        let config = RerankConfig {
            max_candidates: 1,
            ..RerankConfig::default()
        };
        let reranker = Reranker::new(Box::new(KeywordJudge("alpha")), &config);
        let out = reranker.rerank("q", three()).await;
        assert_eq!(out.len(), 3);
        let unjudged: Vec<&Candidate> = out
            .iter()
            .filter(|c| !c.components.contains_key("rerank"))
            .collect();
        assert_eq!(unjudged.len(), 2);
    }

    #[tokio::test]
    async fn test_unjudged_tail_never_outranks_judged() {
        let config = RerankConfig {
            max_candidates: 1,
            ..RerankConfig::default()
        };
        let reranker = Reranker::new(Box::new(KeywordJudge("nowhere")), &config);
        let input = vec![
            candidate("a", "alpha", 0.9),
            candidate("b", "beta", 0.8),
            candidate("c", "gamma", 0.1),
        ];
        let out = reranker.rerank("q", input).await;

        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let judged = 0.75 * 0.05 + 0.25 * 0.9;
        assert!((out[0].score - judged).abs() < 1e-12);
        assert_eq!(out[1].score, out[0].score);
        assert_eq!(out[2].score, 0.1);
        for pair in out.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_cache_partial_hit_judges_only_misses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(MemoryJudgeCache::new());

        let two = RerankConfig {
            max_candidates: 2,
            ..RerankConfig::default()
        };
        let first = Reranker::new(Box::new(CountingJudge(calls.clone())), &two)
            .with_cache(cache.clone(), "judge-a");
        first.rerank("q", three()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);

        let second = Reranker::new(Box::new(CountingJudge(calls.clone())), &RerankConfig::default())
            .with_cache(cache.clone(), "judge-a");
        let out = second.rerank("q", three()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len().await, 3);
        assert!(out.iter().all(|c| c.components["rerank"] == 0.05));

        // A different model shares nothing.
        let other = Reranker::new(Box::new(CountingJudge(calls.clone())), &RerankConfig::default())
            .with_cache(cache.clone(), "judge-b");
        other.rerank("q", three()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_failed_judgments_are_not_cached() {
        let cache = Arc::new(MemoryJudgeCache::new());
        let reranker = Reranker::new(Box::new(FailingJudge), &RerankConfig::default())
            .with_cache(cache.clone(), "judge-a");
        reranker.rerank("q", three()).await;
        assert_eq!(cache.len().await, 0);
    }

    #[test]
    fn test_judge_cache_key() {
        let key = judge_cache_key("q", "chunk", "m");
        assert_eq!(key.len(), 64);
        assert_eq!(key, judge_cache_key("q", "chunk", "m"));
        assert_ne!(key, judge_cache_key("q", "chunk", "n"));
        assert_ne!(key, judge_cache_key("q2", "chunk", "m"));
    }

    #[tokio::test]
    async fn test_sqlite_judge_cache_expires_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.sqlite")).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let cache = SqliteJudgeCache::new(pool.clone(), 1);

        cache.put("fresh", 0.95).await.unwrap();
        assert_eq!(cache.get("fresh").await.unwrap(), Some(0.95));
        assert_eq!(cache.get("absent").await.unwrap(), None);

        sqlx::query("INSERT INTO judge_cache (cache_key, score, created_at) VALUES ('stale', 0.05, ?)")
            .bind(chrono::Utc::now().timestamp() - 2 * 3600)
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(cache.get("stale").await.unwrap(), None);
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM judge_cache WHERE cache_key = 'stale'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let reranker = Reranker::new(Box::new(FailingJudge), &RerankConfig::default());
        assert!(reranker.rerank("q", Vec::new()).await.is_empty());
    }

    #[test]
    fn test_parse_backend_responses() {
        assert_eq!(
            parse_ollama_response(&json!({"response": "Yes"})).unwrap(),
            "Yes"
        );
        assert_eq!(
            parse_chat_response(&json!({"choices": [{"message": {"content": "No"}}]})).unwrap(),
            "No"
        );
        assert!(parse_chat_response(&json!({})).is_err());
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        assert!(create_reranker(&RerankConfig::default(), None).unwrap().is_none());
    }
}
