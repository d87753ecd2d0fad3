//! Evaluation runs and their artifacts.
//!
//! [`evaluate`] drives [`SearchService`] once per (query, configuration)
//! pair. [`run_eval`] wraps it for the CLI: it loads the golden file,
//! evaluates against the SQLite corpus, checks thresholds, and writes four
//! artifacts into `<output_dir>/<run_id>/`:
//!
//! | File | Content |
//! |------|---------|
//! | `run.json` | run id, timestamp, inputs, corpus hash, settings, channels, baseline key |
//! | `results.jsonl` | one [`QueryResult`] per line |
//! | `metrics.json` | bucket aggregates, thresholds, failures |
//! | `traces.jsonl` | per result: rank, final score, component scores |

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use super::golden::{load_golden_queries, GoldenQuery, RetrieverType};
use super::metrics::{
    aggregate, check_thresholds, configured_thresholds, hits_at, ranked_documents, reciprocal_rank,
    BucketMetrics, QueryResult, ThresholdFailure, Thresholds,
};
use crate::config::{Config, SourceConfig};
use crate::db;
use crate::search::{sqlite_service, SearchMode, SearchService};
use crate::source;
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

/// One ranked row of one (query, configuration) answer.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub query: String,
    pub config: RetrieverType,
    pub rank: usize,
    pub path: String,
    pub chunk_id: String,
    pub score: f64,
    pub fused_score: f64,
    pub channel_scores: BTreeMap<String, f64>,
    pub components: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct EvalReport {
    pub results: Vec<QueryResult>,
    pub traces: Vec<TraceRecord>,
    pub buckets: Vec<BucketMetrics>,
}

fn mode_for(config: RetrieverType) -> (SearchMode, bool) {
    match config {
        RetrieverType::Bm25 => (SearchMode::Term, false),
        RetrieverType::Vector => (SearchMode::Vector, false),
        RetrieverType::Hybrid => (SearchMode::Fused, false),
        RetrieverType::HybridRerank => (SearchMode::Fused, true),
    }
}

/// Evaluate every query against each of its configurations. Rerank
/// configurations are skipped unless `include_rerank` is set and the
/// service has a reranker.
pub async fn evaluate(
    service: &SearchService,
    scope: &str,
    queries: &[GoldenQuery],
    ks: &[usize],
    include_rerank: bool,
    search_limit: usize,
) -> Result<EvalReport> {
    let cutoff = ks.iter().copied().max().unwrap_or(10);
    let limit = search_limit.max(cutoff);
    let rerank_available = include_rerank && service.has_reranker();
    let mut report = EvalReport::default();

    for gq in queries {
        for &config in &gq.retriever_types {
            let (mode, rerank) = mode_for(config);
            if rerank && !rerank_available {
                continue;
            }

            let (candidates, channels_used, error) =
                match service.search(&gq.query, scope, mode, rerank, limit).await {
                    Ok(outcome) => (outcome.candidates, outcome.channels_used, None),
                    Err(e) => {
                        warn!(query = %gq.query, %config, error = %e, "search failed");
                        (Vec::new(), Vec::new(), Some(format!("{:#}", e)))
                    }
                };

            let (retrieved, scores) = ranked_documents(&candidates);
            for (i, c) in candidates.iter().enumerate() {
                report.traces.push(TraceRecord {
                    query: gq.query.clone(),
                    config,
                    rank: i + 1,
                    path: c.path().to_string(),
                    chunk_id: c.chunk_id.clone(),
                    score: c.score,
                    fused_score: c.fused_score,
                    channel_scores: c.channel_scores.clone(),
                    components: c.components.clone(),
                });
            }

            report.results.push(QueryResult {
                query: gq.query.clone(),
                difficulty: gq.difficulty,
                config,
                expected_docs: gq.expected_docs.clone(),
                hits: hits_at(&retrieved, &gq.expected_docs, ks),
                reciprocal_rank: reciprocal_rank(&retrieved, &gq.expected_docs, cutoff),
                retrieved_docs: retrieved,
                scores,
                channels_used,
                error,
            });
        }
    }

    report.buckets = aggregate(&report.results, ks);
    Ok(report)
}

/// `sha256:` over each matching file's relative path and bytes, in path
/// order, each field followed by a NUL byte.
pub fn compute_corpus_hash(source: &SourceConfig) -> Result<String> {
    let mut hasher = Sha256::new();
    for (rel, path) in source::list_files(source)? {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?);
        hasher.update([0u8]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub embedding: String,
    pub term_impl: String,
    pub chunk_max_chars: usize,
    pub rrf_k: f64,
    pub term_weight: f64,
    pub vector_weight: f64,
    pub rerank: bool,
    pub k_values: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub created_at: String,
    pub queries_path: String,
    pub queries_version: String,
    pub corpus_root: String,
    pub corpus_hash: String,
    pub settings: RunSettings,
    pub channels: Vec<String>,
    pub baseline_key: String,
}

pub fn baseline_key(corpus_hash: &str, queries_version: &str, settings: &RunSettings) -> String {
    [
        corpus_hash.to_string(),
        queries_version.to_string(),
        settings.embedding.clone(),
        settings.term_impl.clone(),
        format!("chunk_chars={}", settings.chunk_max_chars),
        format!("rrf_k={}", settings.rrf_k),
        format!("weights={}/{}", settings.term_weight, settings.vector_weight),
        format!("rerank={}", settings.rerank as u8),
    ]
    .join("__")
}

#[derive(Serialize)]
struct MetricsFile<'a> {
    run_id: &'a str,
    buckets: &'a [BucketMetrics],
    thresholds: &'a Thresholds,
    failures: &'a [ThresholdFailure],
    passed: bool,
}

/// Write the four artifacts into `dir`, creating it.
pub fn write_artifacts(
    dir: &Path,
    run: &RunRecord,
    report: &EvalReport,
    thresholds: &Thresholds,
    failures: &[ThresholdFailure],
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    std::fs::write(dir.join("run.json"), serde_json::to_string_pretty(run)?)?;
    write_jsonl(&dir.join("results.jsonl"), &report.results)?;
    write_jsonl(&dir.join("traces.jsonl"), &report.traces)?;
    let metrics = MetricsFile {
        run_id: &run.run_id,
        buckets: &report.buckets,
        thresholds,
        failures,
        passed: failures.is_empty(),
    };
    std::fs::write(dir.join("metrics.json"), serde_json::to_string_pretty(&metrics)?)?;
    Ok(())
}

fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for row in rows {
        serde_json::to_writer(&mut file, row)?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

fn print_table(buckets: &[BucketMetrics], ks: &[usize]) {
    println!("Evaluation Results");
    println!("{}", "=".repeat(72));
    let mut current = None;
    for bucket in buckets {
        if current != Some(bucket.config) {
            current = Some(bucket.config);
            println!();
            println!("{}", bucket.config.as_str().to_uppercase());
            let header: String = ks.iter().map(|k| format!("{:>8}", format!("Hit@{}", k))).collect();
            println!("{:<10}{}{:>8}{:>8}", "Difficulty", header, "MRR", "Count");
        }
        let cells: String = ks
            .iter()
            .map(|k| format!("{:>7.1}%", bucket.hit_at.get(k).copied().unwrap_or(0.0) * 100.0))
            .collect();
        println!(
            "{:<10}{}{:>8.3}{:>8}",
            bucket.difficulty.as_str(),
            cells,
            bucket.mrr,
            bucket.count
        );
    }
    println!();
}

/// `corpus eval`. Returns `Ok(false)` when a threshold failed.
pub async fn run_eval(
    config: &Config,
    queries_path: &Path,
    rerank: bool,
    output_dir: Option<PathBuf>,
) -> Result<bool> {
    let golden = load_golden_queries(queries_path)?;
    let pool = db::connect(config).await?;
    let service = sqlite_service(config, &pool, rerank)?;
    let scope = config.source.scope.as_str();

    let store = SqliteStore::new(pool.clone());
    let embedding = match store.get_dataset(scope).await? {
        Some(ds) => ds.identity.to_string(),
        None => "none".to_string(),
    };

    let ks = &config.eval.k_values;
    info!(queries = golden.queries.len(), "evaluating");
    let report = evaluate(
        &service,
        scope,
        &golden.queries,
        ks,
        rerank,
        config.retrieval.candidate_k,
    )
    .await?;
    pool.close().await;

    let thresholds = configured_thresholds(&config.eval.thresholds)?;
    let failures = check_thresholds(&report.buckets, &thresholds);

    let settings = RunSettings {
        embedding,
        term_impl: "sqlite_fts5".to_string(),
        chunk_max_chars: config.chunking.max_chars,
        rrf_k: config.retrieval.rrf_k,
        term_weight: config.retrieval.term_weight,
        vector_weight: config.retrieval.vector_weight,
        rerank: rerank && service.has_reranker(),
        k_values: ks.clone(),
    };
    let corpus_hash = compute_corpus_hash(&config.source)?;
    let mut channels: Vec<String> = report
        .results
        .iter()
        .flat_map(|r| r.channels_used.iter().cloned())
        .collect();
    channels.sort();
    channels.dedup();

    let run = RunRecord {
        run_id: Uuid::new_v4().to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        queries_path: queries_path.display().to_string(),
        queries_version: golden.version.clone(),
        corpus_root: config.source.root.display().to_string(),
        baseline_key: baseline_key(&corpus_hash, &golden.version, &settings),
        corpus_hash,
        settings,
        channels,
    };

    let dir = output_dir
        .unwrap_or_else(|| config.eval.output_dir.clone())
        .join(&run.run_id);
    write_artifacts(&dir, &run, &report, &thresholds, &failures)?;

    print_table(&report.buckets, ks);
    if failures.is_empty() {
        println!("All thresholds passed.");
    } else {
        println!("Threshold failures:");
        for f in &failures {
            println!("  {}", f);
        }
    }
    println!("artifacts: {}", dir.display());
    Ok(failures.is_empty())
}
