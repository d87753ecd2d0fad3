//! hit@k, MRR, per-bucket aggregation and threshold checks.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use serde::Serialize;

use super::golden::{Difficulty, RetrieverType};
use crate::models::Candidate;

/// Outcome of one (query, configuration) pair.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub difficulty: Difficulty,
    pub config: RetrieverType,
    pub expected_docs: Vec<String>,
    pub hits: BTreeMap<usize, bool>,
    pub reciprocal_rank: f64,
    /// Distinct document paths in rank order.
    pub retrieved_docs: Vec<String>,
    pub scores: Vec<f64>,
    pub channels_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Distinct paths of `candidates` in order, each with its best score.
pub fn ranked_documents(candidates: &[Candidate]) -> (Vec<String>, Vec<f64>) {
    let mut paths: Vec<String> = Vec::new();
    let mut scores = Vec::new();
    for c in candidates {
        if !paths.iter().any(|p| p == c.path()) {
            paths.push(c.path().to_string());
            scores.push(c.score);
        }
    }
    (paths, scores)
}

/// For each `k`: does any expected doc appear in the top `k`?
pub fn hits_at(retrieved: &[String], expected: &[String], ks: &[usize]) -> BTreeMap<usize, bool> {
    ks.iter()
        .map(|&k| {
            let hit = retrieved
                .iter()
                .take(k)
                .any(|doc| expected.iter().any(|e| e == doc));
            (k, hit)
        })
        .collect()
}

/// `1 / rank` of the first expected doc within `cutoff`, else `0.0`.
pub fn reciprocal_rank(retrieved: &[String], expected: &[String], cutoff: usize) -> f64 {
    retrieved
        .iter()
        .take(cutoff)
        .position(|doc| expected.iter().any(|e| e == doc))
        .map(|i| 1.0 / (i + 1) as f64)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketMetrics {
    pub config: RetrieverType,
    pub difficulty: Difficulty,
    pub count: usize,
    /// Mean hit rate keyed by `k`.
    pub hit_at: BTreeMap<usize, f64>,
    pub mrr: f64,
}

/// Mean hit@k and MRR per (configuration, difficulty), sorted by key.
pub fn aggregate(results: &[QueryResult], ks: &[usize]) -> Vec<BucketMetrics> {
    let mut groups: BTreeMap<(RetrieverType, Difficulty), Vec<&QueryResult>> = BTreeMap::new();
    for r in results {
        groups.entry((r.config, r.difficulty)).or_default().push(r);
    }

    groups
        .into_iter()
        .map(|((config, difficulty), group)| {
            let n = group.len() as f64;
            let hit_at = ks
                .iter()
                .map(|&k| {
                    let hits = group
                        .iter()
                        .filter(|r| r.hits.get(&k).copied().unwrap_or(false))
                        .count();
                    (k, hits as f64 / n)
                })
                .collect();
            BucketMetrics {
                config,
                difficulty,
                count: group.len(),
                hit_at,
                mrr: group.iter().map(|r| r.reciprocal_rank).sum::<f64>() / n,
            }
        })
        .collect()
}

/// Minimum hit@k rates keyed by (configuration, difficulty).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Thresholds {
    pub buckets: BTreeMap<String, BTreeMap<usize, f64>>,
}

fn bucket_key(config: RetrieverType, difficulty: Difficulty) -> String {
    format!("{}/{}", config, difficulty)
}

impl Thresholds {
    pub fn set(&mut self, config: RetrieverType, difficulty: Difficulty, at: [(usize, f64); 4]) {
        self.buckets
            .insert(bucket_key(config, difficulty), at.into_iter().collect());
    }

    pub fn get(&self, config: RetrieverType, difficulty: Difficulty) -> Option<&BTreeMap<usize, f64>> {
        self.buckets.get(&bucket_key(config, difficulty))
    }

    /// Layer `[eval.thresholds]` entries over these limits. Keys are
    /// `"<config>/<difficulty>"`, with `*` for every difficulty; values map
    /// `hit_at_<k>` to a minimum rate in `[0, 1]`.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, BTreeMap<String, f64>>) -> Result<()> {
        for (bucket, limits) in overrides {
            let Some((config, difficulty)) = bucket.split_once('/') else {
                bail!("eval.thresholds key '{}' must be <config>/<difficulty>", bucket);
            };
            let Some(config) = RetrieverType::parse(config) else {
                bail!("eval.thresholds key '{}': unknown configuration '{}'", bucket, config);
            };
            let difficulties: Vec<Difficulty> = match difficulty {
                "*" => Difficulty::ALL.to_vec(),
                d => match Difficulty::parse(d) {
                    Some(d) => vec![d],
                    None => bail!("eval.thresholds key '{}': unknown difficulty '{}'", bucket, d),
                },
            };

            let mut parsed = Vec::with_capacity(limits.len());
            for (name, &rate) in limits {
                let k = name
                    .strip_prefix("hit_at_")
                    .and_then(|k| k.parse::<usize>().ok())
                    .filter(|&k| k > 0);
                let Some(k) = k else {
                    bail!("eval.thresholds.\"{}\": '{}' is not hit_at_<k>", bucket, name);
                };
                if !(0.0..=1.0).contains(&rate) {
                    bail!("eval.thresholds.\"{}\".{} must be in [0.0, 1.0]", bucket, name);
                }
                parsed.push((k, rate));
            }

            for difficulty in difficulties {
                let entry = self.buckets.entry(bucket_key(config, difficulty)).or_default();
                entry.extend(parsed.iter().copied());
            }
        }
        Ok(())
    }
}

/// Defaults with the configured overrides applied.
pub fn configured_thresholds(overrides: &BTreeMap<String, BTreeMap<String, f64>>) -> Result<Thresholds> {
    let mut thresholds = default_thresholds();
    thresholds.apply_overrides(overrides)?;
    Ok(thresholds)
}

/// Baseline gate for hit@1/3/5/10. Fused-plus-rerank is held to the fused
/// baseline.
pub fn default_thresholds() -> Thresholds {
    use Difficulty::*;
    use RetrieverType::*;

    let table: [(RetrieverType, Difficulty, [f64; 4]); 12] = [
        (Bm25, Easy, [0.70, 0.80, 0.85, 0.90]),
        (Bm25, Medium, [0.50, 0.65, 0.75, 0.85]),
        (Bm25, Hard, [0.30, 0.45, 0.55, 0.70]),
        (Bm25, Fusion, [0.40, 0.55, 0.65, 0.75]),
        (Vector, Easy, [0.50, 0.60, 0.70, 0.80]),
        (Vector, Medium, [0.40, 0.55, 0.65, 0.75]),
        (Vector, Hard, [0.25, 0.40, 0.50, 0.65]),
        (Vector, Fusion, [0.35, 0.50, 0.60, 0.70]),
        (Hybrid, Easy, [0.75, 0.85, 0.90, 0.95]),
        (Hybrid, Medium, [0.55, 0.70, 0.80, 0.90]),
        (Hybrid, Hard, [0.35, 0.50, 0.60, 0.75]),
        (Hybrid, Fusion, [0.45, 0.60, 0.70, 0.80]),
    ];

    let mut thresholds = Thresholds::default();
    for (config, difficulty, [h1, h3, h5, h10]) in table {
        let at = [(1, h1), (3, h3), (5, h5), (10, h10)];
        thresholds.set(config, difficulty, at);
        if config == Hybrid {
            thresholds.set(HybridRerank, difficulty, at);
        }
    }
    thresholds
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdFailure {
    pub config: RetrieverType,
    pub difficulty: Difficulty,
    pub k: usize,
    pub actual: f64,
    pub threshold: f64,
}

impl fmt::Display for ThresholdFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/hit_at_{}: {:.1}% < {:.1}%",
            self.config,
            self.difficulty,
            self.k,
            self.actual * 100.0,
            self.threshold * 100.0
        )
    }
}

/// Every bucket metric below its threshold. Buckets or cutoffs without a
/// threshold pass.
pub fn check_thresholds(buckets: &[BucketMetrics], thresholds: &Thresholds) -> Vec<ThresholdFailure> {
    let mut failures = Vec::new();
    for bucket in buckets {
        let Some(limits) = thresholds.get(bucket.config, bucket.difficulty) else {
            continue;
        };
        for (&k, &threshold) in limits {
            if let Some(&actual) = bucket.hit_at.get(&k) {
                if actual < threshold {
                    failures.push(ThresholdFailure {
                        config: bucket.config,
                        difficulty: bucket.difficulty,
                        k,
                        actual,
                        threshold,
                    });
                }
            }
        }
    }
    failures
}
