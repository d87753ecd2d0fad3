//! Weighted Reciprocal Rank Fusion.
//!
//! A hit at 1-based rank `r` in channel `i` contributes `w_i / (k + r)`.
//! Contributions are summed per `(source_key, chunk_id)`; a channel that did
//! not return a unit contributes nothing. Raw channel scores never enter the
//! fused score, only rank positions do, so the BM25 and cosine scales need no
//! calibration against each other.
//!
//! Output order is fused score descending, then chunk id ascending, then
//! source key ascending, so equal inputs always produce equal orderings.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{Candidate, ChannelHit};

/// One channel's ranked answer and its fusion weight.
#[derive(Debug, Clone)]
pub struct ChannelRanking {
    pub channel: String,
    pub weight: f64,
    pub hits: Vec<ChannelHit>,
}

impl ChannelRanking {
    pub fn new(channel: impl Into<String>, weight: f64, hits: Vec<ChannelHit>) -> Self {
        Self {
            channel: channel.into(),
            weight,
            hits,
        }
    }
}

/// Component key for a channel's RRF contribution.
pub fn rrf_component(channel: &str) -> String {
    format!("rrf:{}", channel)
}

/// Fuse ranked lists into at most `top_n` candidates, best first.
pub fn fuse(rankings: &[ChannelRanking], k: f64, top_n: usize) -> Vec<Candidate> {
    let mut by_key: HashMap<(String, String), Candidate> = HashMap::new();

    for ranking in rankings {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut rank = 0usize;
        for hit in &ranking.hits {
            // Repeated units inside one list only count at their best rank.
            if !seen.insert((hit.source_key.as_str(), hit.chunk_id.as_str())) {
                continue;
            }
            rank += 1;
            let contribution = ranking.weight / (k + rank as f64);

            let candidate = by_key
                .entry((hit.source_key.clone(), hit.chunk_id.clone()))
                .or_insert_with(|| Candidate {
                    chunk_id: hit.chunk_id.clone(),
                    source_key: hit.source_key.clone(),
                    text: hit.text.clone(),
                    score: 0.0,
                    fused_score: 0.0,
                    channel_scores: BTreeMap::new(),
                    components: BTreeMap::new(),
                });
            candidate.fused_score += contribution;
            candidate
                .channel_scores
                .insert(ranking.channel.clone(), hit.score);
            candidate
                .components
                .insert(rrf_component(&ranking.channel), contribution);
        }
    }

    let mut fused: Vec<Candidate> = by_key
        .into_values()
        .map(|mut c| {
            c.score = c.fused_score;
            c
        })
        .collect();
    sort_candidates(&mut fused);
    fused.truncate(top_n);
    fused
}

/// Sort by `score` descending with the deterministic tie-break.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
            .then_with(|| a.source_key.cmp(&b.source_key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, key: &str, score: f64) -> ChannelHit {
        ChannelHit {
            chunk_id: id.to_string(),
            source_key: key.to_string(),
            score,
            text: String::new(),
        }
    }

    #[test]
    fn test_single_hit_scores_one_over_k_plus_one() {
        let fused = fuse(
            &[ChannelRanking::new("term", 1.0, vec![hit("a:0", "s:a", 3.0)])],
            60.0,
            10,
        );
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[0].channel_scores["term"], 3.0);
        assert!((fused[0].components["rrf:term"] - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_present_in_both_beats_present_in_one_at_same_rank() {
        let term = vec![hit("both:0", "s:both", 9.0), hit("x:0", "s:x", 1.0)];
        let vector = vec![hit("y:0", "s:y", 0.9), hit("both:0", "s:both", 0.5)];
        let fused = fuse(
            &[
                ChannelRanking::new("term", 1.0, term),
                ChannelRanking::new("vector", 1.0, vector),
            ],
            60.0,
            10,
        );
        assert_eq!(fused[0].chunk_id, "both:0");
        // y:0 is rank 1 in one channel only; both:0 is rank 1 + rank 2.
        let y = fused.iter().find(|c| c.chunk_id == "y:0").unwrap();
        assert!(fused[0].score >= y.score);
        for pair in fused.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_weights_scale_contributions() {
        let fused = fuse(
            &[
                ChannelRanking::new("term", 0.5, vec![hit("a:0", "s:a", 1.0)]),
                ChannelRanking::new("vector", 2.0, vec![hit("b:0", "s:b", 1.0)]),
            ],
            60.0,
            10,
        );
        assert_eq!(fused[0].chunk_id, "b:0");
        assert!((fused[0].score - 2.0 / 61.0).abs() < 1e-12);
        assert!((fused[1].score - 0.5 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_ties_break_on_chunk_id_then_source_key() {
        let fused = fuse(
            &[
                ChannelRanking::new("term", 1.0, vec![hit("b:0", "s:z", 1.0)]),
                ChannelRanking::new("vector", 1.0, vec![hit("a:0", "s:y", 1.0)]),
                ChannelRanking::new("extra", 1.0, vec![hit("a:0", "s:x", 1.0)]),
            ],
            60.0,
            10,
        );
        let order: Vec<(&str, &str)> = fused
            .iter()
            .map(|c| (c.chunk_id.as_str(), c.source_key.as_str()))
            .collect();
        assert_eq!(order, vec![("a:0", "s:x"), ("a:0", "s:y"), ("b:0", "s:z")]);
    }

    #[test]
    fn test_same_chunk_id_in_two_documents_stays_distinct() {
        let fused = fuse(
            &[ChannelRanking::new(
                "term",
                1.0,
                vec![hit("h:0", "s:a.md", 2.0), hit("h:0", "s:b.md", 1.0)],
            )],
            60.0,
            10,
        );
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_truncates_to_top_n_and_handles_empty() {
        let hits: Vec<ChannelHit> = (0..5).map(|i| hit(&format!("c:{}", i), "s:a", 1.0)).collect();
        assert_eq!(fuse(&[ChannelRanking::new("term", 1.0, hits)], 60.0, 3).len(), 3);
        assert!(fuse(&[], 60.0, 3).is_empty());
    }

    #[test]
    fn test_duplicate_in_one_list_counts_once() {
        let fused = fuse(
            &[ChannelRanking::new(
                "term",
                1.0,
                vec![hit("a:0", "s:a", 2.0), hit("a:0", "s:a", 1.0)],
            )],
            60.0,
            10,
        );
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }
}
