//! Weighted Reciprocal-Rank Fusion and the dynamic score threshold.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Vector,
    Text,
    Both,
}

impl Branch {
    pub fn label(&self) -> &'static str {
        match self {
            Branch::Vector => "vector",
            Branch::Text => "text",
            Branch::Both => "vector+text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusedHit {
    pub id: String,
    pub score: f32,
    pub branch: Branch,
    /// Raw vector-branch similarity, used as the first tie-breaker.
    pub vector_score: f32,
}

/// Weighted RRF: `score = w_v/(k + r_v) + w_t/(k + r_t)`, ranks 1-based; a
/// chunk missing from one list contributes only the other term. Ties break by
/// vector score, then by id.
pub fn weighted_rrf(
    vector_results: &[(String, f32)],
    text_results: &[(String, f32)],
    k: usize,
    vector_weight: f32,
    text_weight: f32,
) -> Vec<FusedHit> {
    let mut fused: HashMap<String, FusedHit> = HashMap::new();

    for (rank, (id, score)) in vector_results.iter().enumerate() {
        let rrf = vector_weight / (k as f32 + rank as f32 + 1.0);
        fused
            .entry(id.clone())
            .and_modify(|hit| {
                hit.score += rrf;
                hit.branch = Branch::Both;
                hit.vector_score = *score;
            })
            .or_insert(FusedHit {
                id: id.clone(),
                score: rrf,
                branch: Branch::Vector,
                vector_score: *score,
            });
    }

    for (rank, (id, _score)) in text_results.iter().enumerate() {
        let rrf = text_weight / (k as f32 + rank as f32 + 1.0);
        fused
            .entry(id.clone())
            .and_modify(|hit| {
                hit.score += rrf;
                hit.branch = Branch::Both;
            })
            .or_insert(FusedHit {
                id: id.clone(),
                score: rrf,
                branch: Branch::Text,
                vector_score: 0.0,
            });
    }

    let mut merged: Vec<FusedHit> = fused.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.vector_score
                    .partial_cmp(&a.vector_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

/// Threshold derived from the score distribution: a relative gap below the
/// top score, clamped to an absolute floor, never above the top score itself
/// (the best hit always survives).
pub fn dynamic_threshold(scores: &[f32], relative_gap: f32, floor: f32) -> f32 {
    let top = scores.iter().copied().fold(f32::MIN, f32::max);
    if !top.is_finite() || scores.is_empty() {
        return floor;
    }
    (top * relative_gap).max(floor).min(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(ids: &[&str]) -> Vec<(String, f32)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), 1.0 - i as f32 * 0.1))
            .collect()
    }

    #[test]
    fn membership_comes_from_at_least_one_branch() {
        let fused = weighted_rrf(&ranked(&["a", "b"]), &ranked(&["b", "c"]), 60, 0.7, 0.3);
        let ids: Vec<&str> = fused.iter().map(|h| h.id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
        assert!(ids.contains(&"c"));

        let b = fused.iter().find(|h| h.id == "b").unwrap();
        assert_eq!(b.branch, Branch::Both);
    }

    #[test]
    fn fused_score_is_monotonic_in_each_branch() {
        // "b" at rank 1 in both lists beats "a" present only in one.
        let fused = weighted_rrf(&ranked(&["b", "a"]), &ranked(&["b"]), 60, 0.7, 0.3);
        let a = fused.iter().find(|h| h.id == "a").unwrap();
        let b = fused.iter().find(|h| h.id == "b").unwrap();
        assert!(b.score > a.score);

        // Improving a chunk's text rank can only raise its fused score.
        let worse = weighted_rrf(&ranked(&["a"]), &ranked(&["x", "y", "a"]), 60, 0.7, 0.3);
        let better = weighted_rrf(&ranked(&["a"]), &ranked(&["a", "x", "y"]), 60, 0.7, 0.3);
        let worse_a = worse.iter().find(|h| h.id == "a").unwrap().score;
        let better_a = better.iter().find(|h| h.id == "a").unwrap().score;
        assert!(better_a > worse_a);
    }

    #[test]
    fn rrf_matches_the_closed_form_with_k_60() {
        let fused = weighted_rrf(&ranked(&["a"]), &ranked(&["a"]), 60, 0.7, 0.3);
        let expected = 0.7 / 61.0 + 0.3 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn ties_break_by_vector_score_then_id() {
        // Same fused score via symmetric construction; vector scores differ.
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.95)];
        let text: Vec<(String, f32)> = vec![];
        let fused = weighted_rrf(&vector, &text, 60, 0.7, 0.3);
        assert_eq!(fused[0].id, "a"); // rank order decides scores here
        let equal_rank_a = weighted_rrf(
            &[("a".to_string(), 0.5)],
            &[("b".to_string(), 9.0)],
            60,
            0.5,
            0.5,
        );
        // Equal fused scores: a (vector_score 0.5) beats b (0.0)
        assert_eq!(equal_rank_a[0].id, "a");
    }

    #[test]
    fn threshold_keeps_the_top_hit_and_respects_the_floor() {
        let scores = [0.9, 0.6, 0.2];
        let threshold = dynamic_threshold(&scores, 0.55, 0.25);
        assert!((threshold - 0.495).abs() < 1e-6);

        // Low-scoring distribution: floor would cut the top; clamp to top.
        let low = [0.2, 0.1];
        let threshold = dynamic_threshold(&low, 0.55, 0.25);
        assert!((threshold - 0.2).abs() < 1e-6);

        assert_eq!(dynamic_threshold(&[], 0.55, 0.25), 0.25);
    }
}
