//! Post-rank stages, applied in fixed order after reranking:
//! semantic dedup, MMR diversity, group-by-file aggregation.

use std::collections::HashMap;
use std::time::Instant;

use crate::embed::cosine;
use crate::fusion::Candidate;
use crate::types::{AggregationInfo, AggregationMeta, DedupMeta, DiversityMeta};

/// How many leading candidates the O(n²) dedup window covers.
pub const DEDUP_WINDOW: usize = 30;

/// Drop candidates whose cosine similarity to an already-kept candidate
/// exceeds `threshold`. Walks in rank order so the highest-ranked duplicate
/// survives. Candidates without a dense vector are kept as-is.
pub fn dedup(candidates: &mut Vec<Candidate>, threshold: f32) -> DedupMeta {
    let started = Instant::now();
    let input_count = candidates.len();
    let window = input_count.min(DEDUP_WINDOW);

    let mut kept: Vec<Vec<f32>> = Vec::new();
    let mut keep_flags = vec![true; input_count];
    for i in 0..window {
        let Some(vec) = candidates[i].dense.as_ref() else { continue };
        let duplicate = kept.iter().any(|k| cosine(k, vec) > threshold);
        if duplicate {
            keep_flags[i] = false;
        } else {
            kept.push(vec.clone());
        }
    }

    let mut idx = 0;
    candidates.retain(|_| {
        let keep = keep_flags[idx];
        idx += 1;
        keep
    });

    DedupMeta {
        input_count,
        output_count: candidates.len(),
        removed: input_count - candidates.len(),
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

/// Maximal Marginal Relevance: reorder the head of the list by
/// `λ·rel − (1−λ)·max_sim(selected)`, with relevance min-max normalized
/// within the candidate set. Candidates without vectors contribute zero
/// similarity and order by relevance alone.
pub fn mmr(candidates: &mut Vec<Candidate>, lambda: f32, top_k: usize) -> DiversityMeta {
    let started = Instant::now();
    let n = candidates.len();
    if n <= 1 {
        return DiversityMeta {
            enabled: true,
            avg_diversity: 1.0,
            latency_ms: started.elapsed().as_millis() as u64,
        };
    }

    let (min, max) = candidates.iter().fold((f32::MAX, f32::MIN), |(lo, hi), c| {
        (lo.min(c.final_score), hi.max(c.final_score))
    });
    let range = (max - min).max(1e-9);
    let rel: Vec<f32> = candidates.iter().map(|c| (c.final_score - min) / range).collect();

    let take = n.min(top_k.max(1));
    let mut remaining: Vec<usize> = (0..n).collect();
    let mut selected: Vec<usize> = Vec::with_capacity(take);
    let mut diversity_sum = 0f32;

    while selected.len() < take && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::MIN;
        let mut best_sim = 0f32;
        for (pos, &i) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .filter_map(|&j| match (&candidates[i].dense, &candidates[j].dense) {
                    (Some(a), Some(b)) => Some(cosine(a, b)),
                    _ => None,
                })
                .fold(0f32, f32::max);
            let score = lambda * rel[i] - (1.0 - lambda) * max_sim;
            if score > best_score {
                best_score = score;
                best_pos = pos;
                best_sim = max_sim;
            }
        }
        diversity_sum += 1.0 - best_sim;
        selected.push(remaining.remove(best_pos));
    }

    // Selected head in MMR order, the tail keeps its relative order.
    let mut reordered = Vec::with_capacity(n);
    for &i in &selected {
        reordered.push(candidates[i].clone());
    }
    for &i in &remaining {
        reordered.push(candidates[i].clone());
    }
    *candidates = reordered;

    DiversityMeta {
        enabled: true,
        avg_diversity: diversity_sum / take.max(1) as f32,
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

/// Bucket candidates by path, keep the top `max_per_file` chunks per file,
/// and flag each file's best chunk as the representative.
pub fn group_by_file(
    candidates: &mut Vec<Candidate>,
    max_per_file: usize,
) -> (AggregationMeta, HashMap<String, AggregationInfo>) {
    let max_per_file = max_per_file.max(1);
    let before = candidates.len();

    let mut per_file_rank: HashMap<String, usize> = HashMap::new();
    let mut file_score: HashMap<String, f32> = HashMap::new();
    let mut kept: Vec<Candidate> = Vec::with_capacity(before);
    for c in candidates.drain(..) {
        let rank = per_file_rank.entry(c.payload.path.clone()).or_insert(0);
        *rank += 1;
        if *rank > max_per_file {
            continue;
        }
        file_score
            .entry(c.payload.path.clone())
            .and_modify(|s| *s = s.max(c.final_score))
            .or_insert(c.final_score);
        kept.push(c);
    }

    let mut kept_per_file: HashMap<String, usize> = HashMap::new();
    for c in &kept {
        *kept_per_file.entry(c.payload.path.clone()).or_insert(0) += 1;
    }

    let mut info = HashMap::new();
    let mut seen_rank: HashMap<String, usize> = HashMap::new();
    for c in &kept {
        let rank = seen_rank.entry(c.payload.path.clone()).or_insert(0);
        *rank += 1;
        info.insert(
            c.id.clone(),
            AggregationInfo {
                is_representative: *rank == 1,
                related_chunks: kept_per_file[&c.payload.path] - 1,
                file_score: file_score[&c.payload.path],
                chunk_rank_in_file: *rank,
            },
        );
    }

    *candidates = kept;
    let meta = AggregationMeta {
        unique_files: kept_per_file.len(),
        chunks_dropped: before - candidates.len(),
    };
    (meta, info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ChunkPayload;
    use std::collections::BTreeMap;

    fn cand(id: &str, path: &str, score: f32, dense: Option<Vec<f32>>) -> Candidate {
        Candidate {
            id: id.to_string(),
            payload: ChunkPayload {
                path: path.to_string(),
                language: "rust".into(),
                start_line: 1,
                end_line: 2,
                text: "t".into(),
                symbols: vec![],
                full_path: path.to_string(),
                filename: path.rsplit('/').next().unwrap_or(path).to_string(),
                content_hash: "h".into(),
            },
            dense,
            snippet: None,
            stage_scores: BTreeMap::new(),
            stage_ranks: BTreeMap::new(),
            fused: score,
            rerank1: None,
            rerank2: None,
            final_score: score,
        }
    }

    #[test]
    fn test_dedup_drops_near_duplicates() {
        let mut cands = vec![
            cand("a", "a.rs", 1.0, Some(vec![1.0, 0.0])),
            cand("b", "b.rs", 0.9, Some(vec![1.0, 0.0])), // identical direction
            cand("c", "c.rs", 0.8, Some(vec![0.0, 1.0])), // orthogonal
        ];
        let meta = dedup(&mut cands, 0.85);
        assert_eq!(meta.input_count, 3);
        assert_eq!(meta.removed, 1);
        let ids: Vec<&str> = cands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_dedup_keeps_highest_ranked_copy() {
        let mut cands = vec![
            cand("top", "a.rs", 1.0, Some(vec![1.0, 0.0])),
            cand("dup", "b.rs", 0.5, Some(vec![0.999, 0.001])),
        ];
        dedup(&mut cands, 0.85);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].id, "top");
    }

    #[test]
    fn test_dedup_without_vectors_is_noop() {
        let mut cands = vec![cand("a", "a.rs", 1.0, None), cand("b", "b.rs", 0.9, None)];
        let meta = dedup(&mut cands, 0.85);
        assert_eq!(meta.removed, 0);
        assert_eq!(cands.len(), 2);
    }

    #[test]
    fn test_mmr_prefers_diverse_runner_up() {
        // b is nearly identical to a; c is orthogonal with a slightly lower
        // score. MMR should pick a, then c.
        let mut cands = vec![
            cand("a", "a.rs", 1.0, Some(vec![1.0, 0.0])),
            cand("b", "b.rs", 0.92, Some(vec![0.999, 0.04])),
            cand("c", "c.rs", 0.98, Some(vec![0.0, 1.0])),
        ];
        let meta = mmr(&mut cands, 0.7, 3);
        let ids: Vec<&str> = cands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids[0], "a");
        assert_eq!(ids[1], "c");
        assert!(meta.avg_diversity > 0.0);
    }

    #[test]
    fn test_mmr_single_candidate() {
        let mut cands = vec![cand("a", "a.rs", 1.0, None)];
        let meta = mmr(&mut cands, 0.7, 10);
        assert_eq!(cands.len(), 1);
        assert_eq!(meta.avg_diversity, 1.0);
    }

    #[test]
    fn test_group_by_file_caps_and_flags() {
        let mut cands = vec![
            cand("a1", "a.rs", 1.0, None),
            cand("a2", "a.rs", 0.9, None),
            cand("a3", "a.rs", 0.8, None),
            cand("a4", "a.rs", 0.7, None),
            cand("b1", "b.rs", 0.6, None),
        ];
        let (meta, info) = group_by_file(&mut cands, 3);
        assert_eq!(meta.unique_files, 2);
        assert_eq!(meta.chunks_dropped, 1);
        assert_eq!(cands.len(), 4);

        let a1 = &info["a1"];
        assert!(a1.is_representative);
        assert_eq!(a1.related_chunks, 2);
        assert_eq!(a1.chunk_rank_in_file, 1);
        assert_eq!(a1.file_score, 1.0);

        let a3 = &info["a3"];
        assert!(!a3.is_representative);
        assert_eq!(a3.chunk_rank_in_file, 3);

        let b1 = &info["b1"];
        assert!(b1.is_representative);
        assert_eq!(b1.related_chunks, 0);
    }
}
