use crate::models::{FusionStrategy, RetrievalSignal, RetrievedChunk};
use std::collections::HashMap;

/// One ranked list and the weight its contributions carry.
pub struct WeightedList<'a> {
    pub hits: &'a [RetrievedChunk],
    pub weight: f64,
}

struct FusedEntry {
    hit: RetrievedChunk,
    total: f64,
    signals: Vec<RetrievalSignal>,
}

/// Union of all lists, re-scored per list and summed by weight. The sort is
/// stable, so ties keep first-seen order (earlier lists first).
pub fn fuse(
    lists: &[WeightedList<'_>],
    strategy: FusionStrategy,
    rrf_k: f64,
) -> Vec<RetrievedChunk> {
    let mut entries: Vec<FusedEntry> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for list in lists {
        let contributions = match strategy {
            FusionStrategy::ReciprocalRank => reciprocal_rank(list.hits, rrf_k),
            FusionStrategy::WeightedScore => min_max(list.hits),
        };

        for (hit, contribution) in list.hits.iter().zip(contributions) {
            let position = *positions
                .entry(hit.chunk.chunk_id.clone())
                .or_insert_with(|| {
                    entries.push(FusedEntry {
                        hit: hit.clone(),
                        total: 0.0,
                        signals: Vec::new(),
                    });
                    entries.len() - 1
                });

            let entry = &mut entries[position];
            entry.total += list.weight * contribution;
            if !entry.signals.contains(&hit.signal) {
                entry.signals.push(hit.signal);
            }
        }
    }

    let mut fused: Vec<RetrievedChunk> = entries
        .into_iter()
        .map(|entry| RetrievedChunk {
            signal: match entry.signals.as_slice() {
                [single] => *single,
                _ => RetrievalSignal::Fused,
            },
            score: entry.total,
            chunk: entry.hit.chunk,
        })
        .collect();

    fused.sort_by(|left, right| right.score.total_cmp(&left.score));
    fused
}

fn reciprocal_rank(hits: &[RetrievedChunk], rrf_k: f64) -> Vec<f64> {
    (0..hits.len())
        .map(|position| 1.0 / (rrf_k + position as f64 + 1.0))
        .collect()
}

fn min_max(hits: &[RetrievedChunk]) -> Vec<f64> {
    let (low, high) = hits.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), hit| {
        (low.min(hit.score), high.max(hit.score))
    });
    let span = high - low;

    hits.iter()
        .map(|hit| if span > 0.0 { (hit.score - low) / span } else { 1.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::local::tests::chunk;

    fn hits(ids: &[&str], signal: RetrievalSignal) -> Vec<RetrievedChunk> {
        ids.iter()
            .enumerate()
            .map(|(position, id)| RetrievedChunk {
                chunk: chunk(id, "text"),
                score: 10.0 - position as f64,
                signal,
            })
            .collect()
    }

    fn half(hits: &[RetrievedChunk]) -> WeightedList<'_> {
        WeightedList { hits, weight: 0.5 }
    }

    fn score_of(fused: &[RetrievedChunk], id: &str) -> f64 {
        fused
            .iter()
            .find(|hit| hit.chunk.chunk_id == id)
            .map(|hit| hit.score)
            .unwrap_or(0.0)
    }

    #[test]
    fn shared_document_accumulates_both_contributions() {
        let sparse = hits(&["a", "b", "c"], RetrievalSignal::Sparse);
        let dense = hits(&["d", "e", "a"], RetrievalSignal::Dense);

        let fused = fuse(
            &[half(&sparse), half(&dense)],
            FusionStrategy::ReciprocalRank,
            60.0,
        );

        assert_eq!(fused.len(), 5);
        assert_eq!(fused[0].chunk.chunk_id, "a");
        assert_eq!(fused[0].signal, RetrievalSignal::Fused);
        let expected = 0.5 / 61.0 + 0.5 / 63.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn presence_in_both_lists_never_lowers_rank() {
        let sparse = hits(&["x", "shared", "y"], RetrievalSignal::Sparse);
        let dense = hits(&["z", "w", "shared"], RetrievalSignal::Dense);

        for strategy in [FusionStrategy::ReciprocalRank, FusionStrategy::WeightedScore] {
            let both = fuse(&[half(&sparse), half(&dense)], strategy, 60.0);
            let only_sparse = fuse(&[half(&sparse)], strategy, 60.0);
            let only_dense = fuse(&[half(&dense)], strategy, 60.0);

            assert!(score_of(&both, "shared") >= score_of(&only_sparse, "shared"));
            assert!(score_of(&both, "shared") >= score_of(&only_dense, "shared"));
        }
    }

    #[test]
    fn ties_prefer_the_sparse_list() {
        let sparse = hits(&["s"], RetrievalSignal::Sparse);
        let dense = hits(&["d"], RetrievalSignal::Dense);

        let fused = fuse(
            &[half(&sparse), half(&dense)],
            FusionStrategy::ReciprocalRank,
            60.0,
        );

        assert_eq!(fused[0].chunk.chunk_id, "s");
        assert_eq!(fused[0].signal, RetrievalSignal::Sparse);
        assert_eq!(fused[1].chunk.chunk_id, "d");
        assert_eq!(fused[1].signal, RetrievalSignal::Dense);
    }

    #[test]
    fn weighted_score_normalizes_each_list() {
        let sparse = hits(&["a", "b"], RetrievalSignal::Sparse);
        let fused = fuse(&[half(&sparse)], FusionStrategy::WeightedScore, 60.0);
        assert!((score_of(&fused, "a") - 0.5).abs() < 1e-12);
        assert_eq!(score_of(&fused, "b"), 0.0);
    }
}
