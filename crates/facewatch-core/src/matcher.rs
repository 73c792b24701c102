//! Scoring a probe embedding against a registry generation.

use crate::registry::Registry;
use crate::types::{Embedding, MatchResult, MatchResults};

/// Pairwise embedding comparison. Higher = more similar; no fixed range.
pub trait Similarity: Send + Sync {
    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32;
}

/// Cosine similarity, the comparison ArcFace embeddings are trained for.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl Similarity for CosineSimilarity {
    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.cosine_similarity(b)
    }
}

/// Score `probe` against every stored embedding and pick the best match.
///
/// One score per stored embedding, in registry order. The best match starts
/// as `("Unknown", 0.0)` and is replaced only by a score strictly above both
/// the current best and `threshold`, so the first maximal score wins ties.
pub fn find_best_match(
    registry: &Registry,
    probe: &Embedding,
    threshold: f32,
    similarity: &dyn Similarity,
) -> MatchResults {
    let mut best = MatchResult::unknown();
    let mut results = Vec::with_capacity(registry.embedding_count());

    for identity in registry {
        for stored in &identity.embeddings {
            let score = similarity.similarity(probe, stored);
            tracing::trace!(identity = %identity.name, score, "scored");
            if score > best.score && score > threshold {
                best = MatchResult::new(identity.name.as_str(), score);
            }
            results.push(MatchResult::new(identity.name.as_str(), score));
        }
    }

    MatchResults { results, best }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores by the first component of the stored embedding.
    struct TableSimilarity;

    impl Similarity for TableSimilarity {
        fn similarity(&self, _probe: &Embedding, stored: &Embedding) -> f32 {
            stored.values[0]
        }
    }

    fn e(score: f32) -> Embedding {
        Embedding::new(vec![score])
    }

    fn alice_bob() -> Registry {
        Registry::from_identities(vec![("alice", vec![e(0.8)]), ("bob", vec![e(0.5), e(0.9)])])
    }

    #[test]
    fn test_best_match_above_threshold() {
        let results = find_best_match(&alice_bob(), &e(0.0), 0.6, &TableSimilarity);
        assert_eq!(results.best, MatchResult::new("bob", 0.9));
        assert_eq!(results.results.len(), 3);
        assert_eq!(results.results[0], MatchResult::new("alice", 0.8));
        assert_eq!(results.results[2], MatchResult::new("bob", 0.9));
    }

    #[test]
    fn test_nothing_clears_threshold() {
        let results = find_best_match(&alice_bob(), &e(0.0), 0.95, &TableSimilarity);
        assert_eq!(results.best, MatchResult::unknown());
        assert_eq!(results.results.len(), 3);
    }

    #[test]
    fn test_score_equal_to_threshold_does_not_match() {
        let registry = Registry::from_identities(vec![("alice", vec![e(0.6)])]);
        let results = find_best_match(&registry, &e(0.0), 0.6, &TableSimilarity);
        assert!(results.best.is_unknown());
    }

    #[test]
    fn test_tie_goes_to_first_identity() {
        let registry = Registry::from_identities(vec![
            ("alice", vec![e(0.7)]),
            ("bob", vec![e(0.9)]),
            ("carol", vec![e(0.9)]),
        ]);
        let results = find_best_match(&registry, &e(0.0), 0.5, &TableSimilarity);
        assert_eq!(results.best.name, "bob");
    }

    #[test]
    fn test_negative_threshold_still_needs_positive_score() {
        // The running best starts at 0.0, so a negative score never wins.
        let registry = Registry::from_identities(vec![("alice", vec![e(-0.2)])]);
        let results = find_best_match(&registry, &e(0.0), -1.0, &TableSimilarity);
        assert!(results.best.is_unknown());
    }

    #[test]
    fn test_empty_registry() {
        let results = find_best_match(&Registry::default(), &e(1.0), 0.3, &CosineSimilarity);
        assert!(results.results.is_empty());
        assert!(results.best.is_unknown());
    }

    #[test]
    fn test_cosine_match() {
        let registry = Registry::from_identities(vec![
            ("decoy", vec![Embedding::new(vec![0.0, 1.0, 0.0])]),
            ("match", vec![Embedding::new(vec![1.0, 0.1, 0.0])]),
        ]);
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let results = find_best_match(&registry, &probe, 0.4, &CosineSimilarity);
        assert_eq!(results.best.name, "match");
        assert!(results.best.score > 0.99);
    }
}
