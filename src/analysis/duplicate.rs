use rayon::prelude::*;

use super::similarity::match_score;
use crate::types::{BugRecord, DuplicateMatch, EmbeddingVector};

/// Default similarity at or above which a submission counts as a duplicate
pub const DEFAULT_DUPLICATE_THRESHOLD: f32 = 0.85;

/// Flags a new bug as a near-duplicate of a stored one
#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    threshold: f32,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_THRESHOLD)
    }
}

impl DuplicateDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Compare an embedded candidate against the corpus.
    ///
    /// Scores are computed in parallel; the best is picked in corpus order so
    /// the earliest stored bug wins a tie.
    pub fn find_duplicate(
        &self,
        candidate: &EmbeddingVector,
        corpus: &[(BugRecord, EmbeddingVector)],
    ) -> Option<DuplicateMatch> {
        let scores: Vec<f32> = corpus
            .par_iter()
            .map(|(_, vector)| match_score(candidate.as_slice(), vector.as_slice()))
            .collect();

        let mut best: Option<(usize, f32)> = None;
        for (i, &score) in scores.iter().enumerate() {
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }

        let (idx, similarity) = best?;
        tracing::debug!(
            "Closest stored bug {} at {:.4}",
            corpus[idx].0.id,
            similarity
        );
        (similarity >= self.threshold).then(|| DuplicateMatch {
            bug_id: corpus[idx].0.id.clone(),
            similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Row, EMBEDDING_DIM};
    use serde_json::json;

    fn bug(id: &str) -> BugRecord {
        let row: Row = json!({"id": id, "title": id}).as_object().cloned().unwrap();
        BugRecord::from_row(row).unwrap()
    }

    /// Unit vector with weight split between two axes
    fn vector(primary: usize, secondary: usize, mix: f32) -> EmbeddingVector {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[primary] = (1.0 - mix * mix).sqrt();
        v[secondary] += mix;
        EmbeddingVector::new(v).unwrap()
    }

    #[test]
    fn test_empty_corpus() {
        let detector = DuplicateDetector::default();
        assert!(detector.find_duplicate(&vector(0, 1, 0.0), &[]).is_none());
    }

    #[test]
    fn test_detects_above_threshold() {
        let detector = DuplicateDetector::default();
        let corpus = vec![(bug("FF-a"), vector(5, 6, 0.0)), (bug("FF-b"), vector(0, 1, 0.3))];
        let found = detector.find_duplicate(&vector(0, 1, 0.0), &corpus).unwrap();
        assert_eq!(found.bug_id, "FF-b");
        assert!(found.similarity > 0.9);
    }

    #[test]
    fn test_below_threshold_is_novel() {
        let detector = DuplicateDetector::default();
        // cos = sqrt(1 - 0.6^2) = 0.8
        let corpus = vec![(bug("FF-a"), vector(0, 1, 0.6))];
        assert!(detector.find_duplicate(&vector(0, 1, 0.0), &corpus).is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let detector = DuplicateDetector::new(1.0);
        let corpus = vec![(bug("FF-a"), vector(0, 1, 0.0))];
        assert!(detector.find_duplicate(&vector(0, 1, 0.0), &corpus).is_some());
    }

    #[test]
    fn test_tie_goes_to_first_stored() {
        let detector = DuplicateDetector::default();
        let corpus = vec![
            (bug("FF-first"), vector(0, 1, 0.0)),
            (bug("FF-second"), vector(0, 1, 0.0)),
        ];
        let found = detector.find_duplicate(&vector(0, 1, 0.0), &corpus).unwrap();
        assert_eq!(found.bug_id, "FF-first");
    }
}
