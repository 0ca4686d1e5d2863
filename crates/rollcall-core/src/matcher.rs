use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{FeatureVector, MatchResult};

/// Distance used to turn a vector pair into `similarity = 1 - distance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// L2 distance; suits embeddings trained with a ~0.6 match radius.
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`.
    Cosine,
}

impl DistanceMetric {
    /// Distance between two equal-length vectors. Callers guarantee the length.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a * norm_b)
            }
        }
    }

    /// `1 - distance`, clamped to `[0, 1]`.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        (1.0 - self.distance(a, b)).clamp(0.0, 1.0)
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric '{other}'")),
        }
    }
}

/// Linear nearest-neighbor scan over every stored vector of every subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighbor {
    pub metric: DistanceMetric,
}

impl NearestNeighbor {
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric }
    }

    /// Best subject for `query`. Vectors whose length differs from the query
    /// are skipped; the caller is expected to have checked dimensions. Equal
    /// similarities go to the lexicographically smaller subject id.
    pub fn best_match(
        &self,
        query: &FeatureVector,
        records: &HashMap<String, Vec<FeatureVector>>,
        threshold: f32,
    ) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;

        for (subject_id, vectors) in records {
            for candidate in vectors {
                if candidate.dim() != query.dim() {
                    continue;
                }
                let similarity = self.metric.similarity(&query.values, &candidate.values);
                let is_better = match best {
                    None => true,
                    Some((prev_id, prev)) => {
                        similarity > prev || (similarity == prev && subject_id.as_str() < prev_id)
                    }
                };
                if is_better {
                    best = Some((subject_id.as_str(), similarity));
                }
            }
        }

        match best {
            Some((subject_id, similarity)) if similarity >= threshold => MatchResult {
                matched: true,
                subject_id: Some(subject_id.to_string()),
                similarity,
                region: None,
            },
            Some((_, similarity)) => MatchResult::no_match(similarity),
            None => MatchResult::no_match(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> HashMap<String, Vec<FeatureVector>> {
        let mut map = HashMap::new();
        map.insert(
            "s001".to_string(),
            vec![
                FeatureVector::new(vec![0.0, 0.0, 1.0]),
                FeatureVector::new(vec![0.0, 0.1, 0.9]),
            ],
        );
        map.insert("s002".to_string(), vec![FeatureVector::new(vec![1.0, 0.0, 0.0])]);
        map
    }

    #[test]
    fn test_exact_vector_matches_with_similarity_one() {
        let nn = NearestNeighbor::default();
        let result = nn.best_match(&FeatureVector::new(vec![1.0, 0.0, 0.0]), &records(), 0.6);
        assert!(result.matched);
        assert_eq!(result.subject_id.as_deref(), Some("s002"));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_reports_best_similarity() {
        let nn = NearestNeighbor::default();
        // Distance to s002 is 0.5 → similarity 0.5
        let result = nn.best_match(&FeatureVector::new(vec![0.5, 0.0, 0.0]), &records(), 0.6);
        assert!(!result.matched);
        assert!(result.subject_id.is_none());
        assert!((result.similarity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let nn = NearestNeighbor::default();
        let result = nn.best_match(&FeatureVector::new(vec![0.5, 0.0, 0.0]), &records(), 0.5);
        assert!(result.matched);
    }

    #[test]
    fn test_empty_records_no_match() {
        let nn = NearestNeighbor::default();
        let result = nn.best_match(&FeatureVector::new(vec![1.0]), &HashMap::new(), 0.1);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_equal_similarity_prefers_smaller_subject_id() {
        let nn = NearestNeighbor::default();
        // Each map gets its own hasher seed, so iteration order varies.
        for _ in 0..8 {
            let mut map = HashMap::new();
            for id in ["s009", "s003", "s007", "s005"] {
                map.insert(id.to_string(), vec![FeatureVector::new(vec![0.2, 0.4, 0.6])]);
            }
            let result = nn.best_match(&FeatureVector::new(vec![0.2, 0.4, 0.6]), &map, 0.6);
            assert_eq!(result.subject_id.as_deref(), Some("s003"));
        }
    }

    #[test]
    fn test_far_vectors_clamp_to_zero() {
        let metric = DistanceMetric::Euclidean;
        assert_eq!(metric.similarity(&[0.0, 0.0], &[3.0, 4.0]), 0.0);
    }

    #[test]
    fn test_cosine_metric() {
        let metric = DistanceMetric::Cosine;
        assert!((metric.similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(metric.similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(metric.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("L2".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!("cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
