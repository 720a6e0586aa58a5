use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{RelevanceScorer, ScorerError};

/// Seeded random scores: a random tie-breaking baseline.
///
/// Each call draws from a fresh generator, so the same seed and group size
/// always give the same order.
#[derive(Debug, Clone)]
pub struct ShuffleScorer {
    seed: u64,
}

impl ShuffleScorer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

#[async_trait::async_trait]
impl RelevanceScorer for ShuffleScorer {
    fn name(&self) -> &str {
        "random"
    }

    async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f64>, ScorerError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        Ok(documents.iter().map(|_| rng.gen_range(0.0..1.0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_seed_same_scores() {
        let docs: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let a = ShuffleScorer::new(3).score("", &docs).await.unwrap();
        let b = ShuffleScorer::new(3).score("", &docs).await.unwrap();
        let c = ShuffleScorer::new(4).score("", &docs).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
