//! Decode → validate → score → shape, for one sequence batch.
//!
//! Sequences that fail to decode are reported as invalid and never reach the
//! environment. The environment is called at most once per batch, on the
//! decodable rows only, and its output is merged back into batch order.

use tracing::{debug, warn};

use crate::env::{Environment, ScoredBatch};
use crate::error::{Result, TrainError};
use crate::sequence::{SequenceBatch, Vocabulary};

use super::reward::RewardShaper;

/// Environment output for a batch, aligned with its rows.
#[derive(Debug, Clone, Default)]
pub struct BatchScores {
    /// Decoded molecule per row; `None` when decoding failed.
    pub molecules: Vec<Option<String>>,
    pub scored: ScoredBatch,
}

impl BatchScores {
    pub fn len(&self) -> usize {
        self.molecules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.molecules.is_empty()
    }
}

/// Scores sequence batches against an environment and shapes the result.
pub struct RewardOracle<'a, V: ?Sized, E> {
    vocabulary: &'a V,
    environment: &'a E,
    shaper: RewardShaper,
}

impl<'a, V, E> RewardOracle<'a, V, E>
where
    V: Vocabulary + ?Sized,
    E: Environment,
{
    pub fn new(vocabulary: &'a V, environment: &'a E, shaper: RewardShaper) -> Self {
        Self {
            vocabulary,
            environment,
            shaper,
        }
    }

    pub fn shaper(&self) -> &RewardShaper {
        &self.shaper
    }

    /// Decode and score every row of `batch`.
    ///
    /// # Errors
    ///
    /// [`TrainError::Scoring`] when the environment fails or returns the wrong
    /// number of scores; nothing is salvaged from a partially scored batch.
    pub async fn evaluate(&self, batch: &SequenceBatch) -> Result<BatchScores> {
        let molecules: Vec<Option<String>> = batch
            .rows()
            .iter()
            .map(|row| match self.vocabulary.decode(row) {
                Ok(smiles) => Some(smiles),
                Err(e) => {
                    warn!(error = %e, "sequence failed to decode, treating as invalid");
                    None
                }
            })
            .collect();

        let decodable: Vec<String> = molecules.iter().flatten().cloned().collect();
        let env_out = if decodable.is_empty() {
            ScoredBatch::default()
        } else {
            self.environment
                .score(&decodable)
                .await
                .and_then(|out| out.check_len(decodable.len()).map(|_| out))
                .map_err(|source| TrainError::Scoring {
                    batch_size: decodable.len(),
                    source,
                })?
        };

        let mut scored = ScoredBatch::with_capacity(molecules.len());
        let mut env_rows = env_out.scores.iter().zip(&env_out.valid);
        for molecule in &molecules {
            match molecule {
                Some(_) => {
                    // check_len guarantees one entry per decodable row.
                    let (&s, &v) = env_rows.next().ok_or_else(|| {
                        TrainError::shape("environment output", decodable.len(), env_out.len())
                    })?;
                    scored.push(s, v);
                }
                None => scored.push(0.0, false),
            }
        }

        debug!(
            env = self.environment.name(),
            batch_size = batch.len(),
            undecodable = molecules.len() - decodable.len(),
            valid_fraction = scored.valid_fraction(),
            "batch scored"
        );

        Ok(BatchScores { molecules, scored })
    }

    /// Shaped reward per row of `batch`.
    pub async fn rewards(&self, batch: &SequenceBatch) -> Result<Vec<f64>> {
        let scores = self.evaluate(batch).await?;
        Ok(self.shaper.shape(&scores.scored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SmilesVocabulary;
    use crate::training::testing::{test_vocabulary, FailingEnvironment, TableEnvironment};

    #[tokio::test]
    async fn test_rewards_follow_table_and_baseline() {
        let vocab = test_vocabulary();
        let env = TableEnvironment::new(&[("CN", 0.8, true), ("Oc", 0.3, false)]);
        let oracle = RewardOracle::new(&vocab, &env, RewardShaper::new(0.1, 0.0));

        let batch = SequenceBatch::from_rows(4, vec![vec![1, 2, 0, 0], vec![3, 4, 0, 0]]).unwrap();
        let rewards = oracle.rewards(&batch).await.unwrap();
        assert!((rewards[0] - 0.7).abs() < 1e-12);
        assert!((rewards[1] + 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_undecodable_rows_are_invalid_and_skip_environment() {
        let vocab = test_vocabulary();
        let env = TableEnvironment::new(&[("CN", 0.8, true)]);
        let oracle = RewardOracle::new(&vocab, &env, RewardShaper::new(0.1, 0.0));

        // Token 42 is outside the vocabulary.
        let batch =
            SequenceBatch::from_rows(3, vec![vec![42, 1, 0], vec![1, 2, 0], vec![42, 0, 0]]).unwrap();
        let scores = oracle.evaluate(&batch).await.unwrap();

        assert_eq!(scores.molecules[0], None);
        assert_eq!(scores.molecules[1].as_deref(), Some("CN"));
        assert_eq!(scores.scored.valid, vec![false, true, false]);
        assert_eq!(scores.scored.scores, vec![0.0, 0.8, 0.0]);
        assert_eq!(env.calls(), vec![1]);
    }

    #[tokio::test]
    async fn test_nothing_decodable_never_calls_environment() {
        let vocab = SmilesVocabulary::new(["C"]).unwrap();
        let env = TableEnvironment::new(&[]);
        let oracle = RewardOracle::new(&vocab, &env, RewardShaper::new(0.1, 0.0));

        let batch = SequenceBatch::from_rows(2, vec![vec![9, 0]]).unwrap();
        let rewards = oracle.rewards(&batch).await.unwrap();
        assert_eq!(rewards.len(), 1);
        assert!((rewards[0] + 0.1).abs() < 1e-12);
        assert!(env.calls().is_empty());
    }

    #[tokio::test]
    async fn test_environment_failure_aborts_batch() {
        let vocab = test_vocabulary();
        let oracle = RewardOracle::new(&vocab, &FailingEnvironment, RewardShaper::new(0.1, 0.0));

        let batch = SequenceBatch::from_rows(2, vec![vec![1, 0], vec![2, 0]]).unwrap();
        let err = oracle.rewards(&batch).await.unwrap_err();
        assert!(matches!(err, TrainError::Scoring { batch_size: 2, .. }));
    }
}
