//! Core environment trait and shared types.
//!
//! Every scoring backend (descriptor objectives, remote service, ...) implements
//! the [`Environment`] trait so that the trainers can score batches uniformly.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Scores and validity flags for one batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoredBatch {
    /// Desirability per molecule; higher is better.
    pub scores: Vec<f64>,
    /// `false` when the molecule is invalid or structurally disallowed.
    pub valid: Vec<bool>,
}

impl ScoredBatch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            scores: Vec::with_capacity(n),
            valid: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, score: f64, valid: bool) {
        self.scores.push(score);
        self.valid.push(valid);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Reject output that does not carry exactly one score and one flag per input.
    pub fn check_len(&self, expected: usize) -> Result<()> {
        if self.scores.len() != expected || self.valid.len() != expected {
            bail!(
                "environment returned {} scores and {} validity flags for {} molecules",
                self.scores.len(),
                self.valid.len(),
                expected
            );
        }
        Ok(())
    }

    pub fn valid_fraction(&self) -> f64 {
        if self.valid.is_empty() {
            return 0.0;
        }
        self.valid.iter().filter(|&&v| v).count() as f64 / self.valid.len() as f64
    }

    /// Mean score with invalid molecules counted as zero.
    pub fn mean_score(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .scores
            .iter()
            .zip(&self.valid)
            .map(|(&s, &v)| if v { s } else { 0.0 })
            .sum();
        total / self.scores.len() as f64
    }
}

/// The core environment trait.
///
/// Scoring must be a pure function of the batch: malformed molecules are
/// reported through the validity flag, never raised. An `Err` means the whole
/// batch could not be scored.
#[allow(async_fn_in_trait)]
pub trait Environment: Send + Sync {
    /// Score a batch of decoded molecule strings.
    async fn score(&self, molecules: &[String]) -> Result<ScoredBatch>;

    /// A short label for logs (e.g. "descriptors", "remote").
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len() {
        let mut b = ScoredBatch::with_capacity(2);
        b.push(0.5, true);
        b.push(0.1, false);
        assert!(b.check_len(2).is_ok());
        assert!(b.check_len(3).is_err());

        let ragged = ScoredBatch {
            scores: vec![0.1, 0.2],
            valid: vec![true],
        };
        assert!(ragged.check_len(2).is_err());
    }

    #[test]
    fn test_summary_statistics_ignore_invalid_scores() {
        let b = ScoredBatch {
            scores: vec![0.8, 0.9, 0.2, 0.4],
            valid: vec![true, false, true, false],
        };
        assert!((b.valid_fraction() - 0.5).abs() < 1e-12);
        assert!((b.mean_score() - 0.25).abs() < 1e-12);
        assert_eq!(ScoredBatch::default().mean_score(), 0.0);
    }
}
