//! Reward shaping and the per-position reward matrix.
//!
//! Shaping turns environment output into training signal:
//!
//!   reward = score - baseline                      if valid
//!   reward = -baseline - invalid_penalty           if invalid
//!
//! The same formula is used by both trainers and by every rollout, so a
//! position's credit is always comparable to its sequence's terminal reward.

use serde::{Deserialize, Serialize};

use crate::env::ScoredBatch;
use crate::error::{Result, TrainError};
use crate::sequence::SequenceBatch;

// ---------------------------------------------------------------------------
// Shaping
// ---------------------------------------------------------------------------

/// Baseline subtraction with a fixed penalty for invalid molecules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardShaper {
    pub baseline: f64,
    /// Extra penalty on top of `-baseline` for invalid molecules.
    pub invalid_penalty: f64,
}

impl RewardShaper {
    pub fn new(baseline: f64, invalid_penalty: f64) -> Self {
        Self {
            baseline,
            invalid_penalty,
        }
    }

    /// Shape one score. Whatever the scorer returned for an invalid molecule
    /// is ignored.
    pub fn shape_one(&self, score: f64, valid: bool) -> f64 {
        if valid {
            score - self.baseline
        } else {
            -self.baseline - self.invalid_penalty
        }
    }

    /// Shape a whole batch, in order.
    pub fn shape(&self, scored: &ScoredBatch) -> Vec<f64> {
        scored
            .scores
            .iter()
            .zip(&scored.valid)
            .map(|(&s, &v)| self.shape_one(s, v))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Reward matrix
// ---------------------------------------------------------------------------

/// `values[i][t]` is the credit for the token chosen at position `t` of
/// sequence `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardMatrix {
    rows: usize,
    cols: usize,
    values: Vec<Vec<f64>>,
}

impl RewardMatrix {
    /// A `rows x cols` matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: vec![vec![0.0; cols]; rows],
        }
    }

    /// Broadcast one reward per row over every column.
    pub fn broadcast(rewards: &[f64], cols: usize) -> Self {
        Self {
            rows: rewards.len(),
            cols,
            values: rewards.iter().map(|&r| vec![r; cols]).collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Credit at sequence `i`, position `t`.
    pub fn get(&self, i: usize, t: usize) -> f64 {
        self.values[i][t]
    }

    /// Overwrite the credit at `(i, t)`.
    pub fn set(&mut self, i: usize, t: usize, value: f64) {
        self.values[i][t] = value;
    }

    /// Add `value` to the credit at `(i, t)`.
    pub fn add(&mut self, i: usize, t: usize, value: f64) {
        self.values[i][t] += value;
    }

    /// Elementwise `self += other`.
    pub fn accumulate(&mut self, other: &RewardMatrix) -> Result<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(TrainError::shape(
                "reward accumulation",
                self.shape(),
                other.shape(),
            ));
        }
        for (dst, src) in self.values.iter_mut().zip(&other.values) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        Ok(())
    }

    /// Multiply every entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for row in &mut self.values {
            for v in row {
                *v *= factor;
            }
        }
    }

    pub fn as_rows(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn shape(&self) -> String {
        format!("{}x{}", self.rows, self.cols)
    }

    /// Fail unless the matrix has one row per sequence and one column per position.
    pub fn check_shape(&self, batch: &SequenceBatch) -> Result<()> {
        if self.rows != batch.len() || self.cols != batch.width() {
            return Err(TrainError::shape("reward matrix", batch.shape(), self.shape()));
        }
        Ok(())
    }

    /// Mean over the positions selected by `mask`.
    pub fn masked_mean(&self, mask: &[Vec<bool>]) -> f64 {
        let (sum, n) = self
            .values
            .iter()
            .zip(mask)
            .flat_map(|(row, m)| row.iter().zip(m))
            .filter(|&(_, &keep)| keep)
            .fold((0.0, 0usize), |(s, n), (v, _)| (s + v, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shaping_valid_and_invalid_branches() {
        let shaper = RewardShaper::new(0.1, 0.0);
        assert!((shaper.shape_one(0.7, true) - 0.6).abs() < 1e-12);
        // The raw score of an invalid molecule is never used.
        assert!((shaper.shape_one(0.9, false) - (-0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_penalty_stacks_on_baseline() {
        let shaper = RewardShaper::new(0.1, 0.4);
        assert!((shaper.shape_one(123.0, false) - (-0.5)).abs() < 1e-12);
        assert!((shaper.shape_one(0.1, true)).abs() < 1e-12);
    }

    #[test]
    fn test_shape_batch_keeps_order() {
        let scored = ScoredBatch {
            scores: vec![0.8, 0.3, 1.0],
            valid: vec![true, false, true],
        };
        let rewards = RewardShaper::new(0.1, 0.0).shape(&scored);
        let expected = [0.7, -0.1, 0.9];
        for (r, e) in rewards.iter().zip(expected) {
            assert!((r - e).abs() < 1e-12);
        }
    }

    #[test]
    fn test_accumulate_and_scale() {
        let mut acc = RewardMatrix::zeros(2, 3);
        let mut trial = RewardMatrix::zeros(2, 3);
        trial.set(0, 1, 2.0);
        trial.set(1, 2, -4.0);
        acc.accumulate(&trial).unwrap();
        acc.accumulate(&trial).unwrap();
        acc.scale(0.5);
        assert_eq!(acc.get(0, 1), 2.0);
        assert_eq!(acc.get(1, 2), -4.0);
        assert_eq!(acc.get(0, 0), 0.0);
        assert_eq!(acc.get(1, 0), 0.0);

        let wrong = RewardMatrix::zeros(3, 3);
        assert!(matches!(
            acc.accumulate(&wrong),
            Err(TrainError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_check_shape_against_batch() {
        let batch = SequenceBatch::from_rows(3, vec![vec![1, 0, 0], vec![2, 3, 0]]).unwrap();
        assert!(RewardMatrix::broadcast(&[0.1, 0.2], 3).check_shape(&batch).is_ok());
        assert!(RewardMatrix::broadcast(&[0.1, 0.2], 4).check_shape(&batch).is_err());
        assert!(RewardMatrix::broadcast(&[0.1], 3).check_shape(&batch).is_err());
    }

    #[test]
    fn test_masked_mean_skips_padding() {
        let m = RewardMatrix::broadcast(&[1.0, 3.0], 2);
        let mask = vec![vec![true, false], vec![true, true]];
        assert!((m.masked_mean(&mask) - 7.0 / 3.0).abs() < 1e-12);
    }
}
