//! The generator capability consumed by the trainers.
//!
//! A generator can:
//! - **sample** a batch, optionally blending in a frozen exploration partner
//!   with per-step probability `epsilon`, and optionally resuming from a
//!   [`Continuation`] taken mid-sequence;
//! - report per-token **likelihoods** for given sequences;
//! - **optimize** a [`PolicyLoss`] with one gradient step.
//!
//! The agent is held as `&mut G` by exactly one trainer call; the exploration
//! partner is only ever borrowed as `&G`.

pub mod markov;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::sequence::{SequenceBatch, Token};

pub use markov::{MarkovGenerator, MarkovState};

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Everything needed to resume generation for one row: the last token of the
/// fixed prefix, the hidden state after consuming it, and the position of the
/// next token to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation<S> {
    pub last_token: Token,
    pub state: S,
    pub position: usize,
}

/// Parameters for one call to [`Generator::sample`].
pub struct SampleRequest<'a, G: Generator> {
    pub batch_size: usize,
    /// Frozen partner whose distribution is used with probability `epsilon`.
    pub explore: Option<&'a G>,
    pub epsilon: f64,
    /// When set, one row is generated per continuation, starting at its
    /// position; the output width is `max_len - position`.
    pub resume: Option<&'a [Continuation<G::State>]>,
    /// Return the per-step hidden states alongside the tokens.
    pub keep_states: bool,
}

impl<'a, G: Generator> SampleRequest<'a, G> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            explore: None,
            epsilon: 0.0,
            resume: None,
            keep_states: false,
        }
    }

    pub fn explore(mut self, partner: Option<&'a G>, epsilon: f64) -> Self {
        self.explore = partner;
        self.epsilon = epsilon;
        self
    }

    pub fn resume(mut self, continuations: &'a [Continuation<G::State>]) -> Self {
        self.batch_size = continuations.len();
        self.resume = Some(continuations);
        self
    }

    pub fn keep_states(mut self) -> Self {
        self.keep_states = true;
        self
    }
}

/// Output of [`Generator::sample`].
#[derive(Debug, Clone)]
pub struct SampledBatch<S> {
    pub sequences: SequenceBatch,
    /// `states[i][t]` is the hidden state after token `t` of row `i`.
    pub states: Option<Vec<Vec<S>>>,
}

/// Output of [`Generator::likelihood`]: per-token log-probabilities (zero at
/// padding) and the hidden state after each token.
#[derive(Debug, Clone)]
pub struct TokenLikelihoods<S> {
    pub log_probs: Vec<Vec<f64>>,
    pub states: Vec<Vec<S>>,
}

impl<S> TokenLikelihoods<S> {
    /// Sequence log-likelihoods, summed over positions.
    pub fn per_sequence(&self) -> Vec<f64> {
        self.log_probs.iter().map(|row| row.iter().sum()).collect()
    }

    /// Fail unless the log-probability matrix matches the batch shape.
    pub fn check_shape(&self, batch: &SequenceBatch) -> Result<()> {
        check_matrix("likelihood matrix", &self.log_probs, batch)
    }
}

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

/// A policy-gradient loss ready for [`Generator::optimize`].
///
/// The value is `-(1/B) * sum_i sum_t mask[i][t] * log_pi[i][t] * reward[i][t]`;
/// `weights` holds `reward * mask`, i.e. the per-token coefficients of the
/// gradient, with padding positions forced to zero.
#[derive(Debug, Clone)]
pub struct PolicyLoss {
    pub sequences: SequenceBatch,
    pub weights: Vec<Vec<f64>>,
    pub value: f64,
}

impl PolicyLoss {
    /// Build the loss from per-token log-probabilities and per-token rewards.
    pub fn from_token_rewards(
        sequences: SequenceBatch,
        log_probs: &[Vec<f64>],
        rewards: &[Vec<f64>],
    ) -> Result<Self> {
        if sequences.is_empty() {
            return Err(TrainError::EmptyBatch { pool_size: 0 });
        }
        check_matrix("likelihood matrix", log_probs, &sequences)?;
        check_matrix("reward matrix", rewards, &sequences)?;

        let mask = sequences.loss_mask();
        let mut weights = vec![vec![0.0; sequences.width()]; sequences.len()];
        let mut total = 0.0;
        for (i, row_mask) in mask.iter().enumerate() {
            for (t, &keep) in row_mask.iter().enumerate() {
                if keep {
                    weights[i][t] = rewards[i][t];
                    total += log_probs[i][t] * rewards[i][t];
                }
            }
        }

        let value = -total / sequences.len() as f64;
        Ok(Self {
            sequences,
            weights,
            value,
        })
    }

    /// Same as [`from_token_rewards`](Self::from_token_rewards) with one reward
    /// broadcast over every position of its sequence.
    pub fn from_sequence_rewards(
        sequences: SequenceBatch,
        log_probs: &[Vec<f64>],
        rewards: &[f64],
    ) -> Result<Self> {
        if rewards.len() != sequences.len() {
            return Err(TrainError::shape(
                "reward vector",
                sequences.len(),
                rewards.len(),
            ));
        }
        let width = sequences.width();
        let broadcast: Vec<Vec<f64>> = rewards.iter().map(|&r| vec![r; width]).collect();
        Self::from_token_rewards(sequences, log_probs, &broadcast)
    }
}

fn check_matrix(what: &'static str, matrix: &[Vec<f64>], batch: &SequenceBatch) -> Result<()> {
    let ragged = matrix.iter().any(|row| row.len() != batch.width());
    if matrix.len() != batch.len() || ragged {
        let actual = format!(
            "{}x{}",
            matrix.len(),
            matrix.first().map_or(0, |r| r.len())
        );
        return Err(TrainError::shape(what, batch.shape(), actual));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// A stateful token generator that can be trained by policy gradient.
pub trait Generator: Send + Sync {
    /// Hidden state threaded through generation, exported for resumption.
    type State: Clone + Debug + Send + Sync + Serialize + DeserializeOwned;

    fn vocab_size(&self) -> usize;

    /// Width of every sampled row.
    fn max_len(&self) -> usize;

    fn sample(&self, request: &SampleRequest<'_, Self>) -> anyhow::Result<SampledBatch<Self::State>>
    where
        Self: Sized;

    fn likelihood(&self, sequences: &SequenceBatch)
        -> anyhow::Result<TokenLikelihoods<Self::State>>;

    /// Clear accumulated gradients.
    fn zero_grad(&mut self);

    /// Accumulate the gradient of `loss` and apply one optimizer step.
    fn optimize(&mut self, loss: &PolicyLoss) -> anyhow::Result<()>;

    /// Multiply the optimizer learning rate by `factor`.
    fn scale_learning_rate(&mut self, _factor: f64) {}
}
