//! Token-level trainer with Monte-Carlo credit assignment.
//!
//! For every position `t` of every sequence that is still open at `t`, the
//! agent resumes generation from its own hidden state after token `t`, the
//! completed sequence is scored and shaped, and that reward is credited to
//! position `t`. Averaged over `mc` independent trials this estimates the
//! expected terminal reward given the prefix.
//!
//! ```text
//! sample B (keep states) -> terminal score
//! for trial in 0..mc:                          (deadline checked between trials)
//!     for t in 0..max_effective_len:
//!         open rows -> resume at t+1 -> prefix ++ tail -> score -> contribution[:, t]
//! rewards = fold(+, contributions) / mc       at resumed positions
//!         = terminal reward                    everywhere else
//! loss    = -(1/B) sum_it mask_it * log pi_it * rewards_it
//! ```
//!
//! Positions at or after a row's stop token, and a row's last position, never
//! trigger a rollout: the outcome is already fixed there, so they carry the
//! terminal reward. Those entries are also masked out of the loss when they
//! are padding.

use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, info};

use crate::config::RlConfig;
use crate::env::Environment;
use crate::error::{Result, TrainError};
use crate::generator::{Continuation, Generator, PolicyLoss, SampleRequest};
use crate::sequence::{SequenceBatch, Vocabulary};

use super::policy_gradient::StepReport;
use super::reward::{RewardMatrix, RewardShaper};
use super::scoring::{BatchScores, RewardOracle};

/// Per-position rewards for one sampled batch.
#[derive(Debug, Clone)]
pub struct RolloutEstimate {
    pub rewards: RewardMatrix,
    /// Scores of the batch as sampled.
    pub terminal: BatchScores,
    pub terminal_rewards: Vec<f64>,
    /// Resume-and-score rounds issued across all trials.
    pub rollout_calls: usize,
}

/// Trains with Monte-Carlo estimates of per-position reward.
pub struct RolloutTrainer {
    config: RlConfig,
}

/// A rollout from position `t` is informative only while the row is open and
/// there is room left to generate.
fn is_resumable(batch: &SequenceBatch, i: usize, t: usize) -> bool {
    t + 1 < batch.width() && batch.is_open(i, t)
}

impl RolloutTrainer {
    pub fn new(config: RlConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RlConfig {
        &self.config
    }

    pub fn shaper(&self) -> RewardShaper {
        RewardShaper::new(self.config.baseline, self.config.invalid_penalty)
    }

    /// Estimate the reward matrix for `batch`, whose hidden states after each
    /// token are given in `states`.
    ///
    /// # Errors
    ///
    /// Fails on shape disagreement, any scoring or generator failure, or when
    /// the configured deadline passes between trials.
    pub async fn estimate_rewards<G, V, E>(
        &self,
        agent: &G,
        batch: &SequenceBatch,
        states: &[Vec<G::State>],
        oracle: &RewardOracle<'_, V, E>,
    ) -> Result<RolloutEstimate>
    where
        G: Generator,
        V: Vocabulary + ?Sized,
        E: Environment,
    {
        if batch.is_empty() {
            return Err(TrainError::EmptyBatch { pool_size: 0 });
        }
        if states.len() != batch.len() || states.iter().any(|s| s.len() != batch.width()) {
            let actual = format!("{}x{}", states.len(), states.first().map_or(0, |s| s.len()));
            return Err(TrainError::shape("hidden states", batch.shape(), actual));
        }

        let terminal = oracle.evaluate(batch).await?;
        let terminal_rewards = oracle.shaper().shape(&terminal.scored);

        let mc = self.config.mc;
        let deadline = self
            .config
            .rollout_deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let mut sum = RewardMatrix::zeros(batch.len(), batch.width());
        let mut rollout_calls = 0;
        for trial in 0..mc {
            if trial > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TrainError::DeadlineExceeded {
                    completed_trials: trial,
                    total_trials: mc,
                });
            }
            let (contribution, calls) = self.run_trial(agent, batch, states, oracle, trial).await?;
            sum.accumulate(&contribution)?;
            rollout_calls += calls;
        }
        sum.scale(1.0 / mc as f64);

        let mut rewards = RewardMatrix::broadcast(&terminal_rewards, batch.width());
        for i in 0..batch.len() {
            for t in 0..batch.width() {
                if is_resumable(batch, i, t) {
                    rewards.set(i, t, sum.get(i, t));
                }
            }
        }
        rewards.check_shape(batch)?;

        Ok(RolloutEstimate {
            rewards,
            terminal,
            terminal_rewards,
            rollout_calls,
        })
    }

    /// One Monte-Carlo trial: a reward contribution for every resumable
    /// position, zero elsewhere.
    async fn run_trial<G, V, E>(
        &self,
        agent: &G,
        batch: &SequenceBatch,
        states: &[Vec<G::State>],
        oracle: &RewardOracle<'_, V, E>,
        trial: usize,
    ) -> Result<(RewardMatrix, usize)>
    where
        G: Generator,
        V: Vocabulary + ?Sized,
        E: Environment,
    {
        let width = batch.width();
        let mut contribution = RewardMatrix::zeros(batch.len(), width);
        let mut calls = 0;

        for t in 0..batch.max_effective_len() {
            let open: Vec<usize> = (0..batch.len())
                .filter(|&i| is_resumable(batch, i, t))
                .collect();
            if open.is_empty() {
                continue;
            }

            let continuations: Vec<Continuation<G::State>> = open
                .iter()
                .map(|&i| Continuation {
                    last_token: batch.row(i)[t],
                    state: states[i][t].clone(),
                    position: t + 1,
                })
                .collect();
            let request = SampleRequest::new(continuations.len()).resume(&continuations);
            let tails = agent
                .sample(&request)
                .map_err(|e| TrainError::generator("rollout", e))?
                .sequences;
            if tails.len() != open.len() || tails.width() != width - t - 1 {
                let expected = format!("{}x{}", open.len(), width - t - 1);
                return Err(TrainError::shape("rollout continuation", expected, tails.shape()));
            }

            let completed = SequenceBatch::from_rows(
                width,
                open.iter()
                    .zip(tails.rows())
                    .map(|(&i, tail)| {
                        let mut row = batch.row(i)[..=t].to_vec();
                        row.extend_from_slice(tail);
                        row
                    })
                    .collect(),
            )?;
            let rewards = oracle.rewards(&completed).await?;
            for (&i, r) in open.iter().zip(rewards) {
                contribution.add(i, t, r);
            }
            calls += 1;

            debug!(trial, position = t, open = open.len(), "rollout scored");
        }

        Ok((contribution, calls))
    }

    /// Sample one batch, estimate per-position rewards, and apply one update.
    pub async fn train_step<G, V, E>(
        &self,
        agent: &mut G,
        explore: Option<&G>,
        oracle: &RewardOracle<'_, V, E>,
    ) -> Result<StepReport>
    where
        G: Generator,
        V: Vocabulary + ?Sized,
        E: Environment,
    {
        let request = SampleRequest::new(self.config.batch_size)
            .explore(explore, self.config.epsilon)
            .keep_states();
        let sampled = agent
            .sample(&request)
            .map_err(|e| TrainError::generator("sampling", e))?;
        let states = sampled.states.ok_or_else(|| {
            TrainError::generator("sampling", anyhow!("hidden states were not returned"))
        })?;
        let batch = sampled.sequences;

        let estimate = self.estimate_rewards(&*agent, &batch, &states, oracle).await?;

        let likelihood = agent
            .likelihood(&batch)
            .map_err(|e| TrainError::generator("likelihood", e))?;
        likelihood.check_shape(&batch)?;

        let batch_size = batch.len();
        let mean_reward = estimate.rewards.masked_mean(&batch.loss_mask());
        let loss =
            PolicyLoss::from_token_rewards(batch, &likelihood.log_probs, estimate.rewards.as_rows())?;

        agent.zero_grad();
        agent
            .optimize(&loss)
            .map_err(|e| TrainError::generator("optimize", e))?;
        agent.zero_grad();

        let scored = &estimate.terminal.scored;
        let report = StepReport {
            pool_size: batch_size,
            batch_size,
            loss: loss.value,
            mean_score: scored.mean_score(),
            valid_fraction: scored.valid_fraction(),
            mean_reward,
            rollout_calls: estimate.rollout_calls,
        };
        info!(
            batch_size,
            trials = self.config.mc,
            rollout_calls = report.rollout_calls,
            loss = report.loss,
            mean_score = report.mean_score,
            valid_fraction = report.valid_fraction,
            "rollout step complete"
        );
        Ok(report)
    }
}
