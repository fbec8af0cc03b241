//! Sequence-level policy-gradient trainer.
//!
//! One call runs:
//!
//! ```text
//! sample (M x B, with exploration) -> dedupe -> decode/score -> shape
//!   -> per-token log-likelihood -> loss = -(1/B) sum_i R_i * sum_t log pi(x_it)
//!   -> zero_grad -> optimize -> zero_grad
//! ```
//!
//! The unique batch is scored exactly once and drives exactly one optimizer
//! step. Any failure aborts the call; nothing is retried.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RlConfig;
use crate::env::Environment;
use crate::error::{Result, TrainError};
use crate::generator::{Generator, PolicyLoss};
use crate::sequence::Vocabulary;

use super::reward::RewardShaper;
use super::sampling::oversample_unique;
use super::scoring::RewardOracle;

// ---------------------------------------------------------------------------
// Step report
// ---------------------------------------------------------------------------

/// Summary of one trainer call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Sequences sampled before deduplication.
    pub pool_size: usize,
    /// Sequences that contributed to the loss.
    pub batch_size: usize,
    pub loss: f64,
    /// Mean raw score, invalid molecules counted as zero.
    pub mean_score: f64,
    pub valid_fraction: f64,
    /// Mean shaped reward over non-padding positions.
    pub mean_reward: f64,
    /// Scoring rounds issued for Monte-Carlo completions.
    pub rollout_calls: usize,
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Trains with one terminal reward per unique sequence.
pub struct PolicyGradientTrainer {
    config: RlConfig,
}

impl PolicyGradientTrainer {
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

    /// Run one sample/score/update pass on `agent`.
    ///
    /// `explore` is only read; its parameters are never touched.
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
        let unique = oversample_unique(
            &*agent,
            explore,
            self.config.epsilon,
            self.config.batch_size,
            self.config.mc,
        )?;
        let batch = unique.sequences;

        let scores = oracle.evaluate(&batch).await?;
        let rewards = oracle.shaper().shape(&scores.scored);

        let likelihood = agent
            .likelihood(&batch)
            .map_err(|e| TrainError::generator("likelihood", e))?;
        likelihood.check_shape(&batch)?;

        let batch_size = batch.len();
        let mean_reward = rewards.iter().sum::<f64>() / batch_size as f64;
        let loss = PolicyLoss::from_sequence_rewards(batch, &likelihood.log_probs, &rewards)?;

        agent.zero_grad();
        agent
            .optimize(&loss)
            .map_err(|e| TrainError::generator("optimize", e))?;
        agent.zero_grad();

        let report = StepReport {
            pool_size: unique.pool_size,
            batch_size,
            loss: loss.value,
            mean_score: scores.scored.mean_score(),
            valid_fraction: scores.scored.valid_fraction(),
            mean_reward,
            rollout_calls: 0,
        };
        info!(
            pool_size = report.pool_size,
            batch_size,
            loss = report.loss,
            mean_score = report.mean_score,
            valid_fraction = report.valid_fraction,
            "policy-gradient step complete"
        );
        Ok(report)
    }
}
