//! Outer epoch loop.
//!
//! ```text
//! for epoch = 0 .. E:
//!   a. one trainer call (policy-gradient or rollout, fixed for the run)
//!   b. evaluate: sample N without exploration, dedupe, score
//!        desired_fraction = #(valid and score >= threshold) / N
//!   c. if desired_fraction beats the best so far, save the agent checkpoint
//!   d. learning rate *= (1 - lr_decay)
//!   e. append one JSON line to epochs.jsonl
//! ```
//!
//! Trainer failures are fatal and propagate out of [`TrainingPipeline::run`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DesignerConfig, RlConfig, TrainingMode};
use crate::env::Environment;
use crate::error::TrainError;
use crate::generator::{Generator, SampleRequest};
use crate::sequence::Vocabulary;

use super::policy_gradient::{PolicyGradientTrainer, StepReport};
use super::rollout::RolloutTrainer;
use super::scoring::RewardOracle;

const EPOCH_LOG: &str = "epochs.jsonl";
const BEST_CHECKPOINT: &str = "agent.best.json";

// ---------------------------------------------------------------------------
// Trainer selection
// ---------------------------------------------------------------------------

/// The trainer chosen once from [`RlConfig::mode`].
pub enum Trainer {
    PolicyGradient(PolicyGradientTrainer),
    Rollout(RolloutTrainer),
}

impl Trainer {
    pub fn from_config(config: &RlConfig) -> crate::error::Result<Self> {
        Ok(match config.mode {
            TrainingMode::PolicyGradient => {
                Self::PolicyGradient(PolicyGradientTrainer::new(config.clone())?)
            }
            TrainingMode::Rollout => Self::Rollout(RolloutTrainer::new(config.clone())?),
        })
    }

    pub fn mode(&self) -> TrainingMode {
        match self {
            Self::PolicyGradient(_) => TrainingMode::PolicyGradient,
            Self::Rollout(_) => TrainingMode::Rollout,
        }
    }

    pub async fn train_step<G, V, E>(
        &self,
        agent: &mut G,
        explore: Option<&G>,
        oracle: &RewardOracle<'_, V, E>,
    ) -> crate::error::Result<StepReport>
    where
        G: Generator,
        V: Vocabulary + ?Sized,
        E: Environment,
    {
        match self {
            Self::PolicyGradient(t) => t.train_step(agent, explore, oracle).await,
            Self::Rollout(t) => t.train_step(agent, explore, oracle).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A decoded molecule and its raw score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMolecule {
    pub smiles: String,
    pub score: f64,
}

/// Result of sampling and scoring the agent without exploration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub sampled: usize,
    pub unique: usize,
    pub valid_fraction: f64,
    pub mean_score: f64,
    /// Valid molecules scoring at least the threshold, over all sampled.
    pub desired_fraction: f64,
    /// Best valid molecules, highest score first.
    pub top_molecules: Vec<ScoredMolecule>,
}

/// One line of `epochs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub run_id: String,
    pub epoch: usize,
    pub timestamp: DateTime<Utc>,
    pub mode: TrainingMode,
    pub step: StepReport,
    pub evaluation: Evaluation,
    pub best_desired_fraction: f64,
    pub improved: bool,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub epochs: usize,
    pub best_epoch: Option<usize>,
    pub best_desired_fraction: f64,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the epoch loop over one agent.
pub struct TrainingPipeline {
    config: DesignerConfig,
    trainer: Trainer,
    run_id: String,
}

impl TrainingPipeline {
    pub fn new(config: DesignerConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let trainer = Trainer::from_config(&config.rl)?;
        Ok(Self {
            config,
            trainer,
            run_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn epoch_log_path(&self) -> PathBuf {
        self.config.evaluation.output_dir.join(EPOCH_LOG)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.config.evaluation.output_dir.join(BEST_CHECKPOINT)
    }

    /// Sample `evaluation.samples` sequences from `agent`, dedupe and score.
    pub async fn evaluate<G, V, E>(
        &self,
        agent: &G,
        oracle: &RewardOracle<'_, V, E>,
    ) -> crate::error::Result<Evaluation>
    where
        G: Generator,
        V: Vocabulary + ?Sized,
        E: Environment,
    {
        let eval = &self.config.evaluation;
        let sampled = agent
            .sample(&SampleRequest::new(eval.samples))
            .map_err(|e| TrainError::generator("evaluation sampling", e))?
            .sequences;
        let pool_size = sampled.len();
        let unique = sampled.unique();
        if unique.is_empty() {
            return Err(TrainError::EmptyBatch { pool_size });
        }

        let scores = oracle.evaluate(&unique).await?;
        let scored = &scores.scored;

        let desired = scored
            .scores
            .iter()
            .zip(&scored.valid)
            .filter(|&(&s, &v)| v && s >= eval.desirability_threshold)
            .count();

        let mut ranked: Vec<(OrderedFloat<f64>, &str)> = scores
            .molecules
            .iter()
            .zip(scored.scores.iter().zip(&scored.valid))
            .filter_map(|(m, (&s, &v))| match m {
                Some(smiles) if v => Some((OrderedFloat(s), smiles.as_str())),
                _ => None,
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(Evaluation {
            sampled: pool_size,
            unique: unique.len(),
            valid_fraction: scored.valid_fraction(),
            mean_score: scored.mean_score(),
            desired_fraction: desired as f64 / eval.samples as f64,
            top_molecules: ranked
                .into_iter()
                .take(eval.top_k)
                .map(|(s, smiles)| ScoredMolecule {
                    smiles: smiles.to_string(),
                    score: s.0,
                })
                .collect(),
        })
    }

    /// Run every configured epoch.
    ///
    /// `save_checkpoint` is called with the agent and
    /// [`checkpoint_path`](Self::checkpoint_path) whenever the desired
    /// fraction strictly improves.
    pub async fn run<G, V, E, F>(
        &self,
        agent: &mut G,
        explore: Option<&G>,
        oracle: &RewardOracle<'_, V, E>,
        mut save_checkpoint: F,
    ) -> Result<RunSummary>
    where
        G: Generator,
        V: Vocabulary + ?Sized,
        E: Environment,
        F: FnMut(&G, &Path) -> Result<()>,
    {
        let output_dir = &self.config.evaluation.output_dir;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let epochs = self.config.rl.epochs;
        info!(
            run_id = %self.run_id,
            mode = ?self.trainer.mode(),
            epochs,
            batch_size = self.config.rl.batch_size,
            mc = self.config.rl.mc,
            "starting training run"
        );

        let mut best = 0.0;
        let mut best_epoch = None;
        for epoch in 0..epochs {
            let step = self
                .trainer
                .train_step(agent, explore, oracle)
                .await
                .with_context(|| format!("training step failed at epoch {epoch}"))?;
            let evaluation = self
                .evaluate(&*agent, oracle)
                .await
                .with_context(|| format!("evaluation failed at epoch {epoch}"))?;

            let improved = evaluation.desired_fraction > best;
            if improved {
                best = evaluation.desired_fraction;
                best_epoch = Some(epoch);
                let path = self.checkpoint_path();
                save_checkpoint(&*agent, &path)
                    .with_context(|| format!("failed to save checkpoint {}", path.display()))?;
                info!(epoch, desired_fraction = best, path = %path.display(), "new best checkpoint");
            } else {
                debug!(epoch, best, "no improvement");
            }

            agent.scale_learning_rate(1.0 - self.config.rl.lr_decay);

            let record = EpochRecord {
                run_id: self.run_id.clone(),
                epoch,
                timestamp: Utc::now(),
                mode: self.trainer.mode(),
                step,
                evaluation,
                best_desired_fraction: best,
                improved,
            };
            if let Err(e) = self.append_record(&record) {
                warn!(error = %e, epoch, "failed to append epoch record");
            }

            info!(
                epoch,
                loss = record.step.loss,
                mean_score = record.evaluation.mean_score,
                valid_fraction = record.evaluation.valid_fraction,
                desired_fraction = record.evaluation.desired_fraction,
                "epoch complete"
            );
        }

        info!(run_id = %self.run_id, best_desired_fraction = best, ?best_epoch, "training run complete");
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            epochs,
            best_epoch,
            best_desired_fraction: best,
        })
    }

    fn append_record(&self, record: &EpochRecord) -> Result<()> {
        let path = self.epoch_log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
