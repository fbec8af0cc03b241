use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::env::descriptor::{ClippedScore, Descriptor, Objective};
use crate::error::{Result, TrainError};

/// Complete configuration for a molecule design run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignerConfig {
    pub rl: RlConfig,
    pub generator: GeneratorConfig,
    pub evaluation: EvaluationConfig,
    pub environment: EnvironmentConfig,
}

/// Which trainer runs each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// One terminal reward per sequence.
    PolicyGradient,
    /// Per-position rewards from Monte-Carlo completions.
    Rollout,
}

/// RL trainer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlConfig {
    /// Trainer used by the epoch loop (default: policy_gradient).
    pub mode: TrainingMode,
    /// Sequences drawn per sampling call (default: 500).
    pub batch_size: usize,
    /// Oversampling factor for the sequence-level trainer, rollout trial
    /// count for the rollout trainer (default: 10).
    pub mc: usize,
    /// Per-step probability of sampling from the exploration model (default: 0.1).
    pub epsilon: f64,
    /// Subtracted from every raw score (default: 0.1).
    pub baseline: f64,
    /// Extra penalty for invalid molecules on top of `-baseline` (default: 0.0).
    pub invalid_penalty: f64,
    /// Training epochs (default: 1000).
    pub epochs: usize,
    /// Fractional learning-rate decay applied after every epoch (default: 0.01).
    pub lr_decay: f64,
    /// Wall-clock budget for one rollout estimate, checked between trials.
    #[serde(default)]
    pub rollout_deadline_secs: Option<u64>,
}

/// Reference generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Maximum generated length including the stop token (default: 100).
    pub max_len: usize,
    /// Adam learning rate (default: 1e-3).
    pub learning_rate: f64,
    /// RNG seed; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Pseudo-count added to every bigram when fitting from a corpus (default: 1.0).
    pub smoothing: f64,
}

/// Per-epoch evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Sequences sampled to evaluate the agent (default: 1000).
    pub samples: usize,
    /// Minimum score for a valid molecule to count as desired (default: 0.5).
    pub desirability_threshold: f64,
    /// Where checkpoints and the epoch log are written.
    pub output_dir: PathBuf,
    /// Molecules kept in each epoch log line (default: 10).
    pub top_k: usize,
}

/// Scoring backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentConfig {
    /// External scoring server.
    Remote { base_url: String, timeout_secs: u64 },
    /// Weighted sum of clipped descriptor objectives.
    Descriptors { objectives: Vec<Objective> },
}

impl RlConfig {
    /// Reject values no trainer can run with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(TrainError::Config(format!(
                "epsilon must lie in [0, 1], got {}",
                self.epsilon
            )));
        }
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be positive".into()));
        }
        if self.mc == 0 {
            return Err(TrainError::Config("mc must be positive".into()));
        }
        if !self.baseline.is_finite() || !self.invalid_penalty.is_finite() {
            return Err(TrainError::Config(
                "baseline and invalid_penalty must be finite".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.lr_decay) {
            return Err(TrainError::Config(format!(
                "lr_decay must lie in [0, 1), got {}",
                self.lr_decay
            )));
        }
        Ok(())
    }
}

impl DesignerConfig {
    pub fn validate(&self) -> Result<()> {
        self.rl.validate()?;
        if self.generator.max_len < 2 {
            return Err(TrainError::Config("generator.max_len must be at least 2".into()));
        }
        if self.evaluation.samples == 0 {
            return Err(TrainError::Config("evaluation.samples must be positive".into()));
        }
        Ok(())
    }
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            mode: TrainingMode::PolicyGradient,
            batch_size: 500,
            mc: 10,
            epsilon: 0.1,
            baseline: 0.1,
            invalid_penalty: 0.0,
            epochs: 1000,
            lr_decay: 0.01,
            rollout_deadline_secs: None,
        }
    }
}

impl Default for DesignerConfig {
    fn default() -> Self {
        Self {
            rl: RlConfig::default(),
            generator: GeneratorConfig {
                max_len: 100,
                learning_rate: 1e-3,
                seed: None,
                smoothing: 1.0,
            },
            evaluation: EvaluationConfig {
                samples: 1000,
                desirability_threshold: 0.5,
                output_dir: PathBuf::from("output"),
                top_k: 10,
            },
            environment: EnvironmentConfig::Descriptors {
                objectives: vec![
                    Objective {
                        descriptor: Descriptor::HeavyAtoms,
                        modifier: ClippedScore::new(10.0, 25.0),
                        weight: 1.0,
                    },
                    Objective {
                        descriptor: Descriptor::Rings,
                        modifier: ClippedScore::new(0.0, 2.0),
                        weight: 1.0,
                    },
                    Objective {
                        descriptor: Descriptor::HeteroatomFraction,
                        modifier: ClippedScore::new(0.4, 0.1),
                        weight: 0.5,
                    },
                ],
            },
        }
    }
}
