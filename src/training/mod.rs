//! Credit assignment and update engine.
//!
//! This module turns environment scores into policy-gradient updates on a
//! [`Generator`](crate::generator::Generator): reward shaping, deduplicated
//! oversampling, the sequence-level trainer, the Monte-Carlo rollout
//! trainer, and the outer epoch loop that evaluates and checkpoints.

pub mod pipeline;
pub mod policy_gradient;
pub mod reward;
pub mod rollout;
pub mod sampling;
pub mod scoring;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{EpochRecord, Evaluation, RunSummary, ScoredMolecule, Trainer, TrainingPipeline};
pub use policy_gradient::{PolicyGradientTrainer, StepReport};
pub use reward::{RewardMatrix, RewardShaper};
pub use rollout::{RolloutEstimate, RolloutTrainer};
pub use sampling::{oversample_unique, UniqueBatch};
pub use scoring::{BatchScores, RewardOracle};
