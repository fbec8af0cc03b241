//! Error taxonomy for the training core.
//!
//! Invalid molecules and undecodable sequences are *not* errors: they travel as
//! `valid = false` and are absorbed by reward shaping. Everything here is fatal
//! to the current training call and propagates unchanged to the epoch loop.

use thiserror::Error;

/// Fatal failures of a single trainer call.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainError {
    /// Deduplication left nothing to train on (generator collapse).
    #[error("empty batch after deduplication (pool of {pool_size} sampled sequences)")]
    EmptyBatch { pool_size: usize },

    /// The environment raised or returned malformed output for a whole batch.
    #[error("scoring failed for batch of {batch_size} molecules")]
    Scoring {
        batch_size: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Reward, likelihood and sequence shapes disagree.
    #[error("dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// The generator failed while sampling, evaluating likelihoods or updating.
    #[error("generator failed during {stage}")]
    Generator {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Rejected configuration values.
    #[error("configuration error: {0}")]
    Config(String),

    /// The optional rollout deadline elapsed between Monte-Carlo trials.
    #[error("rollout deadline exceeded after {completed_trials}/{total_trials} trials")]
    DeadlineExceeded {
        completed_trials: usize,
        total_trials: usize,
    },
}

impl TrainError {
    pub(crate) fn generator(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Generator { stage, source }
    }

    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::DimensionMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T, E = TrainError> = std::result::Result<T, E>;
