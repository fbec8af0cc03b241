//! MolGen-RL: reinforcement learning for molecular sequence generators.
//!
//! A generator proposes token sequences, an environment scores the decoded
//! molecules, and the trainers turn those scores into policy-gradient updates,
//! either with one reward per sequence or with per-position Monte-Carlo
//! rollout estimates.

pub mod config;
pub mod env;
pub mod error;
pub mod generator;
pub mod sequence;
pub mod training;
