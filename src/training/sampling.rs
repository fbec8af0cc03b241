//! Oversampled, deduplicated batch draws.

use tracing::debug;

use crate::error::{Result, TrainError};
use crate::generator::{Generator, SampleRequest};
use crate::sequence::SequenceBatch;

/// A deduplicated pool and the size of the pool it came from.
#[derive(Debug, Clone)]
pub struct UniqueBatch {
    pub sequences: SequenceBatch,
    pub pool_size: usize,
}

/// Draw `repeats` batches of `batch_size` from `agent`, concatenate them, and
/// keep each distinct sequence once in first-occurrence order.
///
/// # Errors
///
/// [`TrainError::EmptyBatch`] when nothing survives; the caller must not skip
/// the update silently.
pub fn oversample_unique<G: Generator>(
    agent: &G,
    explore: Option<&G>,
    epsilon: f64,
    batch_size: usize,
    repeats: usize,
) -> Result<UniqueBatch> {
    let request = SampleRequest::new(batch_size).explore(explore, epsilon);
    let draws = (0..repeats)
        .map(|_| {
            agent
                .sample(&request)
                .map(|out| out.sequences)
                .map_err(|e| TrainError::generator("sampling", e))
        })
        .collect::<Result<Vec<_>>>()?;

    let pool = SequenceBatch::concat(agent.max_len(), draws)?;
    let pool_size = pool.len();
    let sequences = pool.unique();
    if sequences.is_empty() {
        return Err(TrainError::EmptyBatch { pool_size });
    }

    debug!(pool_size, unique = sequences.len(), "oversampled pool deduplicated");
    Ok(UniqueBatch {
        sequences,
        pool_size,
    })
}
