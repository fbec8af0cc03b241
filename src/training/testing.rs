//! Scripted collaborators shared by the trainer tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::env::{Environment, ScoredBatch};
use crate::generator::{
    Generator, MarkovGenerator, MarkovState, PolicyLoss, SampleRequest, SampledBatch,
    TokenLikelihoods,
};
use crate::sequence::{SequenceBatch, SmilesVocabulary, Token};

/// `C`=1, `N`=2, `O`=3, `c`=4.
pub(crate) fn test_vocabulary() -> SmilesVocabulary {
    SmilesVocabulary::new(["C", "N", "O", "c"]).unwrap()
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Returns a fixed script for fresh samples and delegates resumption,
/// likelihoods and updates to a seeded Markov model.
pub(crate) struct ScriptedGenerator {
    script: SequenceBatch,
    inner: MarkovGenerator,
}

impl ScriptedGenerator {
    pub(crate) fn new(vocab_size: usize, rows: Vec<Vec<Token>>) -> Self {
        let width = rows.first().map_or(0, |r| r.len());
        Self {
            script: SequenceBatch::from_rows(width, rows).unwrap(),
            inner: MarkovGenerator::new(vocab_size, width, 0.05, Some(7)).unwrap(),
        }
    }

    pub(crate) fn parameter_norm(&self) -> f64 {
        self.inner.parameter_norm().unwrap()
    }
}

impl Generator for ScriptedGenerator {
    type State = MarkovState;

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn max_len(&self) -> usize {
        self.inner.max_len()
    }

    fn sample(&self, request: &SampleRequest<'_, Self>) -> Result<SampledBatch<MarkovState>> {
        if let Some(conts) = request.resume {
            let mut inner = SampleRequest::new(conts.len())
                .explore(request.explore.map(|g| &g.inner), request.epsilon)
                .resume(conts);
            inner.keep_states = request.keep_states;
            return self.inner.sample(&inner);
        }
        let states = if request.keep_states {
            Some(self.inner.likelihood(&self.script)?.states)
        } else {
            None
        };
        Ok(SampledBatch {
            sequences: self.script.clone(),
            states,
        })
    }

    fn likelihood(&self, sequences: &SequenceBatch) -> Result<TokenLikelihoods<MarkovState>> {
        self.inner.likelihood(sequences)
    }

    fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    fn optimize(&mut self, loss: &PolicyLoss) -> Result<()> {
        self.inner.optimize(loss)
    }

    fn scale_learning_rate(&mut self, factor: f64) {
        self.inner.scale_learning_rate(factor);
    }
}

/// Records every sampling call, whether it carried an exploration partner,
/// and every resume position.
pub(crate) struct CountingGenerator<G> {
    pub(crate) inner: G,
    samples: AtomicUsize,
    explored: Mutex<Vec<bool>>,
    resumed: Mutex<Vec<usize>>,
}

impl<G: Generator> CountingGenerator<G> {
    pub(crate) fn new(inner: G) -> Self {
        Self {
            inner,
            samples: AtomicUsize::new(0),
            explored: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sample_calls(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    /// For every sampling call, in order: was a partner passed?
    pub(crate) fn explored(&self) -> Vec<bool> {
        self.explored.lock().unwrap().clone()
    }

    /// Position of every resumed row, in call order.
    pub(crate) fn resumed_positions(&self) -> Vec<usize> {
        self.resumed.lock().unwrap().clone()
    }
}

impl<G: Generator> Generator for CountingGenerator<G> {
    type State = G::State;

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn max_len(&self) -> usize {
        self.inner.max_len()
    }

    fn sample(&self, request: &SampleRequest<'_, Self>) -> Result<SampledBatch<G::State>> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        self.explored
            .lock()
            .unwrap()
            .push(request.explore.is_some());
        if let Some(conts) = request.resume {
            self.resumed
                .lock()
                .unwrap()
                .extend(conts.iter().map(|c| c.position));
        }
        let inner = SampleRequest {
            batch_size: request.batch_size,
            explore: request.explore.map(|g| &g.inner),
            epsilon: request.epsilon,
            resume: request.resume,
            keep_states: request.keep_states,
        };
        self.inner.sample(&inner)
    }

    fn likelihood(&self, sequences: &SequenceBatch) -> Result<TokenLikelihoods<G::State>> {
        self.inner.likelihood(sequences)
    }

    fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    fn optimize(&mut self, loss: &PolicyLoss) -> Result<()> {
        self.inner.optimize(loss)
    }
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// Looks molecules up in a fixed table; unknown molecules get the default.
pub(crate) struct TableEnvironment {
    table: HashMap<String, (f64, bool)>,
    default: (f64, bool),
    calls: Mutex<Vec<usize>>,
}

impl TableEnvironment {
    pub(crate) fn new(entries: &[(&str, f64, bool)]) -> Self {
        Self {
            table: entries
                .iter()
                .map(|&(m, s, v)| (m.to_string(), (s, v)))
                .collect(),
            default: (0.0, false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_default(mut self, score: f64, valid: bool) -> Self {
        self.default = (score, valid);
        self
    }

    /// Batch size of every scoring call.
    pub(crate) fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

impl Environment for TableEnvironment {
    async fn score(&self, molecules: &[String]) -> Result<ScoredBatch> {
        self.calls.lock().unwrap().push(molecules.len());
        let mut out = ScoredBatch::with_capacity(molecules.len());
        for m in molecules {
            let (s, v) = self.table.get(m).copied().unwrap_or(self.default);
            out.push(s, v);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "table"
    }
}

/// Every molecule is valid and scores `mean` plus uniform noise in
/// `[-spread, spread)`.
pub(crate) struct NoisyEnvironment {
    mean: f64,
    spread: f64,
    rng: Mutex<StdRng>,
}

impl NoisyEnvironment {
    pub(crate) fn new(mean: f64, spread: f64, seed: u64) -> Self {
        Self {
            mean,
            spread,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Environment for NoisyEnvironment {
    async fn score(&self, molecules: &[String]) -> Result<ScoredBatch> {
        let mut rng = self.rng.lock().unwrap();
        let mut out = ScoredBatch::with_capacity(molecules.len());
        for _ in molecules {
            out.push(self.mean + rng.gen_range(-self.spread..self.spread), true);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "noisy"
    }
}

/// Fails every batch.
pub(crate) struct FailingEnvironment;

impl Environment for FailingEnvironment {
    async fn score(&self, _molecules: &[String]) -> Result<ScoredBatch> {
        bail!("scorer crashed")
    }

    fn name(&self) -> &str {
        "failing"
    }
}
