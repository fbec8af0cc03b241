//! First-order softmax token model.
//!
//! Each row of the parameter matrix holds the logits of the next token given
//! the previous one; an extra row serves the start of a sequence. The hidden
//! state is therefore just the previous token, which makes resumption exact.
//!
//! The logits live in a candle [`VarMap`] and are updated with AdamW through
//! autograd. The model can be fitted to a corpus of encoded sequences
//! (smoothed log bigram counts) so that it can serve as the prior /
//! exploration network and as the agent's starting point.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::{AdamW, Init, Optimizer, ParamsAdamW, VarMap};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Generator, PolicyLoss, SampleRequest, SampledBatch, TokenLikelihoods};
use crate::sequence::{effective_len, SequenceBatch, Token, STOP};

/// Name of the logit matrix inside the [`VarMap`].
const LOGITS: &str = "logits";

/// Hidden state of [`MarkovGenerator`]: the previously emitted token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkovState {
    pub prev: Option<Token>,
}

/// On-disk form of a [`MarkovGenerator`].
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    vocab_size: usize,
    max_len: usize,
    learning_rate: f64,
    /// Row-major, `(vocab_size + 1) x vocab_size`.
    logits: Vec<f64>,
}

/// A bigram policy over a fixed vocabulary.
pub struct MarkovGenerator {
    vocab_size: usize,
    max_len: usize,
    varmap: VarMap,
    /// `(vocab_size + 1) x vocab_size`; the last row is the start row.
    logits: Tensor,
    optimizer: AdamW,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for MarkovGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkovGenerator")
            .field("vocab_size", &self.vocab_size)
            .field("max_len", &self.max_len)
            .field("learning_rate", &self.optimizer.learning_rate())
            .finish_non_exhaustive()
    }
}

fn adamw(varmap: &VarMap, learning_rate: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr: learning_rate,
        weight_decay: 0.0,
        ..ParamsAdamW::default()
    };
    Ok(AdamW::new(varmap.all_vars(), params)?)
}

impl MarkovGenerator {
    /// A uniform model. `seed` makes sampling reproducible.
    pub fn new(
        vocab_size: usize,
        max_len: usize,
        learning_rate: f64,
        seed: Option<u64>,
    ) -> Result<Self> {
        if vocab_size == 0 {
            bail!("generator vocabulary must not be empty");
        }
        let varmap = VarMap::new();
        let logits = varmap.get(
            (vocab_size + 1, vocab_size),
            LOGITS,
            Init::Const(0.0),
            DType::F64,
            &Device::Cpu,
        )?;
        let optimizer = adamw(&varmap, learning_rate)?;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            vocab_size,
            max_len,
            varmap,
            logits,
            optimizer,
            rng: Mutex::new(rng),
        })
    }

    /// An independent copy of the parameters with fresh optimizer moments
    /// and an entropy-seeded RNG.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::new(self.vocab_size, self.max_len, self.learning_rate(), None)?;
        copy.set_logits(self.logits()?)?;
        Ok(copy)
    }

    /// Set logits to smoothed log transition counts observed in `corpus`.
    pub fn fit(&mut self, corpus: &SequenceBatch, smoothing: f64) -> Result<()> {
        if smoothing <= 0.0 {
            bail!("smoothing must be positive, got {smoothing}");
        }
        let mut counts = vec![smoothing; (self.vocab_size + 1) * self.vocab_size];
        for row in corpus.rows() {
            let mut prev = None;
            for &tok in &row[..effective_len(row)] {
                self.check_token(tok)?;
                counts[self.row_index(prev) * self.vocab_size + tok as usize] += 1.0;
                prev = Some(tok);
            }
        }
        self.set_logits(counts.iter().map(|c| c.ln()).collect())?;
        debug!(sequences = corpus.len(), "fitted transition counts");
        Ok(())
    }

    /// Reseed the sampling RNG.
    pub fn reseed(&self, seed: u64) -> Result<()> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow!("generator RNG lock poisoned"))?;
        *rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Row-major copy of the logit matrix.
    pub fn logits(&self) -> Result<Vec<f64>> {
        Ok(self.logits.flatten_all()?.to_vec1::<f64>()?)
    }

    /// Overwrite the logit matrix and restart the optimizer.
    pub fn set_logits(&mut self, values: Vec<f64>) -> Result<()> {
        let expected = (self.vocab_size + 1) * self.vocab_size;
        if values.len() != expected {
            bail!("expected {expected} logits, got {}", values.len());
        }
        let values = Tensor::from_vec(
            values,
            (self.vocab_size + 1, self.vocab_size),
            self.logits.device(),
        )?;
        self.varmap.set_one(LOGITS, &values)?;
        self.optimizer = adamw(&self.varmap, self.learning_rate())?;
        Ok(())
    }

    /// Euclidean norm of all logits.
    pub fn parameter_norm(&self) -> Result<f64> {
        Ok(self.logits.sqr()?.sum_all()?.to_scalar::<f64>()?.sqrt())
    }

    /// Next-token distribution after `prev` (`None` at the start).
    pub fn probs(&self, prev: Option<Token>) -> Result<Vec<f64>> {
        let mut table = self.probability_table()?;
        Ok(table.swap_remove(self.row_index(prev)))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let checkpoint = Checkpoint {
            vocab_size: self.vocab_size,
            max_len: self.max_len,
            learning_rate: self.learning_rate(),
            logits: self.logits()?,
        };
        let json = serde_json::to_string(&checkpoint).context("Failed to serialize generator")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write generator to {}", path.display()))
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read generator from {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse generator from {}", path.display()))?;
        if checkpoint.logits.len() != (checkpoint.vocab_size + 1) * checkpoint.vocab_size {
            bail!(
                "corrupt generator checkpoint {}: {} logits for vocabulary of {}",
                path.display(),
                checkpoint.logits.len(),
                checkpoint.vocab_size
            );
        }
        let mut model = Self::new(
            checkpoint.vocab_size,
            checkpoint.max_len,
            checkpoint.learning_rate,
            None,
        )?;
        model.set_logits(checkpoint.logits)?;
        Ok(model)
    }

    // -- internal helpers ---------------------------------------------------

    fn row_index(&self, prev: Option<Token>) -> usize {
        prev.map_or(self.vocab_size, |t| t as usize)
    }

    fn log_probability_table(&self) -> Result<Vec<Vec<f64>>> {
        Ok(log_softmax(&self.logits, D::Minus1)?.to_vec2::<f64>()?)
    }

    fn probability_table(&self) -> Result<Vec<Vec<f64>>> {
        Ok(log_softmax(&self.logits, D::Minus1)?
            .exp()?
            .to_vec2::<f64>()?)
    }

    fn check_token(&self, tok: Token) -> Result<()> {
        if tok as usize >= self.vocab_size {
            bail!("token {tok} outside vocabulary of {}", self.vocab_size);
        }
        Ok(())
    }
}

fn draw(rng: &mut StdRng, probs: &[f64]) -> Result<Token> {
    let dist = WeightedIndex::new(probs)
        .map_err(|e| anyhow!("degenerate next-token distribution: {e}"))?;
    Ok(dist.sample(rng) as Token)
}

impl Generator for MarkovGenerator {
    type State = MarkovState;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    fn sample(&self, request: &SampleRequest<'_, Self>) -> Result<SampledBatch<MarkovState>> {
        if !(0.0..=1.0).contains(&request.epsilon) {
            bail!("epsilon must lie in [0, 1], got {}", request.epsilon);
        }
        let partner = match request.explore {
            Some(partner) if partner.vocab_size != self.vocab_size => bail!(
                "exploration model vocabulary {} differs from agent vocabulary {}",
                partner.vocab_size,
                self.vocab_size
            ),
            Some(partner) => Some(partner.probability_table()?),
            None => None,
        };
        let own = self.probability_table()?;

        // Starting point of every row: (previous token, first position to generate).
        let starts: Vec<(MarkovState, bool, usize)> = match request.resume {
            Some(conts) => {
                let position = conts.first().map_or(0, |c| c.position);
                if position > self.max_len {
                    bail!("cannot resume at position {position} past max length {}", self.max_len);
                }
                conts
                    .iter()
                    .map(|c| {
                        if c.position != position {
                            bail!("continuations mix positions {position} and {}", c.position);
                        }
                        self.check_token(c.last_token)?;
                        Ok((c.state, c.last_token == STOP, position))
                    })
                    .collect::<Result<_>>()?
            }
            None => vec![(MarkovState { prev: None }, false, 0); request.batch_size],
        };

        let width = self.max_len - starts.first().map_or(0, |s| s.2);
        let mut guard = self
            .rng
            .lock()
            .map_err(|_| anyhow!("generator RNG lock poisoned"))?;
        let rng = &mut *guard;

        let mut sequences = SequenceBatch::with_capacity(width, starts.len());
        let mut all_states = Vec::with_capacity(if request.keep_states { starts.len() } else { 0 });

        for (mut state, mut done, _) in starts {
            let mut row = Vec::with_capacity(width);
            let mut row_states = Vec::with_capacity(width);
            for _ in 0..width {
                if done {
                    row.push(STOP);
                } else {
                    let table = match &partner {
                        Some(table) if rng.gen_bool(request.epsilon) => table,
                        _ => &own,
                    };
                    let tok = draw(rng, &table[self.row_index(state.prev)])?;
                    row.push(tok);
                    state.prev = Some(tok);
                    done = tok == STOP;
                }
                if request.keep_states {
                    row_states.push(state);
                }
            }
            sequences.push(row)?;
            if request.keep_states {
                all_states.push(row_states);
            }
        }

        Ok(SampledBatch {
            sequences,
            states: request.keep_states.then_some(all_states),
        })
    }

    fn likelihood(&self, sequences: &SequenceBatch) -> Result<TokenLikelihoods<MarkovState>> {
        let table = self.log_probability_table()?;
        let mut log_probs = Vec::with_capacity(sequences.len());
        let mut states = Vec::with_capacity(sequences.len());

        for row in sequences.rows() {
            let len = effective_len(row);
            let mut state = MarkovState { prev: None };
            let mut lp = vec![0.0; row.len()];
            let mut st = Vec::with_capacity(row.len());
            for (t, &tok) in row.iter().enumerate() {
                if t < len {
                    self.check_token(tok)?;
                    lp[t] = table[self.row_index(state.prev)][tok as usize];
                    state.prev = Some(tok);
                }
                st.push(state);
            }
            log_probs.push(lp);
            states.push(st);
        }

        Ok(TokenLikelihoods { log_probs, states })
    }

    /// Gradients are recomputed by every backward pass, so nothing
    /// accumulates between steps.
    fn zero_grad(&mut self) {}

    fn optimize(&mut self, loss: &PolicyLoss) -> Result<()> {
        let batch = &loss.sequences;
        if batch.is_empty() {
            bail!("cannot optimize an empty batch");
        }
        if loss.weights.len() != batch.len() {
            bail!(
                "loss weights have {} rows for {} sequences",
                loss.weights.len(),
                batch.len()
            );
        }

        // One entry per weighted token: (logit row, emitted token, weight).
        let mut rows = Vec::new();
        let mut tokens = Vec::new();
        let mut weights = Vec::new();
        for (row, row_weights) in batch.rows().iter().zip(&loss.weights) {
            let mut prev = None;
            for (t, &tok) in row[..effective_len(row)].iter().enumerate() {
                self.check_token(tok)?;
                if row_weights[t] != 0.0 {
                    rows.push(self.row_index(prev) as u32);
                    tokens.push(tok);
                    weights.push(row_weights[t]);
                }
                prev = Some(tok);
            }
        }
        if weights.is_empty() {
            return Ok(());
        }

        let n = weights.len();
        let device = self.logits.device();
        let picked = log_softmax(&self.logits, D::Minus1)?
            .index_select(&Tensor::from_vec(rows, n, device)?, 0)?
            .gather(&Tensor::from_vec(tokens, (n, 1), device)?, 1)?
            .squeeze(1)?;
        let weights = Tensor::from_vec(weights, n, device)?;
        let objective = (picked.mul(&weights)?.sum_all()?.neg()? / batch.len() as f64)?;
        self.optimizer.backward_step(&objective)?;
        Ok(())
    }

    fn scale_learning_rate(&mut self, factor: f64) {
        let lr = self.optimizer.learning_rate() * factor;
        self.optimizer.set_learning_rate(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::Continuation;

    /// A model that (almost) always emits `next` after every token.
    fn peaked(vocab: usize, max_len: usize, next: Token, seed: u64) -> MarkovGenerator {
        let mut g = MarkovGenerator::new(vocab, max_len, 1e-2, Some(seed)).unwrap();
        let mut logits = g.logits().unwrap();
        for r in 0..=vocab {
            logits[r * vocab + next as usize] = 50.0;
        }
        g.set_logits(logits).unwrap();
        g
    }

    #[test]
    fn test_sample_is_reproducible_with_seed() {
        let a = MarkovGenerator::new(6, 8, 1e-3, Some(7)).unwrap();
        let b = MarkovGenerator::new(6, 8, 1e-3, Some(7)).unwrap();
        let sa = a.sample(&SampleRequest::new(16)).unwrap();
        let sb = b.sample(&SampleRequest::new(16)).unwrap();
        assert_eq!(sa.sequences, sb.sequences);
        assert_eq!(sa.sequences.len(), 16);
        assert_eq!(sa.sequences.width(), 8);
        assert!(sa.states.is_none());
    }

    #[test]
    fn test_sample_pads_after_stop() {
        let g = MarkovGenerator::new(4, 12, 1e-3, Some(1)).unwrap();
        let out = g.sample(&SampleRequest::new(64)).unwrap();
        for row in out.sequences.rows() {
            let len = effective_len(row);
            assert!(row[len..].iter().all(|&t| t == STOP));
        }
    }

    #[test]
    fn test_epsilon_one_follows_explorer() {
        let agent = peaked(5, 6, 3, 11);
        let explorer = peaked(5, 6, 2, 12);
        let out = agent
            .sample(&SampleRequest::new(8).explore(Some(&explorer), 1.0))
            .unwrap();
        for row in out.sequences.rows() {
            assert!(row.iter().all(|&t| t == 2), "row {row:?}");
        }

        let out = agent
            .sample(&SampleRequest::new(8).explore(Some(&explorer), 0.0))
            .unwrap();
        for row in out.sequences.rows() {
            assert!(row.iter().all(|&t| t == 3), "row {row:?}");
        }
    }

    #[test]
    fn test_invalid_epsilon_rejected() {
        let g = MarkovGenerator::new(3, 4, 1e-3, Some(0)).unwrap();
        assert!(g.sample(&SampleRequest::new(1).explore(None, 1.5)).is_err());
    }

    #[test]
    fn test_resume_generates_remaining_width() {
        let g = peaked(5, 6, 4, 3);
        let conts = vec![
            Continuation {
                last_token: 1,
                state: MarkovState { prev: Some(1) },
                position: 2,
            },
            Continuation {
                last_token: STOP,
                state: MarkovState { prev: Some(STOP) },
                position: 2,
            },
        ];
        let out = g.sample(&SampleRequest::new(0).resume(&conts)).unwrap();
        assert_eq!(out.sequences.width(), 4);
        assert_eq!(out.sequences.row(0), &[4, 4, 4, 4]);
        // A row that already stopped stays padded.
        assert_eq!(out.sequences.row(1), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_resume_rejects_mixed_positions() {
        let g = MarkovGenerator::new(3, 4, 1e-3, Some(0)).unwrap();
        let conts = vec![
            Continuation {
                last_token: 1,
                state: MarkovState { prev: Some(1) },
                position: 1,
            },
            Continuation {
                last_token: 1,
                state: MarkovState { prev: Some(1) },
                position: 2,
            },
        ];
        assert!(g.sample(&SampleRequest::new(0).resume(&conts)).is_err());
    }

    #[test]
    fn test_likelihood_matches_probs_and_zeroes_padding() {
        let g = MarkovGenerator::new(4, 4, 1e-3, Some(0)).unwrap();
        let batch = SequenceBatch::from_rows(4, vec![vec![1, 2, 0, 0]]).unwrap();
        let tl = g.likelihood(&batch).unwrap();
        let uniform = (0.25f64).ln();
        assert!((tl.log_probs[0][0] - uniform).abs() < 1e-12);
        assert!((tl.log_probs[0][2] - uniform).abs() < 1e-12);
        assert_eq!(tl.log_probs[0][3], 0.0);
        assert_eq!(tl.states[0][1], MarkovState { prev: Some(2) });
    }

    #[test]
    fn test_states_from_sample_allow_exact_resume() {
        let g = MarkovGenerator::new(5, 6, 1e-3, Some(9)).unwrap();
        let out = g.sample(&SampleRequest::new(4).keep_states()).unwrap();
        let states = out.states.unwrap();
        for (i, row) in out.sequences.rows().iter().enumerate() {
            assert_eq!(states[i].len(), 6);
            assert_eq!(states[i][0].prev, Some(row[0]));
        }
    }

    #[test]
    fn test_positive_reward_raises_likelihood() {
        let mut g = MarkovGenerator::new(4, 4, 5e-2, Some(0)).unwrap();
        let batch = SequenceBatch::from_rows(4, vec![vec![1, 2, 3, 0]]).unwrap();
        let before = g.likelihood(&batch).unwrap().per_sequence()[0];

        for _ in 0..20 {
            let lp = g.likelihood(&batch).unwrap().log_probs;
            let loss = PolicyLoss::from_sequence_rewards(batch.clone(), &lp, &[1.0]).unwrap();
            g.zero_grad();
            g.optimize(&loss).unwrap();
        }

        let after = g.likelihood(&batch).unwrap().per_sequence()[0];
        assert!(after > before, "before {before}, after {after}");
    }

    #[test]
    fn test_fit_prefers_corpus_transitions() {
        let mut g = MarkovGenerator::new(4, 5, 1e-3, Some(0)).unwrap();
        let corpus = SequenceBatch::from_rows(
            5,
            vec![vec![1, 2, 3, 0, 0], vec![1, 2, 0, 0, 0], vec![1, 3, 0, 0, 0]],
        )
        .unwrap();
        g.fit(&corpus, 0.1).unwrap();
        let start = g.probs(None).unwrap();
        assert!(start[1] > 0.9);
        let after_one = g.probs(Some(1)).unwrap();
        assert!(after_one[2] > after_one[3]);
        assert!(g.fit(&corpus, 0.0).is_err());
    }

    #[test]
    fn test_checkpoint_round_trip_keeps_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let mut g = MarkovGenerator::new(4, 5, 1e-3, Some(0)).unwrap();
        let mut logits = g.logits().unwrap();
        logits[3] = 1.25;
        g.set_logits(logits).unwrap();
        g.save_to_file(&path).unwrap();

        let loaded = MarkovGenerator::load_from_file(&path).unwrap();
        assert_eq!(loaded.logits().unwrap(), g.logits().unwrap());
        assert_eq!(loaded.max_len(), 5);
        let norm = g.parameter_norm().unwrap();
        assert!((loaded.parameter_norm().unwrap() - norm).abs() < 1e-12);
    }

    #[test]
    fn test_scale_learning_rate() {
        let mut g = MarkovGenerator::new(3, 3, 1e-3, Some(0)).unwrap();
        g.scale_learning_rate(0.99);
        assert!((g.learning_rate() - 0.99e-3).abs() < 1e-15);
    }

    #[test]
    fn test_zero_weights_leave_parameters_untouched() {
        let mut g = MarkovGenerator::new(4, 4, 5e-2, Some(0)).unwrap();
        let batch = SequenceBatch::from_rows(4, vec![vec![1, 2, 0, 0]]).unwrap();
        let lp = g.likelihood(&batch).unwrap().log_probs;
        let loss = PolicyLoss::from_sequence_rewards(batch, &lp, &[0.0]).unwrap();
        g.optimize(&loss).unwrap();
        assert_eq!(g.parameter_norm().unwrap(), 0.0);
    }

    #[test]
    fn test_clone_does_not_share_parameters() {
        let mut agent = MarkovGenerator::new(4, 4, 5e-2, Some(0)).unwrap();
        let prior = agent.try_clone().unwrap();
        let batch = SequenceBatch::from_rows(4, vec![vec![1, 2, 3, 0]]).unwrap();
        let lp = agent.likelihood(&batch).unwrap().log_probs;
        let loss = PolicyLoss::from_sequence_rewards(batch, &lp, &[1.0]).unwrap();
        agent.optimize(&loss).unwrap();

        assert!(agent.parameter_norm().unwrap() > 0.0);
        assert_eq!(prior.parameter_norm().unwrap(), 0.0);
    }

    #[test]
    fn test_reseed_restarts_sampling() {
        let g = MarkovGenerator::new(6, 8, 1e-3, None).unwrap();
        g.reseed(3).unwrap();
        let first = g.sample(&SampleRequest::new(8)).unwrap().sequences;
        g.reseed(3).unwrap();
        let second = g.sample(&SampleRequest::new(8)).unwrap().sequences;
        assert_eq!(first, second);
    }

    #[test]
    fn test_reseed_reports_poisoned_lock() {
        let g = MarkovGenerator::new(3, 4, 1e-3, Some(0)).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = g.rng.lock().unwrap();
            panic!("sampler panicked");
        }));
        assert!(result.is_err());

        let err = g.reseed(1).unwrap_err();
        assert!(err.to_string().contains("poisoned"));
        assert!(g.sample(&SampleRequest::new(1)).is_err());
    }
}
