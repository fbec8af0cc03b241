//! Fixed-width token batches.
//!
//! A row is a complete generated sequence: tokens up to and including the
//! first [`STOP`] are real choices, everything after it is padding. Padding
//! positions are excluded from the loss via [`SequenceBatch::loss_mask`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// A vocabulary index.
pub type Token = u32;

/// Reserved stop / padding token.
pub const STOP: Token = 0;

/// Number of positions in `row` that carry a real choice: everything up to
/// and including the first stop token, or the whole row if it never stops.
pub fn effective_len(row: &[Token]) -> usize {
    match row.iter().position(|&t| t == STOP) {
        Some(idx) => idx + 1,
        None => row.len(),
    }
}

/// An ordered collection of equal-width token sequences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceBatch {
    width: usize,
    rows: Vec<Vec<Token>>,
}

impl SequenceBatch {
    /// Create an empty batch whose rows will all have `width` tokens.
    pub fn new(width: usize) -> Self {
        Self {
            width,
            rows: Vec::new(),
        }
    }

    /// Build a batch from rows, rejecting ragged input.
    pub fn from_rows(width: usize, rows: Vec<Vec<Token>>) -> Result<Self> {
        let mut batch = Self::with_capacity(width, rows.len());
        for row in rows {
            batch.push(row)?;
        }
        Ok(batch)
    }

    /// An empty batch with room for `capacity` rows.
    pub fn with_capacity(width: usize, capacity: usize) -> Self {
        Self {
            width,
            rows: Vec::with_capacity(capacity),
        }
    }

    /// Append one row; its length must equal the batch width.
    pub fn push(&mut self, row: Vec<Token>) -> Result<()> {
        if row.len() != self.width {
            return Err(TrainError::shape("sequence row", self.width, row.len()));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Concatenate batches of the same width, preserving order.
    pub fn concat(width: usize, batches: impl IntoIterator<Item = SequenceBatch>) -> Result<Self> {
        let mut out = Self::new(width);
        for batch in batches {
            if batch.width != width {
                return Err(TrainError::shape("batch width", width, batch.width));
            }
            out.rows.extend(batch.rows);
        }
        Ok(out)
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tokens per row, padding included.
    pub fn width(&self) -> usize {
        self.width
    }

    /// All rows in batch order.
    pub fn rows(&self) -> &[Vec<Token>] {
        &self.rows
    }

    /// Row `i`. Panics when out of range, like slice indexing.
    pub fn row(&self, i: usize) -> &[Token] {
        &self.rows[i]
    }

    /// Shape as `rows x width`, used in error context.
    pub fn shape(&self) -> String {
        format!("{}x{}", self.rows.len(), self.width)
    }

    /// Whether row `i` still has a real (non-stop) token at position `t`.
    pub fn is_open(&self, i: usize, t: usize) -> bool {
        self.rows[i][t] != STOP
    }

    /// Largest effective length over all rows.
    pub fn max_effective_len(&self) -> usize {
        self.rows.iter().map(|r| effective_len(r)).max().unwrap_or(0)
    }

    /// `mask[i][t]` is true for positions that contribute to the loss.
    pub fn loss_mask(&self) -> Vec<Vec<bool>> {
        self.rows
            .iter()
            .map(|row| {
                let len = effective_len(row);
                (0..self.width).map(|t| t < len).collect()
            })
            .collect()
    }

    /// Rows that are unique by exact token equality, in first-occurrence order.
    pub fn unique(&self) -> SequenceBatch {
        let mut seen: HashSet<&[Token]> = HashSet::with_capacity(self.rows.len());
        let rows = self
            .rows
            .iter()
            .filter(|row| seen.insert(row.as_slice()))
            .cloned()
            .collect();
        SequenceBatch {
            width: self.width,
            rows,
        }
    }
}
