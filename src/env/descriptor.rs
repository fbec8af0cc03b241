//! Weighted-sum desirability over string-level descriptors.
//!
//! Each objective computes a raw descriptor from the SMILES string, maps it
//! through a [`ClippedScore`] ramp into [0, 1] and contributes to a
//! weight-normalised sum. Molecules failing the structural syntax check get a
//! score of 0 and `valid = false`.
//!
//! The descriptors are deliberately cheap approximations computed from the
//! string alone (atom counts, ring closures, branches); predicted bioactivity
//! and other chemistry-backed objectives are served by [`super::remote`].

use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{Environment, ScoredBatch};

// ---------------------------------------------------------------------------
// Score modifier
// ---------------------------------------------------------------------------

/// Linear ramp from `lower_x` (score 0) to `upper_x` (score 1), clipped to
/// [0, 1]. With `lower_x > upper_x` the ramp is decreasing, which penalises
/// large values. With equal bounds it is a step at that value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClippedScore {
    pub lower_x: f64,
    pub upper_x: f64,
}

impl ClippedScore {
    pub fn new(lower_x: f64, upper_x: f64) -> Self {
        Self { lower_x, upper_x }
    }

    pub fn apply(&self, x: f64) -> f64 {
        if self.lower_x == self.upper_x {
            return if x >= self.lower_x { 1.0 } else { 0.0 };
        }
        ((x - self.lower_x) / (self.upper_x - self.lower_x)).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// String-level molecular descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    /// Number of atoms (organic-subset, aromatic and bracket atoms).
    HeavyAtoms,
    /// Number of ring closures.
    Rings,
    /// Fraction of atoms that are not carbon.
    HeteroatomFraction,
    /// Fraction of atoms written in aromatic (lower-case) form.
    AromaticFraction,
    /// Number of branches.
    Branches,
}

#[derive(Debug, Default)]
struct Composition {
    atoms: usize,
    carbons: usize,
    aromatic: usize,
    rings: usize,
    branches: usize,
}

impl Descriptor {
    fn value(&self, c: &Composition) -> f64 {
        let frac = |n: usize| {
            if c.atoms == 0 {
                0.0
            } else {
                n as f64 / c.atoms as f64
            }
        };
        match self {
            Self::HeavyAtoms => c.atoms as f64,
            Self::Rings => c.rings as f64,
            Self::HeteroatomFraction => frac(c.atoms - c.carbons),
            Self::AromaticFraction => frac(c.aromatic),
            Self::Branches => c.branches as f64,
        }
    }
}

const ORGANIC: &[&str] = &["Cl", "Br", "B", "C", "N", "O", "P", "S", "F", "I"];
const AROMATIC: &[char] = &['b', 'c', 'n', 'o', 'p', 's'];
const BONDS: &[char] = &['-', '=', '#', '$', ':', '/', '\\', '.'];

/// What the previous symbol was, which decides what may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    Start,
    Atom,
    Ring,
    Bond,
    Open,
    Close,
}

/// Element symbol of a bracket atom body such as `13CH3` or `nH`.
fn bracket_element(inner: &str) -> &str {
    let body = inner.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut chars = body.char_indices();
    match chars.next() {
        Some((_, first)) if first.is_ascii_uppercase() => match chars.next() {
            Some((idx, second)) if second.is_ascii_lowercase() => &body[..idx + 1],
            _ => &body[..1],
        },
        Some((_, first)) if first.is_ascii_lowercase() => &body[..1],
        _ => "",
    }
}

/// Parse `smiles` far enough to reject structurally broken strings and count
/// what the descriptors need.
fn parse(smiles: &str) -> Result<Composition> {
    let chars: Vec<char> = smiles.chars().collect();
    let mut comp = Composition::default();
    let mut depth = 0usize;
    let mut open_rings: HashSet<u32> = HashSet::new();
    let mut prev = Prev::Start;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '[' => {
                let Some(close) = chars[i..].iter().position(|&c| c == ']') else {
                    bail!("unterminated bracket atom at {i}");
                };
                let inner: String = chars[i + 1..i + close].iter().collect();
                let element = bracket_element(&inner);
                if element.is_empty() {
                    bail!("bracket atom without element at {i}");
                }
                comp.atoms += 1;
                if element.starts_with(|c: char| c.is_ascii_lowercase()) {
                    comp.aromatic += 1;
                }
                if element.eq_ignore_ascii_case("c") {
                    comp.carbons += 1;
                }
                prev = Prev::Atom;
                i += close + 1;
            }
            '(' => {
                if !matches!(prev, Prev::Atom | Prev::Ring | Prev::Close) {
                    bail!("branch opened without a preceding atom at {i}");
                }
                depth += 1;
                comp.branches += 1;
                prev = Prev::Open;
                i += 1;
            }
            ')' => {
                if depth == 0 {
                    bail!("unbalanced ')' at {i}");
                }
                if !matches!(prev, Prev::Atom | Prev::Ring | Prev::Close) {
                    bail!("empty or dangling branch at {i}");
                }
                depth -= 1;
                prev = Prev::Close;
                i += 1;
            }
            '0'..='9' | '%' => {
                if !matches!(prev, Prev::Atom | Prev::Ring | Prev::Bond) {
                    bail!("ring closure without a preceding atom at {i}");
                }
                let label = if ch == '%' {
                    let digits: String = chars.iter().skip(i + 1).take(2).collect();
                    let Ok(n) = digits.parse::<u32>() else {
                        bail!("malformed two-digit ring label at {i}");
                    };
                    if digits.len() != 2 {
                        bail!("malformed two-digit ring label at {i}");
                    }
                    i += 3;
                    n + 100
                } else {
                    i += 1;
                    ch.to_digit(10).unwrap_or(0)
                };
                if !open_rings.remove(&label) {
                    open_rings.insert(label);
                    comp.rings += 1;
                }
                prev = Prev::Ring;
            }
            c if BONDS.contains(&c) => {
                if matches!(prev, Prev::Start | Prev::Bond) {
                    bail!("bond {c:?} without a preceding atom at {i}");
                }
                prev = Prev::Bond;
                i += 1;
            }
            c if AROMATIC.contains(&c) => {
                comp.atoms += 1;
                comp.aromatic += 1;
                if c == 'c' {
                    comp.carbons += 1;
                }
                prev = Prev::Atom;
                i += 1;
            }
            _ => {
                let rest: String = chars.iter().skip(i).take(2).collect();
                let Some(sym) = ORGANIC.iter().find(|s| rest.starts_with(**s)) else {
                    bail!("unexpected character {ch:?} at {i}");
                };
                comp.atoms += 1;
                if *sym == "C" {
                    comp.carbons += 1;
                }
                prev = Prev::Atom;
                i += sym.len();
            }
        }
    }

    if comp.atoms == 0 {
        bail!("no atoms");
    }
    if matches!(prev, Prev::Bond | Prev::Open) {
        bail!("dangling bond or branch at end");
    }
    if depth != 0 {
        bail!("{depth} unclosed branch(es)");
    }
    if !open_rings.is_empty() {
        bail!("{} unclosed ring(s)", open_rings.len());
    }
    Ok(comp)
}

/// Structural check used as the validity flag.
pub fn is_well_formed(smiles: &str) -> bool {
    parse(smiles).is_ok()
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// One term of the weighted sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub descriptor: Descriptor,
    pub modifier: ClippedScore,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Weighted-sum desirability environment.
#[derive(Debug, Clone)]
pub struct DescriptorEnvironment {
    objectives: Vec<Objective>,
    total_weight: f64,
}

impl DescriptorEnvironment {
    pub fn new(objectives: Vec<Objective>) -> Result<Self> {
        if objectives.is_empty() {
            bail!("descriptor environment needs at least one objective");
        }
        if objectives.iter().any(|o| o.weight < 0.0) {
            bail!("objective weights must be non-negative");
        }
        let total_weight: f64 = objectives.iter().map(|o| o.weight).sum();
        if total_weight <= 0.0 {
            bail!("objective weights sum to zero");
        }
        Ok(Self {
            objectives,
            total_weight,
        })
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    fn desirability(&self, comp: &Composition) -> f64 {
        self.objectives
            .iter()
            .map(|o| o.weight * o.modifier.apply(o.descriptor.value(comp)))
            .sum::<f64>()
            / self.total_weight
    }
}

impl Environment for DescriptorEnvironment {
    async fn score(&self, molecules: &[String]) -> Result<ScoredBatch> {
        let mut out = ScoredBatch::with_capacity(molecules.len());
        for smiles in molecules {
            match parse(smiles) {
                Ok(comp) => out.push(self.desirability(&comp), true),
                Err(e) => {
                    debug!(smiles = %smiles, reason = %e, "structurally invalid molecule");
                    out.push(0.0, false);
                }
            }
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "descriptors"
    }
}
