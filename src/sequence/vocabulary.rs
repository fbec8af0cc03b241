//! Token vocabulary for molecule strings.
//!
//! The trainers only need [`Vocabulary::decode`]; a decode failure marks the
//! row invalid instead of aborting the batch. [`SmilesVocabulary`] is the
//! file-backed implementation used by the CLI.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

use super::batch::{Token, STOP};

/// Name of the reserved stop token at index 0.
pub const STOP_SYMBOL: &str = "EOS";

/// Maps token sequences to molecule strings.
pub trait Vocabulary: Send + Sync {
    /// Number of tokens including the stop token.
    fn size(&self) -> usize;

    /// Decode one row up to its first stop token.
    fn decode(&self, tokens: &[Token]) -> Result<String>;
}

/// A SMILES vocabulary: index 0 is [`STOP_SYMBOL`], the rest are symbols
/// loaded from a file with one token per line.
#[derive(Debug, Clone)]
pub struct SmilesVocabulary {
    symbols: Vec<String>,
    index: HashMap<String, Token>,
    /// Longest symbol in characters, bounds the greedy tokenizer.
    longest: usize,
}

impl SmilesVocabulary {
    /// Build from symbols (the stop token is prepended automatically).
    pub fn new<I, S>(symbols: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![STOP_SYMBOL.to_string()];
        for s in symbols {
            let s = s.into();
            if s.is_empty() || s == STOP_SYMBOL {
                continue;
            }
            if all.contains(&s) {
                bail!("duplicate vocabulary symbol {s:?}");
            }
            all.push(s);
        }
        if all.len() > Token::MAX as usize {
            bail!("vocabulary of {} symbols does not fit the token type", all.len());
        }

        let index = all
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as Token))
            .collect();
        let longest = all.iter().skip(1).map(|s| s.chars().count()).max().unwrap_or(1);

        Ok(Self {
            symbols: all,
            index,
            longest,
        })
    }

    /// Load a vocabulary file with one symbol per line.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary from {}", path.display()))?;
        Self::new(text.lines().map(str::trim).filter(|l| !l.is_empty()))
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Greedy longest-match tokenization, terminated and padded with the stop
    /// token to `width`.
    pub fn encode(&self, smiles: &str, width: usize) -> Result<Vec<Token>> {
        let chars: Vec<char> = smiles.chars().collect();
        let mut out = Vec::with_capacity(width);
        let mut pos = 0;

        while pos < chars.len() {
            let max = self.longest.min(chars.len() - pos);
            let hit = (1..=max).rev().find_map(|n| {
                let piece: String = chars[pos..pos + n].iter().collect();
                self.index.get(&piece).map(|&tok| (tok, n))
            });
            match hit {
                Some((tok, n)) => {
                    out.push(tok);
                    pos += n;
                }
                None => bail!("unknown symbol at offset {pos} in {smiles:?}"),
            }
        }

        if out.len() >= width {
            bail!(
                "{smiles:?} needs {} tokens plus stop, row width is {width}",
                out.len()
            );
        }
        out.resize(width, STOP);
        Ok(out)
    }
}

impl Vocabulary for SmilesVocabulary {
    fn size(&self) -> usize {
        self.symbols.len()
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        let mut out = String::new();
        for &tok in tokens {
            if tok == STOP {
                break;
            }
            match self.symbols.get(tok as usize) {
                Some(sym) => out.push_str(sym),
                None => bail!("token {tok} outside vocabulary of {}", self.symbols.len()),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voc() -> SmilesVocabulary {
        SmilesVocabulary::new(["C", "N", "O", "c", "1", "(", ")", "=", "Cl", "[nH]"]).unwrap()
    }

    #[test]
    fn test_stop_is_index_zero() {
        let v = voc();
        assert_eq!(v.symbols()[0], STOP_SYMBOL);
        assert_eq!(v.size(), 11);
    }

    #[test]
    fn test_decode_stops_at_first_stop() {
        let v = voc();
        assert_eq!(v.decode(&[1, 2, 0, 3, 3]).unwrap(), "CN");
        assert_eq!(v.decode(&[0, 1]).unwrap(), "");
    }

    #[test]
    fn test_decode_out_of_range_fails() {
        let v = voc();
        assert!(v.decode(&[1, 99, 0]).is_err());
    }

    #[test]
    fn test_encode_prefers_longest_symbol() {
        let v = voc();
        let toks = v.encode("ClC[nH]", 6).unwrap();
        assert_eq!(toks, vec![9, 1, 10, 0, 0, 0]);
        assert_eq!(v.decode(&toks).unwrap(), "ClC[nH]");
    }

    #[test]
    fn test_encode_rejects_overlong_and_unknown() {
        let v = voc();
        assert!(v.encode("CCCC", 4).is_err());
        assert!(v.encode("CXC", 8).is_err());
    }

    #[test]
    fn test_load_from_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voc.txt");
        std::fs::write(&path, "C\n\nN\nEOS\nO\n").unwrap();
        let v = SmilesVocabulary::load_from_file(&path).unwrap();
        assert_eq!(v.symbols(), &["EOS", "C", "N", "O"]);
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        assert!(SmilesVocabulary::new(["C", "C"]).is_err());
    }
}
