//! Token sequences and the vocabulary that turns them into molecule strings.

pub mod batch;
pub mod vocabulary;

pub use batch::{effective_len, SequenceBatch, Token, STOP};
pub use vocabulary::{SmilesVocabulary, Vocabulary};
