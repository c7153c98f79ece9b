//! # Oracle
//!
//! Picks the best pre-built preset from a corpus for an interpreted prompt.
//!
//! Presets are embedded by [`Vectorizer`] (character block, hashed engine
//! presence block, complexity scalar), searched through a [`NearestNeighbors`]
//! index, re-scored by explicit engine matching in [`Oracle`], and finally
//! rewritten by [`adapt`] so every required engine is present.

pub mod adaptation;
pub mod corpus;
pub mod error;
pub mod index;
pub mod ranking;
pub mod vectorizer;

pub use adaptation::adapt;
pub use corpus::{Corpus, CorpusEntry};
pub use error::{OracleError, Result};
pub use index::{BruteForceIndex, Neighbor, NearestNeighbors};
pub use ranking::{Candidate, Oracle, RankingConfig, Selection};
pub use vectorizer::Vectorizer;
