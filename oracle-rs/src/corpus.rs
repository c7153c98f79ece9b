// oracle-rs/src/corpus.rs
// Immutable corpus of reference presets with precomputed vectors.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use shared_types::{EngineId, Preset};

use crate::error::{OracleError, Result};
use crate::index::BruteForceIndex;
use crate::vectorizer::Vectorizer;

#[derive(Debug, Clone)]
pub struct CorpusEntry {
    /// Stable identity: position in the corpus.
    pub index: usize,
    pub preset: Preset,
    pub vector: Vec<f32>,
    pub tags: Vec<EngineId>,
}

#[derive(Debug, Clone, Default)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CorpusFile {
    Bare(Vec<Preset>),
    Wrapped { presets: Vec<Preset> },
}

impl Corpus {
    pub fn build(presets: Vec<Preset>, vectorizer: &Vectorizer) -> Self {
        let entries = presets
            .into_iter()
            .enumerate()
            .map(|(index, preset)| CorpusEntry {
                index,
                vector: vectorizer.vectorize(&preset),
                tags: preset.tags(),
                preset,
            })
            .collect();
        Self { entries }
    }

    /// Parses either a bare JSON array of presets or `{"presets": [...]}`.
    pub fn from_json_str(json: &str, vectorizer: &Vectorizer) -> Result<Self> {
        let presets = match serde_json::from_str::<CorpusFile>(json)? {
            CorpusFile::Bare(presets) => presets,
            CorpusFile::Wrapped { presets } => presets,
        };
        Ok(Self::build(presets, vectorizer))
    }

    pub fn load<P: AsRef<Path>>(path: P, vectorizer: &Vectorizer) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| OracleError::CorpusRead {
            path: path.display().to_string(),
            source,
        })?;
        let corpus = Self::from_json_str(&json, vectorizer)?;
        tracing::info!(path = %path.display(), entries = corpus.len(), "Loaded preset corpus");
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CorpusEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn build_index(&self) -> Result<BruteForceIndex> {
        BruteForceIndex::build(self.entries.iter().map(|e| e.vector.clone()).collect())
    }
}
