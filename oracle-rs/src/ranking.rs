//! Tag-aware re-ranking of nearest neighbours.
//!
//! Each of the top-K neighbours is scored as
//! `similarity_weight / (1 + distance) + match_weight * match_count`, where
//! `match_count` counts required engines the entry actually contains. With
//! `match_weight` well above `similarity_weight`, a single exact match
//! outweighs any geometric advantage.

use std::cmp::Ordering;
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use shared_types::{Blueprint, EngineCatalog, EngineId, Preset, Slot};

use crate::adaptation::adapt;
use crate::corpus::Corpus;
use crate::error::Result;
use crate::index::NearestNeighbors;
use crate::vectorizer::Vectorizer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    pub top_k: usize,
    pub similarity_weight: f32,
    pub match_weight: f32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_weight: 1.0,
            match_weight: 10.0,
        }
    }
}

/// A scored corpus entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub distance: f32,
    pub match_count: usize,
    pub score: f32,
}

/// Result of [`Oracle::select`].
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Winning preset after adaptation.
    pub preset: Preset,
    /// `None` when the preset was synthesized because the corpus was empty.
    pub winner: Option<Candidate>,
    pub required: Vec<EngineId>,
}

impl Selection {
    pub fn is_fallback(&self) -> bool {
        self.winner.is_none()
    }
}

pub struct Oracle {
    vectorizer: Vectorizer,
    corpus: Arc<Corpus>,
    index: Arc<dyn NearestNeighbors>,
    catalog: Arc<EngineCatalog>,
    config: RankingConfig,
}

impl std::fmt::Debug for Oracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracle")
            .field("vectorizer", &self.vectorizer)
            .field("corpus_len", &self.corpus.len())
            .field("index_len", &self.index.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Oracle {
    /// Builds an oracle over an exact brute-force index of `corpus`.
    pub fn new(
        corpus: Corpus,
        vectorizer: Vectorizer,
        catalog: Arc<EngineCatalog>,
        config: RankingConfig,
    ) -> Result<Self> {
        let index = corpus.build_index()?;
        Ok(Self::with_index(
            Arc::new(corpus),
            Arc::new(index),
            vectorizer,
            catalog,
            config,
        ))
    }

    /// Uses a caller-supplied index; it must cover the same entries as `corpus`.
    pub fn with_index(
        corpus: Arc<Corpus>,
        index: Arc<dyn NearestNeighbors>,
        vectorizer: Vectorizer,
        catalog: Arc<EngineCatalog>,
        config: RankingConfig,
    ) -> Self {
        if index.len() != corpus.len() {
            tracing::warn!(
                index = index.len(),
                corpus = corpus.len(),
                "Index and corpus sizes differ"
            );
        }
        Self {
            vectorizer,
            corpus,
            index,
            catalog,
            config,
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn vectorizer(&self) -> &Vectorizer {
        &self.vectorizer
    }

    /// Required engines the catalog knows; unknown ids are dropped.
    pub fn known_engines(&self, required: &[EngineId]) -> Vec<EngineId> {
        let mut known = Vec::with_capacity(required.len());
        for &engine in required {
            if !self.catalog.contains(engine) {
                tracing::debug!(engine = %engine, "Ignoring engine outside the catalog");
                continue;
            }
            if !known.contains(&engine) {
                known.push(engine);
            }
        }
        known
    }

    /// Scores the top-K neighbours of `query`, best first.
    pub fn rank(&self, query: &Preset, required: &[EngineId]) -> Vec<Candidate> {
        let required = self.known_engines(required);
        let vector = self.vectorizer.vectorize(query);

        let mut candidates: Vec<Candidate> = self
            .index
            .nearest(&vector, self.config.top_k)
            .into_iter()
            .filter_map(|neighbor| {
                let entry = self.corpus.get(neighbor.index)?;
                let match_count = required.iter().filter(|e| entry.tags.contains(e)).count();
                let score = self.config.similarity_weight / (1.0 + neighbor.distance)
                    + self.config.match_weight * match_count as f32;
                Some(Candidate {
                    index: neighbor.index,
                    distance: neighbor.distance,
                    match_count,
                    score,
                })
            })
            .collect();

        candidates.sort_by(best_first);
        candidates
    }

    /// Picks and adapts the best corpus entry for `blueprint`.
    ///
    /// Never fails: with nothing to rank, a canonical preset holding the
    /// required engines is synthesized instead.
    pub fn select(&self, blueprint: &Blueprint) -> Selection {
        let required = self.known_engines(&blueprint.required_engines());
        let query = blueprint.to_query_preset(self.catalog.slot_count());

        let winner = self.rank(&query, &required).into_iter().next();
        let winner_entry = winner.and_then(|c| self.corpus.get(c.index).map(|e| (c, e)));

        match winner_entry {
            Some((candidate, entry)) => {
                counter!("tonecraft_oracle_selections_total", 1, "outcome" => "corpus");
                tracing::info!(
                    index = candidate.index,
                    name = %entry.preset.name,
                    distance = candidate.distance,
                    matches = candidate.match_count,
                    score = candidate.score,
                    "Selected corpus preset"
                );

                let mut preset = adapt(&entry.preset, &required);
                if let Some(character) = blueprint.character {
                    preset.character = character;
                }
                preset.metadata.insert("source_index".into(), candidate.index.into());
                preset.metadata.insert("source_name".into(), entry.preset.name.clone().into());
                preset.metadata.insert("match_count".into(), candidate.match_count.into());

                Selection {
                    preset,
                    winner: Some(candidate),
                    required,
                }
            }
            None => {
                counter!("tonecraft_oracle_selections_total", 1, "outcome" => "default");
                tracing::warn!(
                    corpus = self.corpus.len(),
                    required = required.len(),
                    "No corpus candidate, synthesizing default preset"
                );
                Selection {
                    preset: self.canonical_default(blueprint, &required),
                    winner: None,
                    required,
                }
            }
        }
    }

    fn canonical_default(&self, blueprint: &Blueprint, required: &[EngineId]) -> Preset {
        let mut preset = Preset::empty(blueprint.label.clone(), self.catalog.slot_count());
        preset.character = blueprint.character.unwrap_or_default();
        for (cell, &engine) in preset.slots.iter_mut().zip(required) {
            *cell = Some(Slot::new(engine));
        }
        preset.metadata.insert("fallback".into(), true.into());
        preset
    }
}

/// Highest score, then lowest distance, then earliest corpus position.
fn best_first(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.distance.total_cmp(&b.distance))
        .then_with(|| a.index.cmp(&b.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Neighbor;
    use shared_types::{BlueprintSlot, CharacterProfile};

    fn catalog() -> Arc<EngineCatalog> {
        Arc::new(EngineCatalog::builtin())
    }

    fn engine(name: &str) -> EngineId {
        EngineCatalog::builtin().by_name(name).unwrap()
    }

    fn preset_with(name: &str, engines: &[&str]) -> Preset {
        let mut preset = Preset::empty(name, 6);
        for (i, e) in engines.iter().enumerate() {
            preset.slots[i] = Some(Slot::new(engine(e)));
        }
        preset
    }

    fn blueprint(label: &str, engines: &[&str]) -> Blueprint {
        let mut bp = Blueprint::new(label);
        bp.slots = engines
            .iter()
            .enumerate()
            .map(|(slot, e)| BlueprintSlot { slot, engine: engine(e) })
            .collect();
        bp
    }

    /// Index returning canned distances, whatever the query.
    struct FixedDistances(Vec<f32>);

    impl NearestNeighbors for FixedDistances {
        fn len(&self) -> usize {
            self.0.len()
        }

        fn nearest(&self, _query: &[f32], k: usize) -> Vec<Neighbor> {
            let mut hits: Vec<Neighbor> = self
                .0
                .iter()
                .enumerate()
                .map(|(index, &distance)| Neighbor { index, distance })
                .collect();
            hits.sort_by(crate::index::by_distance_then_index);
            hits.truncate(k);
            hits
        }
    }

    fn fixed_oracle(presets: Vec<Preset>, distances: Vec<f32>) -> Oracle {
        let vectorizer = Vectorizer::default();
        Oracle::with_index(
            Arc::new(Corpus::build(presets, &vectorizer)),
            Arc::new(FixedDistances(distances)),
            vectorizer,
            catalog(),
            RankingConfig::default(),
        )
    }

    #[test]
    fn tag_match_beats_closer_vector() {
        let oracle = fixed_oracle(
            vec![
                preset_with("A", &["TapeEcho", "PlateReverb"]),
                preset_with("B", &["BitCrusher"]),
            ],
            vec![0.2, 0.05],
        );

        let selection = oracle.select(&blueprint("warm analog echo", &["TapeEcho"]));
        let winner = selection.winner.unwrap();
        assert_eq!(winner.index, 0);
        assert_eq!(winner.match_count, 1);
        assert_eq!(selection.preset.metadata["source_name"], "A");
    }

    #[test]
    fn identical_vector_is_retrieved() {
        let presets = vec![
            preset_with("Spring", &["SpringReverb", "ClassicTremolo"]),
            preset_with("Crush", &["BitCrusher", "WaveFolder", "NoiseGate"]),
            preset_with("Wide", &["StereoWidener"]),
        ];
        let oracle = Oracle::new(
            Corpus::build(presets.clone(), &Vectorizer::default()),
            Vectorizer::default(),
            catalog(),
            RankingConfig::default(),
        )
        .unwrap();

        let ranked = oracle.rank(&presets[1], &[]);
        assert_eq!(ranked[0].index, 1);
        assert_eq!(ranked[0].distance, 0.0);
        assert_eq!(ranked[0].match_count, 0);
    }

    #[test]
    fn ties_break_on_distance_then_position() {
        let oracle = fixed_oracle(
            vec![
                preset_with("far", &["TapeEcho"]),
                preset_with("near", &["TapeEcho"]),
                preset_with("near-dup", &["TapeEcho"]),
            ],
            vec![0.4, 0.1, 0.1],
        );
        let ranked = oracle.rank(&Preset::empty("q", 6), &[engine("TapeEcho")]);
        let order: Vec<usize> = ranked.iter().map(|c| c.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn disjoint_requirements_still_select_and_adapt() {
        let oracle = fixed_oracle(
            vec![preset_with("Clean", &["ParametricEq", "OptoCompressor"])],
            vec![0.3],
        );
        let selection = oracle.select(&blueprint("glitchy shimmer", &["BitCrusher", "ShimmerReverb"]));
        assert_eq!(selection.winner.unwrap().match_count, 0);
        assert!(selection.preset.has_engine(engine("BitCrusher")));
        assert!(selection.preset.has_engine(engine("ShimmerReverb")));
        assert!(selection.preset.has_engine(engine("ParametricEq")));
    }

    #[test]
    fn empty_corpus_synthesizes_default() {
        let oracle = Oracle::new(
            Corpus::default(),
            Vectorizer::default(),
            catalog(),
            RankingConfig::default(),
        )
        .unwrap();

        let mut bp = blueprint("dreamy", &["ShimmerReverb", "StereoChorus"]);
        bp.character = Some(CharacterProfile {
            space: 0.9,
            ..CharacterProfile::neutral()
        });

        let selection = oracle.select(&bp);
        assert!(selection.is_fallback());
        assert_eq!(selection.preset.slot_count(), 6);
        assert_eq!(
            selection.preset.tags(),
            vec![engine("ShimmerReverb"), engine("StereoChorus")]
        );
        assert_eq!(selection.preset.character.space, 0.9);
    }

    #[test]
    fn unknown_engines_are_ignored() {
        let oracle = fixed_oracle(vec![preset_with("A", &["TapeEcho"])], vec![0.1]);
        let mut bp = blueprint("x", &["TapeEcho"]);
        bp.slots.push(BlueprintSlot { slot: 1, engine: EngineId(4000) });

        let selection = oracle.select(&bp);
        assert_eq!(selection.required, vec![engine("TapeEcho")]);
        assert!(!selection.preset.has_engine(EngineId(4000)));
    }
}
