// orchestrator-service-rs/src/generator.rs
// Content-generation collaborators run during the Refining stage. Each one
// consumes the selected preset and hands back a refined one; the pipeline
// only relies on engine ids and bypass flags surviving the trip.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{EngineCatalog, Preset};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
#[error("generator {generator} failed: {message}")]
pub struct GenerationError {
    pub generator: String,
    pub message: String,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, preset: Preset) -> Result<Preset, GenerationError>;
}

#[derive(Debug, Clone, Copy)]
enum Adjust {
    Set(f32),
    Add(f32),
}

struct Nudge {
    keywords: &'static [&'static str],
    /// Engine categories the nudge applies to; empty means every engine.
    categories: &'static [&'static str],
    parameter: &'static str,
    adjust: Adjust,
}

const NUDGES: &[Nudge] = &[
    Nudge { keywords: &["subtle", "gentle", "touch"], categories: &[], parameter: "mix", adjust: Adjust::Set(0.25) },
    Nudge { keywords: &["drenched", "washed", "soaked"], categories: &["reverb", "delay"], parameter: "mix", adjust: Adjust::Set(0.8) },
    Nudge { keywords: &["long", "endless", "infinite"], categories: &["reverb"], parameter: "decay", adjust: Adjust::Add(0.3) },
    Nudge { keywords: &["long", "endless", "repeating"], categories: &["delay"], parameter: "feedback", adjust: Adjust::Add(0.25) },
    Nudge { keywords: &["short", "tight", "small"], categories: &["reverb"], parameter: "decay", adjust: Adjust::Add(-0.3) },
    Nudge { keywords: &["short", "tight", "slapback"], categories: &["delay"], parameter: "feedback", adjust: Adjust::Add(-0.2) },
    Nudge { keywords: &["fast", "rapid", "choppy"], categories: &["modulation"], parameter: "rate", adjust: Adjust::Add(0.3) },
    Nudge { keywords: &["slow", "lazy", "drifting"], categories: &["modulation"], parameter: "rate", adjust: Adjust::Add(-0.3) },
    Nudge { keywords: &["deep", "seasick"], categories: &["modulation"], parameter: "depth", adjust: Adjust::Add(0.3) },
    Nudge { keywords: &["hot", "driven", "aggressive", "heavy"], categories: &["distortion", "saturation"], parameter: "drive", adjust: Adjust::Add(0.3) },
    Nudge { keywords: &["clean", "soft", "gentle"], categories: &["distortion", "saturation"], parameter: "drive", adjust: Adjust::Add(-0.25) },
    Nudge { keywords: &["squashed", "punchy", "glue"], categories: &["dynamics"], parameter: "ratio", adjust: Adjust::Add(0.25) },
    Nudge { keywords: &["dark", "muffled"], categories: &["filter"], parameter: "cutoff", adjust: Adjust::Add(-0.3) },
    Nudge { keywords: &["bright", "open", "airy"], categories: &["filter"], parameter: "cutoff", adjust: Adjust::Add(0.3) },
];

/// Starting point for a parameter the preset does not set yet.
const BASELINE: f32 = 0.5;

/// Adjusts numeric slot parameters from descriptive words in the prompt.
///
/// Bypassed slots are left alone, values stay in [0, 1], and engines and
/// bypass flags are never changed.
#[derive(Debug, Clone)]
pub struct ParameterNudger {
    catalog: Arc<EngineCatalog>,
}

impl ParameterNudger {
    pub fn new(catalog: Arc<EngineCatalog>) -> Self {
        Self { catalog }
    }

    fn category(&self, engine: shared_types::EngineId) -> Option<&str> {
        self.catalog
            .engines()
            .iter()
            .find(|info| info.id == engine)
            .map(|info| info.category.as_str())
    }

    /// Applies every matching nudge; returns how many parameter writes happened.
    pub fn nudge(&self, prompt: &str, preset: &mut Preset) -> usize {
        let words: Vec<String> = prompt
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut writes = 0;
        for nudge in NUDGES {
            if !nudge.keywords.iter().any(|k| words.iter().any(|w| w == k)) {
                continue;
            }

            for slot in preset.slots.iter_mut().flatten().filter(|s| !s.bypass) {
                let applies = nudge.categories.is_empty()
                    || self
                        .category(slot.engine)
                        .is_some_and(|c| nudge.categories.contains(&c));
                if !applies {
                    continue;
                }

                let current = slot.parameters.get(nudge.parameter).copied().unwrap_or(BASELINE);
                let next = match nudge.adjust {
                    Adjust::Set(v) => v,
                    Adjust::Add(d) => current + d,
                };
                slot.parameters
                    .insert(nudge.parameter.to_string(), next.clamp(0.0, 1.0));
                writes += 1;
            }
        }
        writes
    }
}

#[async_trait]
impl ContentGenerator for ParameterNudger {
    fn name(&self) -> &str {
        "parameter-nudger"
    }

    async fn generate(&self, prompt: &str, mut preset: Preset) -> Result<Preset, GenerationError> {
        let writes = self.nudge(prompt, &mut preset);
        debug!(preset = %preset.name, writes, "Nudged slot parameters");
        if writes > 0 {
            preset.metadata.insert("nudged_parameters".into(), writes.into());
        }
        Ok(preset)
    }
}
