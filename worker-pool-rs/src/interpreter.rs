// worker-pool-rs/src/interpreter.rs
// Inference backends. The built-in one is a keyword table; a model-backed
// interpreter plugs in through the same trait.

use async_trait::async_trait;
use shared_types::{Blueprint, BlueprintSlot, CharacterProfile, EngineCatalog, EngineId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InferenceError(pub String);

/// Turns a prompt into a blueprint. Runs inside a worker.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    async fn infer(&self, prompt: &str) -> Result<Blueprint, InferenceError>;
}

struct Rule {
    keywords: &'static [&'static str],
    engine: &'static str,
}

const RULES: &[Rule] = &[
    Rule { keywords: &["echo", "delay", "dub", "slapback"], engine: "TapeEcho" },
    Rule { keywords: &["tape", "analog", "vintage", "tube"], engine: "VintageTube" },
    Rule { keywords: &["plate"], engine: "PlateReverb" },
    Rule { keywords: &["spring", "surf"], engine: "SpringReverb" },
    Rule { keywords: &["room"], engine: "RoomReverb" },
    Rule { keywords: &["shimmer", "ethereal", "heavenly", "cathedral"], engine: "ShimmerReverb" },
    Rule { keywords: &["pingpong", "ping"], engine: "PingPongDelay" },
    Rule { keywords: &["crush", "crushed", "lofi", "lo-fi", "8bit", "bitcrushed"], engine: "BitCrusher" },
    Rule { keywords: &["fuzz", "distorted", "distortion", "gritty"], engine: "RodentDistortion" },
    Rule { keywords: &["fold", "metallic"], engine: "WaveFolder" },
    Rule { keywords: &["compress", "compressed", "punchy", "glue"], engine: "ClassicCompressor" },
    Rule { keywords: &["gate", "gated"], engine: "NoiseGate" },
    Rule { keywords: &["filter", "sweep", "resonant"], engine: "LadderFilter" },
    Rule { keywords: &["wah", "funky", "envelope"], engine: "EnvelopeFilter" },
    Rule { keywords: &["chorus", "lush"], engine: "StereoChorus" },
    Rule { keywords: &["phaser", "phase"], engine: "AnalogPhaser" },
    Rule { keywords: &["tremolo", "pulsing"], engine: "ClassicTremolo" },
    Rule { keywords: &["leslie", "rotary"], engine: "RotarySpeaker" },
    Rule { keywords: &["pitch", "octave", "harmonizer"], engine: "PitchShifter" },
    Rule { keywords: &["wide", "stereo"], engine: "StereoWidener" },
    Rule { keywords: &["granular", "texture", "cloud"], engine: "GranularCloud" },
    Rule { keywords: &["bright", "sparkle", "exciter"], engine: "HarmonicExciter" },
];

/// (keyword, axis index, amount) nudges applied to the neutral character.
const CHARACTER_NUDGES: &[(&str, usize, f32)] = &[
    ("warm", 0, 0.35),
    ("cold", 0, -0.3),
    ("bright", 1, 0.35),
    ("dark", 1, -0.35),
    ("big", 2, 0.3),
    ("huge", 2, 0.4),
    ("spacious", 2, 0.35),
    ("dry", 2, -0.35),
    ("tight", 2, -0.25),
    ("aggressive", 3, 0.4),
    ("gritty", 3, 0.3),
    ("gentle", 3, -0.3),
    ("soft", 3, -0.25),
    ("moving", 4, 0.3),
    ("swirling", 4, 0.4),
    ("static", 4, -0.3),
];

/// Keyword-table interpreter over the engine catalog.
#[derive(Debug, Clone)]
pub struct KeywordInterpreter {
    catalog: EngineCatalog,
}

impl KeywordInterpreter {
    pub fn new(catalog: EngineCatalog) -> Self {
        Self { catalog }
    }

    pub fn interpret(&self, prompt: &str) -> Result<Blueprint, InferenceError> {
        let words: Vec<String> = prompt
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        if words.is_empty() {
            return Err(InferenceError("prompt has no words".into()));
        }

        let mut engines: Vec<EngineId> = Vec::new();
        for word in &words {
            for rule in RULES {
                if !rule.keywords.contains(&word.as_str()) {
                    continue;
                }
                if let Some(id) = self.catalog.by_name(rule.engine) {
                    if !engines.contains(&id) {
                        engines.push(id);
                    }
                }
            }
        }
        engines.truncate(self.catalog.slot_count());

        let mut axes = CharacterProfile::neutral().to_array();
        let mut hinted = false;
        for word in &words {
            for (keyword, axis, amount) in CHARACTER_NUDGES {
                if word == keyword {
                    axes[*axis] += amount;
                    hinted = true;
                }
            }
        }

        let mut blueprint = Blueprint::new(prompt.trim());
        blueprint.slots = engines
            .into_iter()
            .enumerate()
            .map(|(slot, engine)| BlueprintSlot { slot, engine })
            .collect();
        if hinted {
            let [warmth, brightness, space, aggression, movement] = axes;
            blueprint.character = Some(
                CharacterProfile { warmth, brightness, space, aggression, movement }.clamped(),
            );
        }
        blueprint.extras = serde_json::json!({ "interpreter": "keyword", "words": words.len() });
        Ok(blueprint)
    }
}

impl Default for KeywordInterpreter {
    fn default() -> Self {
        Self::new(EngineCatalog::builtin())
    }
}

#[async_trait]
impl InferenceBackend for KeywordInterpreter {
    async fn infer(&self, prompt: &str) -> Result<Blueprint, InferenceError> {
        self.interpret(prompt)
    }
}
