// shared-types-rs/src/catalog.rs
// Enumerable catalog of the host's signal-processing engines. The core never
// runs an engine; it only needs ids, names and the slot table size.

use serde::{Deserialize, Serialize};

use crate::preset::EngineId;

/// Default number of slots in a preset's processing chain.
pub const DEFAULT_SLOT_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub id: EngineId,
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCatalog {
    slot_count: usize,
    engines: Vec<EngineInfo>,
}

const BUILTIN: &[(&str, &str)] = &[
    ("None", "utility"),
    ("VintageTube", "saturation"),
    ("TapeEcho", "delay"),
    ("ShimmerReverb", "reverb"),
    ("PlateReverb", "reverb"),
    ("SpringReverb", "reverb"),
    ("RoomReverb", "reverb"),
    ("DigitalDelay", "delay"),
    ("PingPongDelay", "delay"),
    ("BitCrusher", "distortion"),
    ("WaveFolder", "distortion"),
    ("RodentDistortion", "distortion"),
    ("HarmonicExciter", "saturation"),
    ("ClassicCompressor", "dynamics"),
    ("OptoCompressor", "dynamics"),
    ("NoiseGate", "dynamics"),
    ("ParametricEq", "filter"),
    ("LadderFilter", "filter"),
    ("EnvelopeFilter", "filter"),
    ("StereoChorus", "modulation"),
    ("AnalogPhaser", "modulation"),
    ("ClassicTremolo", "modulation"),
    ("RotarySpeaker", "modulation"),
    ("PitchShifter", "pitch"),
    ("StereoWidener", "spatial"),
    ("GranularCloud", "texture"),
];

impl EngineCatalog {
    /// Catalog with engine ids assigned by position.
    pub fn new(slot_count: usize, engines: Vec<EngineInfo>) -> Self {
        Self {
            slot_count,
            engines,
        }
    }

    pub fn builtin() -> Self {
        let engines = BUILTIN
            .iter()
            .enumerate()
            .map(|(i, (name, category))| EngineInfo {
                id: EngineId(i as u16),
                name: (*name).to_string(),
                category: (*category).to_string(),
            })
            .collect();
        Self::new(DEFAULT_SLOT_COUNT, engines)
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn engines(&self) -> &[EngineInfo] {
        &self.engines
    }

    pub fn contains(&self, id: EngineId) -> bool {
        self.engines.iter().any(|e| e.id == id)
    }

    pub fn name(&self, id: EngineId) -> Option<&str> {
        self.engines
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.name.as_str())
    }

    /// Case-insensitive lookup by engine name.
    pub fn by_name(&self, name: &str) -> Option<EngineId> {
        self.engines
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.id)
    }
}

impl Default for EngineCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup() {
        let catalog = EngineCatalog::builtin();
        let echo = catalog.by_name("tapeecho").unwrap();
        assert_eq!(catalog.name(echo), Some("TapeEcho"));
        assert!(catalog.contains(echo));
        assert!(!catalog.contains(EngineId(999)));
        assert_eq!(catalog.slot_count(), DEFAULT_SLOT_COUNT);
    }
}
