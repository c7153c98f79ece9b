// shared-types-rs/src/preset.rs
// Typed preset record: slot -> engine assignment plus a free-form metadata map
// for collaborator-specific extensions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a signal-processing engine in the host's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(pub u16);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// One occupied processing slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub engine: EngineId,
    #[serde(default)]
    pub parameters: BTreeMap<String, f32>,
    #[serde(default)]
    pub bypass: bool,
}

impl Slot {
    pub fn new(engine: EngineId) -> Self {
        Self {
            engine,
            parameters: BTreeMap::new(),
            bypass: false,
        }
    }

    pub fn with_parameter<S: Into<String>>(mut self, name: S, value: f32) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Continuous "character" of a sound; every axis lives in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterProfile {
    pub warmth: f32,
    pub brightness: f32,
    pub space: f32,
    pub aggression: f32,
    pub movement: f32,
}

impl CharacterProfile {
    pub const DIMENSIONS: usize = 5;

    /// The neutral profile: every axis at its midpoint.
    pub fn neutral() -> Self {
        Self {
            warmth: 0.5,
            brightness: 0.5,
            space: 0.5,
            aggression: 0.5,
            movement: 0.5,
        }
    }

    /// Axes in a fixed order, clamped to [0, 1]. NaN maps to the midpoint.
    pub fn to_array(&self) -> [f32; Self::DIMENSIONS] {
        [
            clamp_unit(self.warmth),
            clamp_unit(self.brightness),
            clamp_unit(self.space),
            clamp_unit(self.aggression),
            clamp_unit(self.movement),
        ]
    }

    pub fn clamped(self) -> Self {
        let [warmth, brightness, space, aggression, movement] = self.to_array();
        Self {
            warmth,
            brightness,
            space,
            aggression,
            movement,
        }
    }
}

impl Default for CharacterProfile {
    fn default() -> Self {
        Self::neutral()
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.5
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// A complete effects configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    /// Fixed-length slot table; `None` is an empty slot.
    pub slots: Vec<Option<Slot>>,
    #[serde(default)]
    pub character: CharacterProfile,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Preset {
    /// An empty preset with `slot_count` unused slots.
    pub fn empty<S: Into<String>>(name: S, slot_count: usize) -> Self {
        Self {
            name: name.into(),
            slots: vec![None; slot_count],
            character: CharacterProfile::neutral(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Engines in occupied, non-bypassed slots, in slot order (duplicates kept).
    pub fn active_engines(&self) -> impl Iterator<Item = EngineId> + '_ {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| !slot.bypass)
            .map(|slot| slot.engine)
    }

    pub fn active_slot_count(&self) -> usize {
        self.active_engines().count()
    }

    /// Whether `engine` is present and not bypassed.
    pub fn has_engine(&self, engine: EngineId) -> bool {
        self.active_engines().any(|e| e == engine)
    }

    /// Tags (distinct active engines) in first-seen order.
    pub fn tags(&self) -> Vec<EngineId> {
        let mut seen = Vec::new();
        for engine in self.active_engines() {
            if !seen.contains(&engine) {
                seen.push(engine);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_is_clamped() {
        let profile = CharacterProfile {
            warmth: 1.7,
            brightness: -0.2,
            space: f32::NAN,
            aggression: 0.3,
            movement: 1.0,
        };
        assert_eq!(profile.to_array(), [1.0, 0.0, 0.5, 0.3, 1.0]);
    }

    #[test]
    fn bypassed_slots_are_not_tags() {
        let mut preset = Preset::empty("test", 4);
        preset.slots[0] = Some(Slot::new(EngineId(3)));
        preset.slots[2] = Some(Slot {
            bypass: true,
            ..Slot::new(EngineId(7))
        });
        preset.slots[3] = Some(Slot::new(EngineId(3)));

        assert_eq!(preset.tags(), vec![EngineId(3)]);
        assert_eq!(preset.active_slot_count(), 2);
        assert!(!preset.has_engine(EngineId(7)));
    }

    #[test]
    fn preset_json_shape() {
        let json = r#"{
            "name": "Dusty Echo",
            "slots": [{"engine": 4, "parameters": {"mix": 0.4}}, null],
            "character": {"warmth": 0.9}
        }"#;
        let preset: Preset = serde_json::from_str(json).unwrap();
        assert_eq!(preset.slot_count(), 2);
        assert_eq!(preset.tags(), vec![EngineId(4)]);
        assert_eq!(preset.character.warmth, 0.9);
        assert_eq!(preset.character.space, 0.5);
    }
}
