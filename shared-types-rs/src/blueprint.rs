// shared-types-rs/src/blueprint.rs
// The inference collaborator's structured reading of a prompt. The core only
// looks at the slot/engine pairs, the label and the optional character hint;
// anything else the interpreter emits rides along in `extras`.

use serde::{Deserialize, Serialize};

use crate::preset::{CharacterProfile, EngineId, Preset, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintSlot {
    pub slot: usize,
    pub engine: EngineId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub label: String,
    #[serde(default)]
    pub slots: Vec<BlueprintSlot>,
    #[serde(default)]
    pub character: Option<CharacterProfile>,
    #[serde(default)]
    pub extras: serde_json::Value,
}

impl Blueprint {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            slots: Vec::new(),
            character: None,
            extras: serde_json::Value::Null,
        }
    }

    /// Engines the blueprint asks for, deduplicated, in slot order.
    pub fn required_engines(&self) -> Vec<EngineId> {
        let mut ordered: Vec<&BlueprintSlot> = self.slots.iter().collect();
        ordered.sort_by_key(|s| s.slot);

        let mut engines = Vec::new();
        for slot in ordered {
            if !engines.contains(&slot.engine) {
                engines.push(slot.engine);
            }
        }
        engines
    }

    /// Projects the blueprint onto a preset so it can be vectorized like a
    /// corpus entry. Slots outside the table are dropped.
    pub fn to_query_preset(&self, slot_count: usize) -> Preset {
        let mut preset = Preset::empty(self.label.clone(), slot_count);
        preset.character = self.character.unwrap_or_default();
        for entry in &self.slots {
            if let Some(cell) = preset.slots.get_mut(entry.slot) {
                *cell = Some(Slot::new(entry.engine));
            }
        }
        preset
    }
}
