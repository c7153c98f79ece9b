pub mod blueprint;
pub mod catalog;
pub mod config;
pub mod preset;

pub use blueprint::{Blueprint, BlueprintSlot};
pub use catalog::{EngineCatalog, EngineInfo};
pub use config::{ConfigError, TonecraftConfig};
pub use preset::{CharacterProfile, EngineId, Preset, Slot};
