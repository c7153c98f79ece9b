//! Preset → feature vector.
//!
//! Layout: `[warmth, brightness, space, aggression, movement]`, then a
//! presence block of `tag_width` cells where every active engine sets cell
//! `hash(id) mod tag_width`, then `active_slots / slot_count`.
//!
//! Distinct engines may share a cell. The block only steers geometric
//! similarity; exact tag matching is done separately by the ranker.

use sha2::{Digest, Sha256};
use shared_types::{CharacterProfile, EngineId, Preset};

pub const DEFAULT_TAG_WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vectorizer {
    tag_width: usize,
}

impl Vectorizer {
    /// A zero width is bumped to one so every vector keeps the same layout.
    pub fn new(tag_width: usize) -> Self {
        Self {
            tag_width: tag_width.max(1),
        }
    }

    pub fn tag_width(&self) -> usize {
        self.tag_width
    }

    pub fn dimensions(&self) -> usize {
        CharacterProfile::DIMENSIONS + self.tag_width + 1
    }

    /// Cell of the presence block that `engine` lights up.
    ///
    /// First eight bytes of SHA-256 over the decimal id, so the mapping is
    /// stable across processes and builds.
    pub fn tag_cell(&self, engine: EngineId) -> usize {
        let digest = Sha256::digest(engine.0.to_string().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % self.tag_width as u64) as usize
    }

    pub fn vectorize(&self, preset: &Preset) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimensions());
        vector.extend_from_slice(&preset.character.to_array());

        let block_start = vector.len();
        vector.resize(block_start + self.tag_width, 0.0);
        for engine in preset.active_engines() {
            vector[block_start + self.tag_cell(engine)] = 1.0;
        }

        let complexity = match preset.slot_count() {
            0 => 0.0,
            n => preset.active_slot_count() as f32 / n as f32,
        };
        vector.push(complexity);
        vector
    }
}

impl Default for Vectorizer {
    fn default() -> Self {
        Self::new(DEFAULT_TAG_WIDTH)
    }
}
