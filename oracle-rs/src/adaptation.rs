// oracle-rs/src/adaptation.rs
// Rewrites a selected preset so every required engine is active.

use shared_types::{EngineId, Preset, Slot};

/// Returns a copy of `preset` in which each engine of `required` is active.
///
/// Per missing engine, in `required` order:
/// 1. a bypassed slot already holding it is re-enabled;
/// 2. otherwise the first empty slot receives it;
/// 3. otherwise the last slot whose engine is not required is overwritten.
///
/// Required engines are never evicted. When no slot is left the remaining
/// engines are dropped, so the result depends only on the inputs and a second
/// pass changes nothing.
pub fn adapt(preset: &Preset, required: &[EngineId]) -> Preset {
    let mut adapted = preset.clone();

    for &engine in required {
        if adapted.has_engine(engine) {
            continue;
        }

        if let Some(slot) = adapted
            .slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.engine == engine && slot.bypass)
        {
            slot.bypass = false;
            continue;
        }

        if let Some(cell) = adapted.slots.iter_mut().find(|cell| cell.is_none()) {
            *cell = Some(Slot::new(engine));
            continue;
        }

        let evictable = adapted
            .slots
            .iter_mut()
            .rev()
            .find(|cell| matches!(cell, Some(slot) if !required.contains(&slot.engine)));
        match evictable {
            Some(cell) => {
                if let Some(old) = cell.as_ref() {
                    tracing::debug!(evicted = %old.engine, inserted = %engine, "Overwrote slot during adaptation");
                }
                *cell = Some(Slot::new(engine));
            }
            None => {
                tracing::warn!(
                    engine = %engine,
                    slots = adapted.slot_count(),
                    "No slot left for required engine"
                );
            }
        }
    }

    adapted
}
