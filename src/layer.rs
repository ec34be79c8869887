use std::sync::Arc;

use crate::error::EngineError;
use crate::voice::{Voice, VoiceState};

/// Pitch bucket a voice plays in, relative to its region's center key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Down,
    Center,
    Up,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Down, Layer::Center, Layer::Up];

    /// Nearest layer for a key offset in semitones. Offsets past one are clamped.
    pub fn from_offset(offset: i32) -> Layer {
        match offset.signum() {
            -1 => Layer::Down,
            1 => Layer::Up,
            _ => Layer::Center,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Layer::Down => 0,
            Layer::Center => 1,
            Layer::Up => 2,
        }
    }

    pub fn semitones(self) -> i32 {
        self.index() as i32 - 1
    }
}

/// The three voice collections. Always accessed under the engine's layers lock.
pub struct VoiceLayers {
    layers: [Vec<Arc<Voice>>; 3],
    ceiling: usize,
    /// Voices taken out of the layers, waiting for the decoder to free them.
    retired: Vec<Arc<Voice>>,
}

impl VoiceLayers {
    pub fn new(ceiling: usize) -> Self {
        Self {
            layers: [
                Vec::with_capacity(ceiling),
                Vec::with_capacity(ceiling),
                Vec::with_capacity(ceiling),
            ],
            ceiling,
            retired: Vec::with_capacity(ceiling * 3),
        }
    }

    /// Adds a voice to its layer unless that layer is full.
    pub fn insert(&mut self, voice: Arc<Voice>) -> Result<(), EngineError> {
        let layer = &mut self.layers[voice.layer.index()];
        if layer.len() >= self.ceiling {
            return Err(EngineError::VoiceOverflow {
                layer: voice.layer,
                ceiling: self.ceiling,
            });
        }
        layer.push(voice);
        Ok(())
    }

    /// Moves drained voices to the retired list. Returns how many moved.
    pub fn prune(&mut self) -> usize {
        let mut moved = 0;
        for layer in self.layers.iter_mut() {
            let mut i = 0;
            while i < layer.len() {
                if layer[i].state() == VoiceState::Drained {
                    // Retired keeps its capacity, so the audio thread never reallocates here.
                    if self.retired.len() < self.retired.capacity() {
                        self.retired.push(layer.swap_remove(i));
                        moved += 1;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
        }
        moved
    }

    /// Hands the retired voices over to be freed outside the lock.
    pub fn take_retired(&mut self, into: &mut Vec<Arc<Voice>>) {
        into.append(&mut self.retired);
    }

    /// Copies the layers into caller-owned scratch without allocating
    /// once the scratch has grown to the ceiling.
    pub fn snapshot_into(&self, scratch: &mut [Vec<Arc<Voice>>; 3]) {
        for (dst, src) in scratch.iter_mut().zip(self.layers.iter()) {
            dst.clear();
            dst.extend(src.iter().cloned());
        }
    }

    pub fn layer(&self, layer: Layer) -> &[Arc<Voice>] {
        &self.layers[layer.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Voice>> {
        self.layers.iter().flatten()
    }

    pub fn active_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Voices on `key` that a note-off should release.
    pub fn sounding_on_key(&self, key: u8) -> impl Iterator<Item = &Arc<Voice>> {
        self.iter()
            .filter(move |v| v.key == key && !v.is_release_sample && v.state().is_sounding())
    }

    /// Distinct keys with at least one sounding attack voice.
    pub fn sounding_keys(&self) -> Vec<u8> {
        let mut keys: Vec<u8> = self
            .iter()
            .filter(|v| !v.is_release_sample && v.state().is_sounding())
            .map(|v| v.key)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Empties every layer into the retired list, for shutdown.
    pub fn clear(&mut self) {
        for layer in self.layers.iter_mut() {
            self.retired.append(layer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_region;

    fn voice(id: u64, layer: Layer) -> Arc<Voice> {
        Arc::new(Voice::new(id, 60, 100, layer, test_region(), 0.5, false))
    }

    #[test]
    fn test_offsets_map_to_nearest_layer() {
        assert_eq!(Layer::from_offset(0), Layer::Center);
        assert_eq!(Layer::from_offset(1), Layer::Up);
        assert_eq!(Layer::from_offset(-1), Layer::Down);
        assert_eq!(Layer::from_offset(5), Layer::Up);
        assert_eq!(Layer::from_offset(-3), Layer::Down);
        assert_eq!(Layer::Up.semitones(), 1);
        assert_eq!(Layer::Down.semitones(), -1);
    }

    #[test]
    fn test_ceiling_rejects_new_voices() {
        let mut layers = VoiceLayers::new(2);
        layers.insert(voice(1, Layer::Center)).unwrap();
        layers.insert(voice(2, Layer::Center)).unwrap();
        let err = layers.insert(voice(3, Layer::Center)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::VoiceOverflow { layer: Layer::Center, ceiling: 2 }
        ));
        // Other layers have their own budget.
        layers.insert(voice(4, Layer::Up)).unwrap();
        assert_eq!(layers.layer(Layer::Center).len(), 2);
        assert_eq!(layers.active_count(), 3);
    }

    #[test]
    fn test_prune_retires_drained_voices() {
        let mut layers = VoiceLayers::new(4);
        let a = voice(1, Layer::Center);
        let b = voice(2, Layer::Center);
        layers.insert(Arc::clone(&a)).unwrap();
        layers.insert(Arc::clone(&b)).unwrap();

        a.mark_drained();
        assert_eq!(layers.prune(), 1);
        assert_eq!(layers.active_count(), 1);
        assert_eq!(layers.layer(Layer::Center)[0].id, 2);

        let mut freed = Vec::new();
        layers.take_retired(&mut freed);
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].id, 1);
    }

    #[test]
    fn test_sounding_keys_skip_released_voices() {
        let mut layers = VoiceLayers::new(4);
        let a = voice(1, Layer::Center);
        layers.insert(Arc::clone(&a)).unwrap();
        assert_eq!(layers.sounding_keys(), vec![60]);
        a.begin_release(0.99);
        assert!(layers.sounding_keys().is_empty());
        assert_eq!(layers.sounding_on_key(60).count(), 0);
    }
}
