use ringbuf::traits::{Observer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::layer::Layer;
use crate::library::Region;
use crate::source::SampleSource;

// Common Audio Constants
pub const CHANNEL_COUNT: usize = 2;
pub const VOICE_BUFFER_FRAMES: usize = 14400;
/// Frames decoded per ring top-up.
pub const DECODE_BLOCK_FRAMES: usize = 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Allocated = 0,
    Filling = 1,
    Playing = 2,
    Releasing = 3,
    Drained = 4,
}

impl VoiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => VoiceState::Allocated,
            1 => VoiceState::Filling,
            2 => VoiceState::Playing,
            3 => VoiceState::Releasing,
            _ => VoiceState::Drained,
        }
    }

    /// Still producing sound that a note-off should release.
    pub fn is_sounding(self) -> bool {
        matches!(
            self,
            VoiceState::Allocated | VoiceState::Filling | VoiceState::Playing
        )
    }
}

/// Decode side of a voice. Only the decoder thread locks this.
pub struct VoiceFeed {
    pub producer: HeapProd<f32>,
    pub source: Option<Box<dyn SampleSource>>,
    /// Frames decoded so far.
    pub cursor: usize,
    pub block: Vec<f32>,
}

/// Audio side of a voice. Only the mixer locks this, and never blocks on it.
pub struct VoicePlayback {
    pub consumer: HeapCons<f32>,
    pub gain: f32,
    /// Frames played so far.
    pub position: usize,
}

/// One playing instance of a region, attack or release.
pub struct Voice {
    pub id: u64,
    /// The key actually sounding, which may differ from the region's center.
    pub key: u8,
    pub velocity: u8,
    pub layer: Layer,
    pub region: Arc<Region>,
    pub is_release_sample: bool,

    state: AtomicU8,
    primed: AtomicBool,
    source_finished: AtomicBool,
    release_step: AtomicU32,
    gain_snapshot: AtomicU32,
    energy_snapshot: AtomicU32,
    position_snapshot: AtomicUsize,

    feed: Mutex<VoiceFeed>,
    playback: Mutex<VoicePlayback>,
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Voice {
    pub fn new(
        id: u64,
        key: u8,
        velocity: u8,
        layer: Layer,
        region: Arc<Region>,
        gain: f32,
        is_release_sample: bool,
    ) -> Self {
        let ring_buf = HeapRb::<f32>::new(VOICE_BUFFER_FRAMES * CHANNEL_COUNT);
        let (producer, consumer) = ring_buf.split();

        // Release samples start out decaying, with a flat step until told otherwise.
        let state = if is_release_sample {
            VoiceState::Releasing
        } else {
            VoiceState::Allocated
        };

        Self {
            id,
            key,
            velocity,
            layer,
            region,
            is_release_sample,
            state: AtomicU8::new(state as u8),
            primed: AtomicBool::new(false),
            source_finished: AtomicBool::new(false),
            release_step: AtomicU32::new(1.0f32.to_bits()),
            gain_snapshot: AtomicU32::new(gain.to_bits()),
            energy_snapshot: AtomicU32::new(0.0f32.to_bits()),
            position_snapshot: AtomicUsize::new(0),
            feed: Mutex::new(VoiceFeed {
                producer,
                source: None,
                cursor: 0,
                block: vec![0.0; DECODE_BLOCK_FRAMES * CHANNEL_COUNT],
            }),
            playback: Mutex::new(VoicePlayback {
                consumer,
                gain,
                position: 0,
            }),
        }
    }

    pub fn state(&self) -> VoiceState {
        VoiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from` to `to`. Returns false if another context got there first.
    pub fn transition(&self, from: VoiceState, to: VoiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_drained(&self) {
        self.state.store(VoiceState::Drained as u8, Ordering::Release);
    }

    /// Engages the release ramp if the voice is still sounding.
    /// Returns true only for the call that actually released it.
    pub fn begin_release(&self, step: f32) -> bool {
        let mut current = self.state();
        while current.is_sounding() {
            // The step must be visible before the mixer sees Releasing.
            self.release_step.store(step.to_bits(), Ordering::Release);
            if self.transition(current, VoiceState::Releasing) {
                return true;
            }
            current = self.state();
        }
        false
    }

    pub fn release_step(&self) -> f32 {
        if self.state() == VoiceState::Releasing {
            f32::from_bits(self.release_step.load(Ordering::Acquire))
        } else {
            1.0
        }
    }

    /// Decoder has pushed the first block, or found the source empty.
    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    pub fn set_primed(&self) {
        self.primed.store(true, Ordering::Release);
    }

    pub fn is_source_finished(&self) -> bool {
        self.source_finished.load(Ordering::Acquire)
    }

    pub fn set_source_finished(&self) {
        self.source_finished.store(true, Ordering::Release);
    }

    /// Gain, playback position and mean square output of the last period.
    pub fn publish(&self, gain: f32, position: usize, energy: f32) {
        self.gain_snapshot.store(gain.to_bits(), Ordering::Relaxed);
        self.position_snapshot.store(position, Ordering::Relaxed);
        self.energy_snapshot.store(energy.to_bits(), Ordering::Release);
    }

    pub fn current_gain(&self) -> f32 {
        f32::from_bits(self.gain_snapshot.load(Ordering::Acquire))
    }

    pub fn playback_position(&self) -> usize {
        self.position_snapshot.load(Ordering::Acquire)
    }

    pub fn output_energy(&self) -> f32 {
        f32::from_bits(self.energy_snapshot.load(Ordering::Acquire))
    }

    /// Decoder side. Blocking is fine there.
    pub fn lock_feed(&self) -> MutexGuard<'_, VoiceFeed> {
        lock_recovering(&self.feed)
    }

    /// Audio side. `None` if the guard is somehow held elsewhere.
    pub fn try_lock_playback(&self) -> Option<MutexGuard<'_, VoicePlayback>> {
        match self.playback.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Writable and readable samples in the ring.
    pub fn availability(&self) -> (usize, usize) {
        let feed = self.lock_feed();
        (feed.producer.vacant_len(), feed.producer.occupied_len())
    }

    pub fn ring_capacity(&self) -> usize {
        VOICE_BUFFER_FRAMES * CHANNEL_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_region;

    #[test]
    fn test_release_happens_once() {
        let voice = Voice::new(1, 60, 100, Layer::Center, test_region(), 0.5, false);
        assert_eq!(voice.state(), VoiceState::Allocated);
        assert_eq!(voice.release_step(), 1.0);

        assert!(voice.begin_release(0.999));
        assert_eq!(voice.state(), VoiceState::Releasing);
        assert_eq!(voice.release_step(), 0.999);

        assert!(!voice.begin_release(0.5));
        assert_eq!(voice.release_step(), 0.999);
    }

    #[test]
    fn test_drained_voice_cannot_be_released() {
        let voice = Voice::new(1, 60, 100, Layer::Center, test_region(), 0.5, false);
        assert!(voice.transition(VoiceState::Allocated, VoiceState::Filling));
        assert!(!voice.transition(VoiceState::Allocated, VoiceState::Playing));
        voice.mark_drained();
        assert!(!voice.begin_release(0.9));
        assert_eq!(voice.state(), VoiceState::Drained);
    }

    #[test]
    fn test_release_sample_starts_releasing_with_flat_step() {
        let voice = Voice::new(2, 60, 100, Layer::Center, test_region(), 0.3, true);
        assert_eq!(voice.state(), VoiceState::Releasing);
        assert_eq!(voice.release_step(), 1.0);
        assert_eq!(voice.current_gain(), 0.3);
    }

    #[test]
    fn test_ring_starts_empty() {
        let voice = Voice::new(3, 60, 100, Layer::Center, test_region(), 0.5, false);
        let (vacant, occupied) = voice.availability();
        assert_eq!(occupied, 0);
        assert_eq!(vacant + occupied, voice.ring_capacity());
    }
}
