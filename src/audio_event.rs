use std::sync::Arc;

use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::layer::{Layer, VoiceLayers};
use crate::library::{MAX_LEVEL, Region, Trigger};
use crate::voice::Voice;

/// Shortest release ramp, to avoid clicks on zero-length releases.
pub const MIN_RELEASE_TIME: f32 = 0.005;

/// Per-sample multiplier that decays by 60 dB over `release_time` seconds.
pub fn release_step(release_time: f32, sample_rate: u32) -> f32 {
    let frames = release_time.max(MIN_RELEASE_TIME) * sample_rate as f32;
    10f32.powf(-3.0 / frames)
}

/// Starting level for a release sample that replaces `old`.
///
/// Scales by how loud the old voice actually is against how loud its sample
/// is at the same position, so the release matches the decayed attack.
pub fn release_level(old: &Voice, release_region: &Region) -> f32 {
    let actual = old.output_energy();
    let reference = old.region.envelope.energy_at(old.playback_position());
    let level = if actual > 0.0 && reference > 0.0 {
        (actual / reference).sqrt().min(MAX_LEVEL)
    } else {
        old.current_gain()
    };
    (level * release_region.trim()).clamp(0.0, MAX_LEVEL)
}

/// What a handler did under the layers lock. Logged after the lock is
/// released so the mixer never waits on log output.
#[derive(Debug)]
enum Outcome {
    Started { id: u64, key: u8, velocity: u8, gain: f32 },
    Released { id: u64, key: u8, step: f32 },
    ReleaseSample { id: u64, key: u8, level: f32 },
    Clamped { key: u8, offset: i32 },
    Dropped { key: u8, velocity: u8, error: EngineError },
}

impl Outcome {
    fn starts_voice(&self) -> bool {
        matches!(self, Outcome::Started { .. } | Outcome::ReleaseSample { .. })
    }

    fn log(&self) {
        match self {
            Outcome::Started { id, key, velocity, gain } => {
                log::debug!("[Event] Voice {} on key {} velocity {} gain {:.3}", id, key, velocity, gain)
            }
            Outcome::Released { id, key, step } => {
                log::debug!("[Event] Voice {} releasing (key {}, step {})", id, key, step)
            }
            Outcome::ReleaseSample { id, key, level } => {
                log::debug!("[Event] Release voice {} for key {} at level {:.3}", id, key, level)
            }
            Outcome::Clamped { key, offset } => log::warn!(
                "[Event] Key {} is {} semitones from its sample, clamping to one",
                key,
                offset
            ),
            Outcome::Dropped { key, velocity, error } => {
                log::warn!("[Event] Dropping note {} velocity {}: {}", key, velocity, error)
            }
        }
    }
}

/// Logs the outcomes and wakes the decoder if any voice was started.
fn finish(shared: &EngineShared, outcomes: &[Outcome]) {
    for outcome in outcomes {
        outcome.log();
    }
    if outcomes.iter().any(Outcome::starts_voice) {
        shared.wake_decoder();
    }
}

fn spawn_voice(
    shared: &EngineShared,
    layers: &mut VoiceLayers,
    outcomes: &mut Vec<Outcome>,
    key: u8,
    velocity: u8,
    region: &Arc<Region>,
    gain: f32,
    is_release_sample: bool,
) {
    let offset = key as i32 - region.center_key as i32;
    if offset.abs() > 1 {
        outcomes.push(Outcome::Clamped { key, offset });
    }
    let layer = Layer::from_offset(offset);
    let id = shared.next_voice_id();
    let voice = Voice::new(
        id,
        key,
        velocity,
        layer,
        Arc::clone(region),
        gain,
        is_release_sample,
    );
    outcomes.push(match layers.insert(Arc::new(voice)) {
        Ok(()) if is_release_sample => Outcome::ReleaseSample { id, key, level: gain },
        Ok(()) => Outcome::Started { id, key, velocity, gain },
        Err(error) => Outcome::Dropped { key, velocity, error },
    });
}

/// Releases every sounding attack voice on `key`, starting matching release samples.
fn release_key(shared: &EngineShared, layers: &mut VoiceLayers, outcomes: &mut Vec<Outcome>, key: u8) {
    let sounding: Vec<Arc<Voice>> = layers.sounding_on_key(key).cloned().collect();
    let sample_rate = shared.config.sample_rate;

    for old in sounding {
        let step = release_step(old.region.release_time, sample_rate);
        if !old.begin_release(step) {
            continue;
        }
        outcomes.push(Outcome::Released { id: old.id, key, step });

        let Some(region) = shared
            .library
            .find_region(key, old.velocity, Trigger::Release)
        else {
            continue;
        };
        let level = release_level(&old, region);
        spawn_voice(shared, layers, outcomes, key, old.velocity, region, level, true);
    }
}

/// Starts a note, releasing anything still sounding on the same key first.
pub fn note_on(shared: &EngineShared, key: u8, velocity: u8) {
    let mut outcomes = Vec::new();
    let mut layers = shared.lock_layers();
    release_key(shared, &mut layers, &mut outcomes, key);

    let region = shared.library.find_region(key, velocity, Trigger::Attack);
    if let Some(region) = region {
        let gain = region.velocity_gain(velocity);
        spawn_voice(shared, &mut layers, &mut outcomes, key, velocity, region, gain, false);
    }
    drop(layers);

    if region.is_none() {
        log::warn!("[Event] {}", EngineError::MissingSample { key, velocity });
    }
    finish(shared, &outcomes);
}

/// Releases a key. Keys with nothing sounding are ignored.
pub fn note_off(shared: &EngineShared, key: u8) {
    let mut outcomes = Vec::new();
    let mut layers = shared.lock_layers();
    release_key(shared, &mut layers, &mut outcomes, key);
    drop(layers);
    finish(shared, &outcomes);
}

pub fn all_notes_off(shared: &EngineShared) {
    let mut outcomes = Vec::new();
    let mut layers = shared.lock_layers();
    let keys = layers.sounding_keys();
    for key in &keys {
        release_key(shared, &mut layers, &mut outcomes, *key);
    }
    drop(layers);
    log::info!("[Event] All notes off ({} keys)", keys.len());
    finish(shared, &outcomes);
}
