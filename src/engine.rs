use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::audio_convolver::StereoConvolver;
use crate::audio_event;
use crate::audio_loader;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::layer::VoiceLayers;
use crate::library::Library;
use crate::mixer::Mixer;

/// State shared between the event, decode and audio contexts.
pub struct EngineShared {
    pub library: Library,
    pub config: EngineConfig,
    layers: Mutex<VoiceLayers>,
    running: AtomicBool,
    next_voice_id: AtomicU64,
    wake_tx: SyncSender<()>,
}

impl EngineShared {
    fn new(library: Library, config: EngineConfig) -> (Arc<Self>, Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::sync_channel(1);
        let shared = Arc::new(Self {
            library,
            layers: Mutex::new(VoiceLayers::new(config.max_voices_per_layer)),
            config,
            running: AtomicBool::new(true),
            next_voice_id: AtomicU64::new(1),
            wake_tx,
        });
        (shared, wake_rx)
    }

    /// Held only for allocation, pruning and snapshots.
    pub fn lock_layers(&self) -> MutexGuard<'_, VoiceLayers> {
        self.layers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn next_voice_id(&self) -> u64 {
        self.next_voice_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Never blocks. A pending wake already covers this one.
    pub fn wake_decoder(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

fn note_event(shared: &EngineShared, key: u8, velocity: u8) {
    if velocity == 0 {
        audio_event::note_off(shared, key);
    } else {
        audio_event::note_on(shared, key, velocity);
    }
}

/// Event-side view of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn note_event(&self, key: u8, velocity: u8) {
        if !self.shared.is_running() {
            return;
        }
        note_event(&self.shared, key, velocity);
    }

    pub fn all_notes_off(&self) {
        audio_event::all_notes_off(&self.shared);
    }
}

/// Owns the shared state and the decoder thread.
///
/// The matching [`Mixer`] goes to the audio callback. Drop the audio stream
/// first, then call [`Engine::shutdown`].
pub struct Engine {
    shared: Arc<EngineShared>,
    decoder: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn start(library: Library, config: EngineConfig) -> Result<(Engine, Mixer), EngineError> {
        if library.sample_rate != config.sample_rate {
            log::warn!(
                "[Engine] '{}' was loaded for {} Hz but the engine runs at {} Hz",
                library.name,
                library.sample_rate,
                config.sample_rate
            );
        }
        let (shared, wake_rx) = EngineShared::new(library, config);
        let mixer = Self::build_mixer(&shared);
        let decoder = audio_loader::spawn_decoder(Arc::clone(&shared), wake_rx)?;
        log::info!(
            "[Engine] Started at {} Hz, {} frame periods, {} voices per layer",
            shared.config.sample_rate,
            shared.config.period_frames,
            shared.config.max_voices_per_layer
        );
        Ok((
            Engine {
                shared,
                decoder: Some(decoder),
            },
            mixer,
        ))
    }

    fn build_mixer(shared: &Arc<EngineShared>) -> Mixer {
        let config = &shared.config;
        let reverb = config.ir_file.as_ref().and_then(|path| {
            match StereoConvolver::from_file(
                path,
                config.sample_rate,
                config.ir_max_frames,
                config.period_frames,
            ) {
                Ok(convolver) => Some(convolver),
                Err(e) => {
                    log::error!("[Engine] Reverb disabled: {}", e);
                    None
                }
            }
        });
        Mixer::new(Arc::clone(shared), reverb)
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// A cloneable sender of note events for MIDI threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// MIDI-style entry point. Velocity 0 is a note-off.
    pub fn note_event(&self, key: u8, velocity: u8) {
        note_event(&self.shared, key, velocity);
    }

    pub fn all_notes_off(&self) {
        audio_event::all_notes_off(&self.shared);
    }

    pub fn active_voices(&self) -> usize {
        self.shared.lock_layers().active_count()
    }

    /// Stops and joins the decoder, then frees every voice.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake_decoder();
        if let Some(handle) = self.decoder.take() {
            if handle.join().is_err() {
                log::error!("[Engine] Decoder thread panicked");
            }
            let mut layers = self.shared.lock_layers();
            layers.clear();
            let mut freed = Vec::new();
            layers.take_retired(&mut freed);
            drop(layers);
            log::info!("[Engine] Shut down, freed {} voices", freed.len());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
impl Engine {
    /// An engine without a decoder thread; tests drive decoding by hand.
    pub(crate) fn manual(library: Library, config: EngineConfig) -> (Engine, Mixer) {
        let (shared, _wake_rx) = EngineShared::new(library, config);
        let mixer = Self::build_mixer(&shared);
        (
            Engine {
                shared,
                decoder: None,
            },
            mixer,
        )
    }

    pub(crate) fn decode_now(&self) -> usize {
        audio_loader::decode_pass(&self.shared, &mut audio_loader::DecodeScratch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_event::release_step;
    use crate::layer::Layer;
    use crate::testutil::{eventually, write_instrument, write_tone};
    use crate::voice::{Voice, VoiceState};

    const INSTRUMENT: &str = "[instrument]\nname = Test Piano\n\n\
        [region1]\nlokey = 59\nhikey = 61\npitch_keycenter = 60\nsample = a.wav\nrelease = 0.5\n";

    fn library(frames: usize) -> (tempfile::TempDir, Library) {
        let dir = tempfile::tempdir().unwrap();
        write_tone(&dir.path().join("a.wav"), 48000, frames, 0.5);
        let path = write_instrument(dir.path(), INSTRUMENT);
        let library = Library::load(&path, 48000).unwrap();
        (dir, library)
    }

    fn voices(engine: &Engine) -> Vec<Arc<Voice>> {
        engine.shared().lock_layers().iter().cloned().collect()
    }

    #[test]
    fn test_short_note_plays_out_and_is_freed() {
        let (_dir, library) = library(1500);
        let (engine, mut mixer) = Engine::manual(library, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(60, 100);
        assert_eq!(engine.active_voices(), 1);

        let mut out = vec![0i16; period * 2];
        let mut heard = 0;
        for _ in 0..10 {
            engine.decode_now();
            mixer.read(&mut out, period);
            if out.iter().any(|s| *s != 0) {
                heard += 1;
            }
        }
        // 1500 frames last five full 256-frame periods plus a partial one
        // that is dropped with the voice.
        assert_eq!(heard, 5);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_key_above_center_renders_in_up_layer() {
        let (_dir, library) = library(48000);
        let (engine, mut mixer) = Engine::manual(library, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(61, 100);
        {
            let layers = engine.shared().lock_layers();
            assert_eq!(layers.layer(Layer::Up).len(), 1);
            assert_eq!(layers.layer(Layer::Center).len(), 0);
        }

        engine.decode_now();
        let mut out = vec![0i16; period * 2];
        assert!(mixer.read(&mut out, period));
        engine.decode_now();
        assert!(mixer.read(&mut out, period));
        // Both halves of the period carry signal.
        assert!(out[..period].iter().any(|s| *s != 0));
        assert!(out[period..].iter().any(|s| *s != 0));
    }

    #[test]
    fn test_retrigger_and_release_decay_smoothly() {
        let (_dir, library) = library(48000);
        let (engine, mut mixer) = Engine::manual(library, EngineConfig::default());
        let period = mixer.period();
        let per_period = release_step(0.5, 48000).powi(period as i32);
        let mut out = vec![0i16; period * 2];

        engine.note_event(60, 100);
        engine.decode_now();
        mixer.read(&mut out, period);
        let first = voices(&engine)[0].clone();
        let held = first.current_gain();
        assert!(held > 0.0);

        // Retrigger: the first voice starts releasing, a second one starts.
        engine.note_event(60, 100);
        assert_eq!(first.state(), VoiceState::Releasing);
        let second = voices(&engine)
            .into_iter()
            .find(|v| v.id != first.id)
            .unwrap();

        let mut first_gains = vec![held];
        let mut second_gains = Vec::new();
        for i in 0..12 {
            if i == 4 {
                engine.note_event(60, 0);
            }
            engine.decode_now();
            mixer.read(&mut out, period);
            first_gains.push(first.current_gain());
            second_gains.push(second.current_gain());
        }

        for pair in first_gains.windows(2) {
            let ratio = pair[1] / pair[0];
            assert!((ratio - per_period).abs() < 1e-4, "ratio {} vs {}", ratio, per_period);
        }
        // Held for four periods, then the same ramp as the first voice.
        assert!(second_gains[..4].windows(2).all(|p| p[0] == p[1]));
        for pair in second_gains[3..].windows(2) {
            let ratio = pair[1] / pair[0];
            assert!((ratio - per_period).abs() < 1e-4, "ratio {} vs {}", ratio, per_period);
        }
        assert_eq!(second.state(), VoiceState::Releasing);
    }

    #[test]
    fn test_decoder_thread_primes_voices_until_shutdown() {
        let (_dir, library) = library(48000);
        let (engine, mut mixer) = Engine::start(library, EngineConfig::default()).unwrap();
        let shared = Arc::clone(engine.shared());
        let handle = engine.handle();

        handle.note_event(60, 100);
        let voice = voices(&engine)[0].clone();
        eventually(|| voice.is_primed(), "decoder never primed the voice");

        let period = mixer.period();
        let mut out = vec![0i16; period * 2];
        assert!(mixer.read(&mut out, period));

        engine.shutdown();
        assert!(!shared.is_running());
        assert_eq!(shared.lock_layers().active_count(), 0);
        // Events after shutdown are ignored and the mixer goes quiet.
        handle.note_event(61, 100);
        assert_eq!(shared.lock_layers().active_count(), 0);
        assert!(!mixer.read(&mut out, period));
        assert!(out.iter().all(|s| *s == 0));
    }
}
