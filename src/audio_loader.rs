use ringbuf::traits::{Observer, Producer};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

use crate::engine::EngineShared;
use crate::source::open_source;
use crate::voice::{CHANNEL_COUNT, DECODE_BLOCK_FRAMES, Voice, VoiceState};

/// Buffers the decoder reuses between passes.
#[derive(Default)]
pub struct DecodeScratch {
    voices: [Vec<Arc<Voice>>; 3],
    retired: Vec<Arc<Voice>>,
}

pub fn spawn_decoder(
    shared: Arc<EngineShared>,
    wake_rx: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rusty-keys-decoder".to_string())
        .spawn(move || run_decoder(shared, wake_rx))
}

/// Sleeps until woken, then tops up every voice. Exits once the engine stops.
fn run_decoder(shared: Arc<EngineShared>, wake_rx: Receiver<()>) {
    log::info!("[Decoder] Thread started");
    let mut scratch = DecodeScratch::default();

    while shared.is_running() {
        if wake_rx.recv().is_err() {
            break;
        }
        if !shared.is_running() {
            break;
        }

        // A panicking decoder must not take the engine down with it.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            decode_pass(&shared, &mut scratch)
        }));
        if let Err(e) = result {
            log::error!("[Decoder] Pass PANICKED: {:?}", e);
            scratch = DecodeScratch::default();
        }
    }
    log::info!("[Decoder] Thread exiting");
}

/// One top-up of every live voice. Returns the number of blocks decoded.
#[cfg_attr(feature = "hotpath", hotpath::measure)]
pub fn decode_pass(shared: &EngineShared, scratch: &mut DecodeScratch) -> usize {
    {
        let mut layers = shared.lock_layers();
        layers.prune();
        layers.take_retired(&mut scratch.retired);
        layers.snapshot_into(&mut scratch.voices);
    }
    // Only free voices nobody else holds, so the mixer never drops the last
    // reference from its snapshot. The rest wait for a later pass.
    if !scratch.retired.is_empty() {
        let before = scratch.retired.len();
        scratch.retired.retain(|voice| Arc::strong_count(voice) > 1);
        log::trace!("[Decoder] Freed {} voices", before - scratch.retired.len());
    }

    let mut blocks = 0;
    for voice in scratch.voices.iter().flatten() {
        blocks += fill_voice(voice);
    }
    for layer in scratch.voices.iter_mut() {
        layer.clear();
    }
    blocks
}

fn fill_voice(voice: &Voice) -> usize {
    if voice.state() == VoiceState::Drained || voice.is_source_finished() {
        return 0;
    }

    let mut feed = voice.lock_feed();
    if feed.source.is_none() {
        match open_source(&voice.region.sample_path) {
            Ok(source) => {
                feed.source = Some(source);
                voice.transition(VoiceState::Allocated, VoiceState::Filling);
            }
            Err(e) => {
                log::error!("[Decoder] Voice {}: {}", voice.id, e);
                voice.mark_drained();
                return 0;
            }
        }
    }

    let feed = &mut *feed;
    let Some(source) = feed.source.as_mut() else {
        return 0;
    };

    let block_samples = DECODE_BLOCK_FRAMES * CHANNEL_COUNT;
    let mut blocks = 0;
    while feed.producer.vacant_len() >= block_samples {
        if voice.state() == VoiceState::Drained {
            break;
        }
        let frames = match source.read_frames(&mut feed.block[..block_samples]) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("[Decoder] Voice {}: {}", voice.id, e);
                0
            }
        };
        if frames == 0 {
            voice.set_source_finished();
            voice.set_primed();
            feed.source = None;
            log::trace!("[Decoder] Voice {} source exhausted at frame {}", voice.id, feed.cursor);
            break;
        }

        let pushed = feed.producer.push_slice(&feed.block[..frames * CHANNEL_COUNT]);
        debug_assert_eq!(pushed, frames * CHANNEL_COUNT);
        feed.cursor += frames;
        blocks += 1;
        voice.set_primed();
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::library::Library;
    use crate::testutil::{write_instrument, write_tone};
    use crate::voice::VOICE_BUFFER_FRAMES;

    fn engine(frames: usize) -> (tempfile::TempDir, Engine, crate::mixer::Mixer) {
        let dir = tempfile::tempdir().unwrap();
        write_tone(&dir.path().join("a.wav"), 48000, frames, 0.5);
        let path = write_instrument(dir.path(), "[region1]\nkey = 60\nsample = a.wav\n");
        let library = Library::load(&path, 48000).unwrap();
        let (engine, mixer) = Engine::manual(library, EngineConfig::default());
        (dir, engine, mixer)
    }

    #[test]
    fn test_pass_fills_ring_up_to_capacity() {
        let (_dir, engine, _mixer) = engine(48000);
        engine.note_event(60, 100);
        let blocks = engine.decode_now();
        assert_eq!(blocks, VOICE_BUFFER_FRAMES / DECODE_BLOCK_FRAMES);

        let layers = engine.shared().lock_layers();
        let voice = layers.iter().next().unwrap();
        assert_eq!(voice.state(), VoiceState::Filling);
        assert!(voice.is_primed());
        assert!(!voice.is_source_finished());
        let (vacant, occupied) = voice.availability();
        assert_eq!(vacant + occupied, voice.ring_capacity());
        assert!(vacant < DECODE_BLOCK_FRAMES * CHANNEL_COUNT);
    }

    #[test]
    fn test_short_source_finishes() {
        let (_dir, engine, _mixer) = engine(1500);
        engine.note_event(60, 100);
        engine.decode_now();

        let layers = engine.shared().lock_layers();
        let voice = layers.iter().next().unwrap();
        assert!(voice.is_source_finished());
        assert_eq!(voice.availability().1, 1500 * CHANNEL_COUNT);
        assert_eq!(voice.lock_feed().cursor, 1500);
    }

    #[test]
    fn test_unreadable_source_drains_voice() {
        let (dir, engine, _mixer) = engine(1500);
        std::fs::write(dir.path().join("a.wav"), b"not a wave file").unwrap();
        engine.note_event(60, 100);
        engine.decode_now();
        {
            let layers = engine.shared().lock_layers();
            assert_eq!(layers.iter().next().unwrap().state(), VoiceState::Drained);
        }
        // The next pass removes it.
        engine.decode_now();
        assert_eq!(engine.active_voices(), 0);
    }
}
