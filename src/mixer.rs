use ringbuf::traits::{Consumer, Observer};
use std::sync::Arc;

use crate::audio_convolver::StereoConvolver;
use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::layer::Layer;
use crate::library::MAX_LEVEL;
use crate::resampler::{Resampler, SEMITONE_DOWN, SEMITONE_UP};
use crate::voice::{CHANNEL_COUNT, Voice, VoiceState};

/// Gain below which a voice is considered inaudible and removed.
pub const SILENCE_FLOOR: f32 = 1e-4;

/// The audio-thread half of the engine. Renders one fixed period per call.
pub struct Mixer {
    shared: Arc<EngineShared>,
    period: usize,
    master_gain: f32,
    reverb_mix: f32,
    reverb: Option<StereoConvolver>,
    /// Indexed by `Layer::index`. The center entry is never used.
    resamplers: [Resampler; 3],
    voices: [Vec<Arc<Voice>>; 3],
    mix: Vec<f32>,
    voice_buf: Vec<f32>,
    layer_buf: Vec<f32>,
    shifted: Vec<f32>,
}

impl Mixer {
    pub fn new(shared: Arc<EngineShared>, reverb: Option<StereoConvolver>) -> Self {
        let period = shared.config.period_frames;
        let ceiling = shared.config.max_voices_per_layer;
        let resamplers = [
            Resampler::new(SEMITONE_DOWN.0, SEMITONE_DOWN.1, CHANNEL_COUNT),
            Resampler::new(1, 1, CHANNEL_COUNT),
            Resampler::new(SEMITONE_UP.0, SEMITONE_UP.1, CHANNEL_COUNT),
        ];
        let widest = resamplers.iter().map(Resampler::taps).max().unwrap_or(0);
        // Enough for a full period at the up ratio plus the first call's lookahead.
        let max_input = period * 2 + widest + 8;
        for layer in Layer::ALL {
            let resampler = &resamplers[layer.index()];
            let (source, target) = resampler.ratio();
            log::debug!(
                "[Mixer] {:?} layer ({:+} semitones): {}:{} resampling, {} taps",
                layer,
                layer.semitones(),
                source,
                target,
                resampler.taps()
            );
        }

        Self {
            master_gain: shared.config.master_gain,
            reverb_mix: shared.config.reverb_mix,
            shared,
            period,
            reverb,
            resamplers,
            voices: [
                Vec::with_capacity(ceiling),
                Vec::with_capacity(ceiling),
                Vec::with_capacity(ceiling),
            ],
            mix: vec![0.0; period * CHANNEL_COUNT],
            voice_buf: vec![0.0; max_input * CHANNEL_COUNT],
            layer_buf: vec![0.0; max_input * CHANNEL_COUNT],
            shifted: vec![0.0; period * CHANNEL_COUNT],
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Renders one period as interleaved stereo `i16`.
    ///
    /// Writes silence and returns false if `period_size` is not the
    /// configured period, `output` is too short, or the engine has stopped.
    pub fn read(&mut self, output: &mut [i16], period_size: usize) -> bool {
        let samples = period_size * CHANNEL_COUNT;
        if !self.accepts(output.len(), period_size) {
            output.fill(0);
            return false;
        }
        self.render();
        for (out, sample) in output[..samples].iter_mut().zip(&self.mix) {
            *out = (sample * 32767.0) as i16;
        }
        true
    }

    /// Same as [`Mixer::read`] for float devices.
    pub fn read_f32(&mut self, output: &mut [f32], period_size: usize) -> bool {
        let samples = period_size * CHANNEL_COUNT;
        if !self.accepts(output.len(), period_size) {
            output.fill(0.0);
            return false;
        }
        self.render();
        output[..samples].copy_from_slice(&self.mix);
        true
    }

    fn accepts(&self, output_len: usize, period_size: usize) -> bool {
        if period_size != self.period {
            log::error!(
                "[Mixer] Period {} does not match configured {}",
                period_size,
                self.period
            );
            return false;
        }
        output_len >= period_size * CHANNEL_COUNT && self.shared.is_running()
    }

    #[cfg_attr(feature = "hotpath", hotpath::measure)]
    fn render(&mut self) {
        {
            let mut layers = self.shared.lock_layers();
            layers.prune();
            layers.snapshot_into(&mut self.voices);
        }
        self.mix.fill(0.0);

        let period = self.period;
        let samples = period * CHANNEL_COUNT;

        for voice in &self.voices[Layer::Center.index()] {
            if drain_voice(voice, period, &mut self.voice_buf[..samples]) {
                for (acc, s) in self.mix.iter_mut().zip(&self.voice_buf[..samples]) {
                    *acc += s;
                }
            }
        }

        for layer in [Layer::Down, Layer::Up] {
            let index = layer.index();
            let resampler = &mut self.resamplers[index];
            if self.voices[index].is_empty() {
                resampler.reset();
                continue;
            }

            let need = resampler
                .required_input(period)
                .min(self.layer_buf.len() / CHANNEL_COUNT);
            let need_samples = need * CHANNEL_COUNT;
            self.layer_buf[..need_samples].fill(0.0);
            for voice in &self.voices[index] {
                if drain_voice(voice, need, &mut self.voice_buf[..need_samples]) {
                    for (acc, s) in self.layer_buf[..need_samples]
                        .iter_mut()
                        .zip(&self.voice_buf[..need_samples])
                    {
                        *acc += s;
                    }
                }
            }

            let mut in_frames = need;
            let mut out_frames = period;
            resampler.filter(
                &self.layer_buf[..need_samples],
                &mut in_frames,
                &mut self.shifted,
                &mut out_frames,
            );
            for (acc, s) in self.mix.iter_mut().zip(&self.shifted[..out_frames * CHANNEL_COUNT]) {
                *acc += s;
            }
        }

        if let Some(reverb) = self.reverb.as_mut() {
            reverb.process(&mut self.mix, period, self.reverb_mix);
        }

        for sample in self.mix.iter_mut() {
            *sample = (*sample * self.master_gain).clamp(-1.0, 1.0);
        }

        for layer in self.voices.iter_mut() {
            layer.clear();
        }
        self.shared.wake_decoder();
    }
}

/// Pulls `frames` frames from a voice into `buf`, applying its gain ramp.
/// Returns false if the voice contributed nothing this period.
fn drain_voice(voice: &Voice, frames: usize, buf: &mut [f32]) -> bool {
    if !voice.is_primed() || voice.state() == VoiceState::Drained {
        return false;
    }
    let Some(mut playback) = voice.try_lock_playback() else {
        return false;
    };

    let wanted = frames * CHANNEL_COUNT;
    let got = playback.consumer.pop_slice(&mut buf[..wanted]);
    if got < wanted {
        if !voice.is_source_finished() {
            log::warn!(
                "[Mixer] {}",
                EngineError::DecoderUnderrun {
                    voice_id: voice.id,
                    missing: (wanted - got) / CHANNEL_COUNT,
                }
            );
        }
        buf[got..wanted].fill(0.0);
    }
    voice.transition(VoiceState::Filling, VoiceState::Playing);

    let step = voice.release_step();
    let mut gain = playback.gain;
    let mut energy = 0.0f32;
    for frame in buf[..wanted].chunks_exact_mut(CHANNEL_COUNT) {
        for sample in frame.iter_mut() {
            *sample *= gain;
            energy += *sample * *sample;
        }
        gain *= step;
    }
    let gain = gain.clamp(0.0, MAX_LEVEL);
    playback.gain = gain;
    playback.position += got / CHANNEL_COUNT;
    voice.publish(gain, playback.position, energy / wanted.max(1) as f32);

    let exhausted =
        voice.is_source_finished() && playback.consumer.occupied_len() < wanted;
    if exhausted || gain < SILENCE_FLOOR {
        voice.mark_drained();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::library::Library;
    use crate::testutil::{write_instrument, write_tone};

    fn engine(frames: usize, config: EngineConfig) -> (tempfile::TempDir, Engine, Mixer) {
        let dir = tempfile::tempdir().unwrap();
        write_tone(&dir.path().join("a.wav"), 48000, frames, 0.5);
        let path = write_instrument(
            dir.path(),
            "[region1]\nlokey = 59\nhikey = 61\npitch_keycenter = 60\nsample = a.wav\nrelease = 0.01\n",
        );
        let library = Library::load(&path, 48000).unwrap();
        let (engine, mixer) = Engine::manual(library, config);
        (dir, engine, mixer)
    }

    #[test]
    fn test_wrong_period_writes_silence() {
        let (_dir, _engine, mut mixer) = engine(4800, EngineConfig::default());
        let mut out = vec![7i16; 128 * 2];
        assert!(!mixer.read(&mut out, 128));
        assert!(out.iter().all(|s| *s == 0));

        let mut short = vec![7i16; 10];
        assert!(!mixer.read(&mut short, mixer.period()));
    }

    #[test]
    fn test_silence_without_voices() {
        let (_dir, _engine, mut mixer) = engine(4800, EngineConfig::default());
        let period = mixer.period();
        let mut out = vec![1i16; period * 2];
        assert!(mixer.read(&mut out, period));
        assert!(out.iter().all(|s| *s == 0));
    }

    #[test]
    fn test_voice_plays_and_transitions_to_playing() {
        let (_dir, engine, mut mixer) = engine(48000, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(60, 127);

        let mut out = vec![0i16; period * 2];
        // Not decoded yet: the voice is skipped, not underrun.
        assert!(mixer.read(&mut out, period));
        assert!(out.iter().all(|s| *s == 0));

        engine.decode_now();
        assert!(mixer.read(&mut out, period));
        assert!(out.iter().any(|s| *s != 0));

        let layers = engine.shared().lock_layers();
        let voice = layers.iter().next().unwrap();
        assert_eq!(voice.state(), VoiceState::Playing);
        assert_eq!(voice.playback_position(), period);
        assert!(voice.output_energy() > 0.0);
    }

    #[test]
    fn test_ring_availability_is_conserved() {
        let (_dir, engine, mut mixer) = engine(48000, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(60, 100);
        engine.note_event(61, 100);
        let mut out = vec![0i16; period * 2];

        for _ in 0..20 {
            engine.decode_now();
            check_rings(&engine);
            mixer.read(&mut out, period);
            check_rings(&engine);
        }
    }

    fn check_rings(engine: &Engine) {
        let layers = engine.shared().lock_layers();
        for voice in layers.iter() {
            let (vacant, occupied) = voice.availability();
            assert_eq!(vacant + occupied, voice.ring_capacity());
        }
    }

    #[test]
    fn test_shifted_layers_produce_full_periods() {
        let (_dir, engine, mut mixer) = engine(48000, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(59, 100);
        engine.note_event(61, 100);
        {
            let layers = engine.shared().lock_layers();
            assert_eq!(layers.layer(Layer::Down).len(), 1);
            assert_eq!(layers.layer(Layer::Up).len(), 1);
        }

        let mut out = vec![0i16; period * 2];
        let mut positions = Vec::new();
        for _ in 0..10 {
            engine.decode_now();
            assert!(mixer.read(&mut out, period));
            let layers = engine.shared().lock_layers();
            let up = &layers.layer(Layer::Up)[0];
            let down = &layers.layer(Layer::Down)[0];
            positions.push((up.playback_position(), down.playback_position()));
        }
        // After ten periods the up voice has consumed about 89/84 as much
        // source as it produced, the down voice about 84/89.
        let (up, down) = positions[9];
        let produced = 10.0 * period as f64;
        assert!((up as f64 / produced - 89.0 / 84.0).abs() < 0.03);
        assert!((down as f64 / produced - 84.0 / 89.0).abs() < 0.03);
        // The tail of the last period is real signal, not zero padding.
        assert!(out[out.len() - 32..].iter().any(|s| *s != 0));
    }

    #[test]
    fn test_master_gain_and_clamp() {
        let config = EngineConfig {
            master_gain: 100.0,
            ..Default::default()
        };
        let (_dir, engine, mut mixer) = engine(48000, config);
        let period = mixer.period();
        engine.note_event(60, 127);
        engine.decode_now();
        let mut out = vec![0f32; period * 2];
        assert!(mixer.read_f32(&mut out, period));
        assert!(out.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(out.iter().any(|s| s.abs() == 1.0));
    }

    #[test]
    fn test_release_removes_voice_once_inaudible() {
        let (_dir, engine, mut mixer) = engine(48000, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(60, 100);
        engine.decode_now();
        let mut out = vec![0i16; period * 2];
        mixer.read(&mut out, period);

        engine.note_event(60, 0);
        // A 10 ms release falls below the floor in well under ten periods.
        for _ in 0..10 {
            engine.decode_now();
            mixer.read(&mut out, period);
        }
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_underrun_zero_fills_and_keeps_voice() {
        let (_dir, engine, mut mixer) = engine(96000, EngineConfig::default());
        let period = mixer.period();
        engine.note_event(60, 100);
        engine.decode_now();
        let buffered = {
            let layers = engine.shared().lock_layers();
            layers.iter().next().unwrap().availability().1 / CHANNEL_COUNT
        };
        assert_eq!(buffered % period, 0);
        let full_periods = buffered / period;

        // No more decoding: the ring runs dry and the mixer forces a read.
        let mut out = vec![0i16; period * 2];
        for i in 0..full_periods + 4 {
            assert!(mixer.read(&mut out, period));
            if i < full_periods {
                assert!(out.iter().any(|s| *s != 0), "period {} should carry signal", i);
            } else {
                assert!(out.iter().all(|s| *s == 0), "period {} should be silent", i);
            }
        }

        assert_eq!(engine.active_voices(), 1);
        let layers = engine.shared().lock_layers();
        let voice = layers.iter().next().unwrap();
        assert_eq!(voice.state(), VoiceState::Playing);
        assert!(!voice.is_source_finished());
        assert_eq!(voice.playback_position(), buffered);
    }
}
