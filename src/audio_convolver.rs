use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::EngineError;
use crate::resampler::resample_interleaved;
use crate::wav::{WavSampleReader, parse_wav_metadata};

/// Peak level impulse responses are normalized to.
const IR_TARGET_PEAK: f32 = 0.015;

/// One channel of time-domain convolution against a reversed impulse response.
struct ChannelConvolver {
    /// Impulse response, time-reversed so the dot product runs forwards.
    reversed_ir: Vec<f32>,
    /// Circular history of impulse length plus one period.
    history: Vec<f32>,
}

impl ChannelConvolver {
    fn new(mut ir: Vec<f32>, period: usize) -> Self {
        ir.reverse();
        let history = vec![0.0; ir.len() + period];
        Self {
            reversed_ir: ir,
            history,
        }
    }

    /// Convolves `frames` interleaved samples of channel `channel` in place.
    fn process(&mut self, buffer: &mut [f32], channel: usize, frames: usize, write_pos: usize, mix: f32) {
        let len = self.history.len();
        let taps = self.reversed_ir.len();

        for i in 0..frames {
            self.history[(write_pos + i) % len] = buffer[i * 2 + channel];
        }

        for n in 0..frames {
            let newest = (write_pos + n) % len;
            let oldest = (newest + len + 1 - taps) % len;
            let wet = if oldest <= newest {
                dot(&self.history[oldest..=newest], &self.reversed_ir)
            } else {
                // The window wraps: the older part sits at the tail of the history.
                let split = len - oldest;
                dot(&self.history[oldest..], &self.reversed_ir[..split])
                    + dot(&self.history[..=newest], &self.reversed_ir[split..])
            };
            let dry = buffer[n * 2 + channel];
            buffer[n * 2 + channel] = dry * (1.0 - mix) + wet * mix;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A stereo convolution reverb over fixed-size periods.
pub struct StereoConvolver {
    left: ChannelConvolver,
    right: ChannelConvolver,
    period: usize,
    history_len: usize,
    write_pos: usize,
}

impl StereoConvolver {
    /// Builds a convolver from per-channel impulse responses, peak-normalizing them.
    pub fn new(mut ir_l: Vec<f32>, mut ir_r: Vec<f32>, period: usize) -> Self {
        let period = period.max(1);
        let len = ir_l.len().max(ir_r.len()).max(1);
        ir_l.resize(len, 0.0);
        ir_r.resize(len, 0.0);

        // Peak Normalization
        let max_l = ir_l.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
        let max_r = ir_r.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
        let global_peak = max_l.max(max_r);

        if global_peak > 0.0 {
            let scale = IR_TARGET_PEAK / global_peak;
            log::debug!(
                "[Convolver] Normalizing IR. Input Peak: {:.4}, Scale Factor: {:.4}",
                global_peak,
                scale
            );
            for x in ir_l.iter_mut().chain(ir_r.iter_mut()) {
                *x *= scale;
            }
        } else {
            log::warn!("[Convolver] IR appears to be silent.");
        }

        Self {
            left: ChannelConvolver::new(ir_l, period),
            right: ChannelConvolver::new(ir_r, period),
            period,
            history_len: len + period,
            write_pos: 0,
        }
    }

    pub fn from_file(
        path: &Path,
        sample_rate: u32,
        max_frames: usize,
        period: usize,
    ) -> Result<Self, EngineError> {
        log::info!("[Convolver] Loading IR from {:?}", path);

        let file = File::open(path).map_err(|e| EngineError::decode(path, e))?;
        let mut reader = BufReader::new(file);
        let (fmt, data_start, data_size) =
            parse_wav_metadata(&mut reader, path).map_err(|e| EngineError::decode(path, e))?;
        let mut decoder = WavSampleReader::new(reader, fmt, data_start, data_size)
            .map_err(|e| EngineError::decode(path, e))?;

        let frames = decoder.frames();
        let mut interleaved = vec![0.0f32; frames * 2];
        let read = decoder.read_stereo_frames(&mut interleaved, frames);
        interleaved.truncate(read * 2);
        if interleaved.is_empty() {
            return Err(EngineError::decode(path, "IR contains no samples"));
        }

        if fmt.sample_rate != sample_rate {
            log::warn!(
                "[Convolver] IR Rate Mismatch (File: {}, Engine: {}). Resampling...",
                fmt.sample_rate,
                sample_rate
            );
            interleaved = resample_interleaved(&interleaved, 2, fmt.sample_rate, sample_rate);
        }

        let mut ir_frames = interleaved.len() / 2;
        if max_frames > 0 && ir_frames > max_frames {
            log::info!(
                "[Convolver] Truncating IR from {} to {} frames",
                ir_frames,
                max_frames
            );
            ir_frames = max_frames;
        }
        let ir_l: Vec<f32> = interleaved.iter().step_by(2).take(ir_frames).copied().collect();
        let ir_r: Vec<f32> = interleaved.iter().skip(1).step_by(2).take(ir_frames).copied().collect();

        log::info!("[Convolver] Successfully prepared {} frame IR.", ir_frames);
        Ok(Self::new(ir_l, ir_r, period))
    }

    pub fn ir_frames(&self) -> usize {
        self.history_len - self.period
    }

    /// Mixes reverb into one period of interleaved stereo, in place.
    #[cfg_attr(feature = "hotpath", hotpath::measure)]
    pub fn process(&mut self, buffer: &mut [f32], frames: usize, mix: f32) {
        let frames = frames.min(self.period).min(buffer.len() / 2);
        self.left.process(buffer, 0, frames, self.write_pos, mix);
        self.right.process(buffer, 1, frames, self.write_pos, mix);
        self.write_pos = (self.write_pos + frames) % self.history_len;
    }
}
