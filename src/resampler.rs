use std::f64::consts::PI;

/// Taps per phase when upsampling. Downsampling widens this by the rate ratio.
const BASE_TAPS: usize = 32;
/// Passband edge as a fraction of the lower Nyquist frequency.
const CUTOFF: f64 = 0.95;
/// Input frames the work buffer can hold beyond one kernel.
const WORK_FRAMES: usize = 4096;

/// Source:target ratios for the shifted layers. 89/84 is within 0.1 cent of 2^(1/12).
pub const SEMITONE_UP: (u32, u32) = (89, 84);
pub const SEMITONE_DOWN: (u32, u32) = (84, 89);

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn blackman(n: f64, width: f64) -> f64 {
    let x = 2.0 * PI * n / width;
    0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
}

/// Fixed-ratio polyphase FIR resampler over interleaved frames.
///
/// Output frame `n` sits at input time `n * source / target`, so the
/// resampler adds no delay; it does hold back half a kernel of lookahead.
pub struct Resampler {
    source_rate: usize,
    target_rate: usize,
    channels: usize,
    taps: usize,
    /// `target_rate` kernels of `taps` coefficients, one per output phase.
    kernels: Vec<f32>,
    /// Interleaved input history plus room for new input.
    history: Vec<f32>,
    capacity: usize,
    filled: usize,
    position: usize,
    phase: usize,
    step_whole: usize,
    step_frac: usize,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Self {
        let source_rate = source_rate.max(1);
        let target_rate = target_rate.max(1);
        let divisor = gcd(source_rate, target_rate);
        let source = (source_rate / divisor) as usize;
        let target = (target_rate / divisor) as usize;
        let channels = channels.max(1);

        let (taps, cutoff) = if source > target {
            let widened = (BASE_TAPS * source).div_ceil(target);
            (widened + widened % 2, CUTOFF * target as f64 / source as f64)
        } else {
            (BASE_TAPS, CUTOFF)
        };

        let kernels = if source == target {
            Vec::new()
        } else {
            Self::build_kernels(target, taps, cutoff)
        };

        let capacity = taps + WORK_FRAMES;
        let mut resampler = Self {
            source_rate: source,
            target_rate: target,
            channels,
            taps,
            kernels,
            history: vec![0.0; capacity * channels],
            capacity,
            filled: 0,
            position: 0,
            phase: 0,
            step_whole: source / target,
            step_frac: source % target,
        };
        resampler.reset();

        log::debug!(
            "[Resampler] {}:{} reduced to {}:{} ({} phases, {} taps)",
            source_rate,
            target_rate,
            source,
            target,
            target,
            taps
        );
        resampler
    }

    fn build_kernels(phases: usize, taps: usize, cutoff: f64) -> Vec<f32> {
        let half = (taps / 2) as f64;
        let mut kernels = Vec::with_capacity(phases * taps);
        let mut kernel = vec![0.0f64; taps];

        for phase in 0..phases {
            let frac = phase as f64 / phases as f64;
            for (k, coeff) in kernel.iter_mut().enumerate() {
                let tau = half - 1.0 + frac - k as f64;
                let arg = PI * cutoff * tau;
                let sinc = if arg.abs() < 1e-12 { 1.0 } else { arg.sin() / arg };
                *coeff = sinc * blackman(k as f64 + 1.0 - frac, taps as f64);
            }
            let sum: f64 = kernel.iter().sum();
            kernels.extend(kernel.iter().map(|c| (c / sum) as f32));
        }
        kernels
    }

    /// Reduced (source, target) rates.
    pub fn ratio(&self) -> (usize, usize) {
        (self.source_rate, self.target_rate)
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    pub fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate
    }

    /// Clears the history so the next call starts from silence.
    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.filled = if self.is_passthrough() {
            0
        } else {
            self.taps / 2 - 1
        };
        self.position = 0;
        self.phase = 0;
    }

    /// Number of further input frames needed before `frames` outputs can be produced.
    pub fn required_input(&self, frames: usize) -> usize {
        if self.is_passthrough() {
            return frames;
        }
        if frames == 0 {
            return 0;
        }
        let numerator = self.phase + (frames - 1) * self.source_rate;
        let last_position = self.position + numerator / self.target_rate;
        (last_position + self.taps).saturating_sub(self.filled)
    }

    /// Converts as much of `input` into `output` as the ratio allows.
    ///
    /// On entry `input_frames` is the number of input frames available and
    /// `output_frames` the output capacity. On return they hold the frames
    /// consumed and produced.
    #[cfg_attr(feature = "hotpath", hotpath::measure)]
    pub fn filter(
        &mut self,
        input: &[f32],
        input_frames: &mut usize,
        output: &mut [f32],
        output_frames: &mut usize,
    ) {
        let ch = self.channels;
        let available = (*input_frames).min(input.len() / ch);
        let room = (*output_frames).min(output.len() / ch);

        if self.is_passthrough() {
            let n = available.min(room);
            output[..n * ch].copy_from_slice(&input[..n * ch]);
            *input_frames = n;
            *output_frames = n;
            return;
        }

        let mut consumed = 0;
        let mut produced = 0;
        loop {
            while produced < room && self.position + self.taps <= self.filled {
                self.render_frame(&mut output[produced * ch..(produced + 1) * ch]);
                produced += 1;
                self.advance();
            }
            if produced == room || consumed == available {
                break;
            }

            self.compact();
            let n = (self.capacity - self.filled).min(available - consumed);
            let dst = self.filled * ch;
            self.history[dst..dst + n * ch]
                .copy_from_slice(&input[consumed * ch..(consumed + n) * ch]);
            self.filled += n;
            consumed += n;
        }

        *input_frames = consumed;
        *output_frames = produced;
    }

    fn render_frame(&self, frame: &mut [f32]) {
        let ch = self.channels;
        let kernel = &self.kernels[self.phase * self.taps..(self.phase + 1) * self.taps];
        let window = &self.history[self.position * ch..(self.position + self.taps) * ch];
        for (c, out) in frame.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (k, coeff) in kernel.iter().enumerate() {
                acc += window[k * ch + c] * coeff;
            }
            *out = acc;
        }
    }

    fn advance(&mut self) {
        self.position += self.step_whole;
        self.phase += self.step_frac;
        if self.phase >= self.target_rate {
            self.phase -= self.target_rate;
            self.position += 1;
        }
    }

    /// Drops frames that no future window can reach.
    fn compact(&mut self) {
        let shift = self.position.min(self.filled);
        if shift == 0 {
            return;
        }
        let ch = self.channels;
        self.history.copy_within(shift * ch..self.filled * ch, 0);
        self.filled -= shift;
        self.position -= shift;
    }
}

/// Offline conversion of a whole interleaved buffer, used for impulse responses.
pub fn resample_interleaved(
    input: &[f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let mut resampler = Resampler::new(from_rate, to_rate, channels);
    let input_frames = input.len() / channels;
    let output_frames =
        (input_frames as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;
    let mut output = vec![0.0f32; output_frames * channels];
    let silence = vec![0.0f32; resampler.taps() * channels];

    let mut consumed = 0;
    let mut produced = 0;
    while produced < output_frames {
        let chunk = if consumed < input_frames {
            &input[consumed * channels..]
        } else {
            &silence[..]
        };
        let mut in_n = chunk.len() / channels;
        let mut out_n = output_frames - produced;
        resampler.filter(chunk, &mut in_n, &mut output[produced * channels..], &mut out_n);
        if consumed < input_frames {
            consumed += in_n;
        }
        produced += out_n;
        if in_n == 0 && out_n == 0 {
            break;
        }
    }
    output.truncate(produced * channels);

    log::info!(
        "[Resampler] Resampled {}Hz to {}Hz. ({} -> {} frames)",
        from_rate,
        to_rate,
        input_frames,
        produced
    );
    output
}
