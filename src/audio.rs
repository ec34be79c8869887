use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use crate::audio_recorder::RecordSink;
use crate::mixer::Mixer;
use crate::voice::CHANNEL_COUNT;

/// Serves device callbacks of any length from fixed mixer periods.
///
/// Leftover samples from the last rendered period are handed out first.
pub struct PeriodAdapter<T> {
    pending: Vec<T>,
    pos: usize,
    period: usize,
}

impl<T: Copy + Default> PeriodAdapter<T> {
    pub fn new(period: usize) -> Self {
        let samples = period * CHANNEL_COUNT;
        Self {
            pending: vec![T::default(); samples],
            pos: samples,
            period,
        }
    }

    /// Fills `output`, calling `render` for each new period it needs.
    ///
    /// Returns false if any period failed to render; that period plays as silence.
    pub fn fill<F>(&mut self, output: &mut [T], mut render: F) -> bool
    where
        F: FnMut(&mut [T], usize) -> bool,
    {
        let mut ok = true;
        let mut written = 0;
        while written < output.len() {
            if self.pos == self.pending.len() {
                ok &= render(&mut self.pending, self.period);
                self.pos = 0;
            }
            let n = (output.len() - written).min(self.pending.len() - self.pos);
            output[written..written + n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            written += n;
            self.pos += n;
        }
        ok
    }
}

/// Opens the default output device at the engine rate and drives `mixer` from its callback.
///
/// Rendered output is also pushed to `recorder` when one is given.
pub fn start_audio_output(mut mixer: Mixer, sample_rate: u32, recorder: Option<RecordSink>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No default output device available"))?;

    log::info!(
        "[Cpal] Default output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    log::debug!("[Cpal] Supported output configs:");
    for config in device.supported_output_configs()? {
        log::debug!(
            "  - Channels: {}, Sample Rate: {}-{}, Format: {:?}",
            config.channels(),
            config.min_sample_rate(),
            config.max_sample_rate(),
            config.sample_format()
        );
    }

    let supports = |c: &cpal::SupportedStreamConfigRange, format: SampleFormat| {
        c.channels() as usize == CHANNEL_COUNT
            && c.sample_format() == format
            && c.min_sample_rate() <= sample_rate
            && c.max_sample_rate() >= sample_rate
    };
    let config = device
        .supported_output_configs()?
        .find(|c| supports(c, SampleFormat::F32))
        .or_else(|| {
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, SampleFormat::I16))
        })
        .ok_or_else(|| anyhow!("No stereo F32 or I16 config at {} Hz found", sample_rate))?
        .with_sample_rate(sample_rate);

    let sample_format = config.sample_format();
    let stream_config: StreamConfig = config.into();
    log::info!(
        "[Cpal] Using config: SampleRate: {}, Channels: {}, Format: {:?}, Period: {} frames",
        stream_config.sample_rate,
        stream_config.channels,
        sample_format,
        mixer.period()
    );

    let err_callback = |err| {
        log::error!("[CpalCallback] Stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let mut adapter = PeriodAdapter::<f32>::new(mixer.period());
            let data_callback = move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let ok = adapter.fill(output, |period, frames| mixer.read_f32(period, frames));
                if !ok {
                    log::warn!("[CpalCallback] Mixer returned silence");
                }
                if let Some(rec) = &recorder {
                    rec.push_f32(output);
                }
            };
            device.build_output_stream(&stream_config, data_callback, err_callback, None)?
        }
        SampleFormat::I16 => {
            let mut adapter = PeriodAdapter::<i16>::new(mixer.period());
            let data_callback = move |output: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let ok = adapter.fill(output, |period, frames| mixer.read(period, frames));
                if !ok {
                    log::warn!("[CpalCallback] Mixer returned silence");
                }
                if let Some(rec) = &recorder {
                    rec.push(output);
                }
            };
            device.build_output_stream(&stream_config, data_callback, err_callback, None)?
        }
        other => return Err(anyhow!("Unsupported sample format {:?}", other)),
    };

    stream.play()?;
    Ok(stream)
}
