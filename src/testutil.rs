use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::envelope::EnergyEnvelope;
use crate::library::{Region, Trigger};

/// Writes interleaved samples as a 16-bit PCM WAV.
pub fn write_wav(path: &Path, channels: u16, sample_rate: u32, samples: &[f32]) {
    let file = File::create(path).unwrap();
    let mut writer = WavWriter::new(
        file,
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
    )
    .unwrap();
    for sample in samples {
        writer
            .write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

/// A stereo tone of `frames` frames at constant `amplitude`.
pub fn write_tone(path: &Path, sample_rate: u32, frames: usize, amplitude: f32) {
    let samples: Vec<f32> = (0..frames)
        .flat_map(|i| {
            let s = amplitude * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sample_rate as f32).sin();
            [s, s]
        })
        .collect();
    write_wav(path, 2, sample_rate, &samples);
}

/// Writes an instrument description next to its samples and returns its path.
pub fn write_instrument(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("instrument.ini");
    std::fs::write(&path, text).unwrap();
    path
}

/// Wait for the given predicate to return true or fail.
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(3);

    loop {
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
    }
}

/// A center-60 attack region with a flat envelope, not backed by a file.
pub fn test_region() -> Arc<Region> {
    Arc::new(Region {
        trigger: Trigger::Attack,
        lo_key: 60,
        hi_key: 60,
        lo_vel: 1,
        hi_vel: 127,
        center_key: 60,
        sample_path: PathBuf::from("unused.wav"),
        envelope: Arc::new(EnergyEnvelope::from_blocks(vec![0.25])),
        release_time: 0.5,
        amp_veltrack: 1.0,
        volume_db: 0.0,
    })
}
