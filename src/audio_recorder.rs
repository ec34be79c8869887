use anyhow::Result;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

/// The audio callback's end of a recording.
#[derive(Clone)]
pub struct RecordSink {
    sender: mpsc::Sender<Vec<i16>>,
}

impl RecordSink {
    pub fn push(&self, buffer: &[i16]) {
        let _ = self.sender.send(buffer.to_vec());
    }

    /// Converts float output the same way the mixer converts to `i16`.
    pub fn push_f32(&self, buffer: &[f32]) {
        let converted = buffer
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        let _ = self.sender.send(converted);
    }
}

/// Captures rendered output to a 16-bit stereo WAV on a writer thread.
pub struct AudioRecorder {
    sender: mpsc::Sender<Vec<i16>>,
    thread_handle: Option<thread::JoinHandle<()>>,
    path: PathBuf,
}

impl AudioRecorder {
    /// Default recording directory, next to the settings file.
    pub fn default_dir() -> Result<PathBuf> {
        let config_path = confy::get_configuration_file_path("rusty-keys", "settings")?;
        let parent = config_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("No config parent dir"))?;
        Ok(parent.join("recordings"))
    }

    pub fn start(name: &str, sample_rate: u32, recording_dir: &Path) -> Result<Self> {
        if !recording_dir.exists() {
            fs::create_dir_all(recording_dir)?;
        }

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let filename = format!("{}_{}.wav", name, timestamp);
        let path = recording_dir.join(filename);

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        // Create up front so a bad path fails here rather than on the thread.
        let mut writer = hound::WavWriter::create(&path, spec)?;

        let (tx, rx) = mpsc::channel::<Vec<i16>>();
        let handle = thread::Builder::new()
            .name("rusty-keys-recorder".to_string())
            .spawn(move || {
                for buffer in rx {
                    for sample in buffer {
                        if let Err(e) = writer.write_sample(sample) {
                            log::error!("[Recorder] Error writing sample: {}", e);
                            return;
                        }
                    }
                }
                match writer.finalize() {
                    Ok(()) => log::info!("[Recorder] WAV recording saved."),
                    Err(e) => log::error!("[Recorder] Failed to finalize WAV: {}", e),
                }
            })?;

        log::info!("[Recorder] Started recording audio to {:?}", path);

        Ok(Self {
            sender: tx,
            thread_handle: Some(handle),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sink(&self) -> RecordSink {
        RecordSink {
            sender: self.sender.clone(),
        }
    }

    /// Flushes everything pushed so far and closes the file.
    ///
    /// Blocks until every [`RecordSink`] is dropped.
    pub fn stop(self) {
        let AudioRecorder {
            sender,
            thread_handle,
            ..
        } = self;
        drop(sender);
        if let Some(h) = thread_handle {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_pushed_periods() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = AudioRecorder::start("piano", 48000, dir.path()).unwrap();
        let path = recorder.path().to_path_buf();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("piano_"));

        let sink = recorder.sink();
        sink.push(&[100, -100, 200, -200]);
        sink.push_f32(&[0.5, -0.5]);
        drop(sink);
        recorder.stop();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![100, -100, 200, -200, 16383, -16383]);
    }
}
