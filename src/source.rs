use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::EngineError;
use crate::wav::{IsWavPackError, WavSampleReader, parse_wav_metadata};

/// A decoder producing interleaved stereo `f32` frames one block at a time.
pub trait SampleSource: Send {
    fn sample_rate(&self) -> u32;

    /// Channels in the underlying file. Output is always stereo.
    fn channels(&self) -> u16;

    /// Total length in frames, when the container reports it.
    fn frames(&self) -> Option<usize>;

    /// Fills `out` (interleaved stereo) with up to `out.len() / 2` frames.
    /// Returns the frames written; zero means the source is exhausted.
    fn read_frames(&mut self, out: &mut [f32]) -> Result<usize, EngineError>;
}

/// Opens `path` with the decoder its extension calls for.
pub fn open_source(path: &Path) -> Result<Box<dyn SampleSource>, EngineError> {
    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));

    if is_wav {
        Ok(Box::new(WavSource::open(path)?))
    } else {
        Ok(Box::new(CompressedSource::open(path)?))
    }
}

/// Uncompressed RIFF/WAVE reader.
pub struct WavSource {
    path: PathBuf,
    reader: WavSampleReader<BufReader<File>>,
}

impl WavSource {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::decode(path, e))?;
        let mut reader = BufReader::new(file);
        let (fmt, data_start, data_size) =
            parse_wav_metadata(&mut reader, path).map_err(|e| {
                if e.downcast_ref::<IsWavPackError>().is_some() {
                    EngineError::decode(path, "WavPack data is not supported")
                } else {
                    EngineError::decode(path, e)
                }
            })?;
        let reader = WavSampleReader::new(reader, fmt, data_start, data_size)
            .map_err(|e| EngineError::decode(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
        })
    }
}

impl SampleSource for WavSource {
    fn sample_rate(&self) -> u32 {
        self.reader.sample_rate()
    }

    fn channels(&self) -> u16 {
        self.reader.channels()
    }

    fn frames(&self) -> Option<usize> {
        Some(self.reader.frames())
    }

    fn read_frames(&mut self, out: &mut [f32]) -> Result<usize, EngineError> {
        let frames = out.len() / 2;
        let read = self.reader.read_stereo_frames(out, frames);
        if read == 0 && frames > 0 {
            log::trace!("[Source] {:?} exhausted", self.path);
        }
        Ok(read)
    }
}

/// FLAC and Ogg Vorbis through symphonia.
pub struct CompressedSource {
    path: PathBuf,
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    frames: Option<usize>,
    /// Decoded stereo frames not yet handed out.
    pending: Vec<f32>,
    pending_pos: usize,
    finished: bool,
}

impl CompressedSource {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::decode(path, e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| EngineError::decode(path, e))?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| EngineError::decode(path, "no audio track found"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| EngineError::decode(path, "sample rate not specified"))?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let frames = params.n_frames.map(|n| n as usize);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| EngineError::decode(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            format_reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            frames,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    /// Decodes the next packet of our track into `pending`.
    /// Returns false at end of stream.
    fn decode_packet(&mut self) -> Result<bool, EngineError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(EngineError::decode(&self.path, e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("[Source] Skipping corrupt packet in {:?}: {}", self.path, e);
                    continue;
                }
                Err(e) => return Err(EngineError::decode(&self.path, e)),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            if channels == 0 || decoded.frames() == 0 {
                continue;
            }
            let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buffer.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending_pos = 0;
            for frame in buffer.samples().chunks_exact(channels) {
                let left = frame[0];
                let right = if channels == 1 { left } else { frame[1] };
                self.pending.push(left);
                self.pending.push(right);
            }
            return Ok(true);
        }
    }
}

impl SampleSource for CompressedSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn frames(&self) -> Option<usize> {
        self.frames
    }

    fn read_frames(&mut self, out: &mut [f32]) -> Result<usize, EngineError> {
        let wanted = out.len() / 2;
        let mut written = 0;
        while written < wanted && !self.finished {
            if self.pending_pos >= self.pending.len() && !self.decode_packet()? {
                self.finished = true;
                break;
            }
            let available = (self.pending.len() - self.pending_pos) / 2;
            let n = available.min(wanted - written);
            out[written * 2..(written + n) * 2]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n * 2]);
            self.pending_pos += n * 2;
            written += n;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    #[test]
    fn test_open_source_reads_whole_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..3000).map(|i| ((i % 100) as f32 - 50.0) / 100.0).collect();
        write_wav(&path, 1, 48000, &samples);

        let mut source = open_source(&path).unwrap();
        assert_eq!(source.sample_rate(), 48000);
        assert_eq!(source.channels(), 1);
        assert_eq!(source.frames(), Some(3000));

        let mut block = vec![0.0f32; 1024 * 2];
        let mut total = 0;
        loop {
            let n = source.read_frames(&mut block).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 3000);
    }

    #[test]
    fn test_missing_file_is_a_decode_error() {
        let err = open_source(Path::new("/nonexistent/piano.wav")).err().unwrap();
        assert!(matches!(err, EngineError::Decode { .. }));
        let err = open_source(Path::new("/nonexistent/piano.flac")).err().unwrap();
        assert!(matches!(err, EngineError::Decode { .. }));
    }
}
