use anyhow::{Error, Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

const I16_MAX_F: f32 = 32768.0; // 2^15
const I24_MAX_F: f32 = 8388608.0; // 2^23
const I32_MAX_F: f32 = 2147483648.0; // 2^31

/// Holds format information from the 'fmt ' chunk.
#[derive(Debug, Clone, Copy)]
pub struct WavFmt {
    pub audio_format: u16, // 1 = PCM, 3 = IEEE Float
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFmt {
    pub fn bytes_per_frame(&self) -> u32 {
        (self.bits_per_sample as u32 / 8) * self.num_channels as u32
    }
}

// Custom error type to signal WavPack detection
#[derive(Debug)]
pub struct IsWavPackError;
impl std::fmt::Display for IsWavPackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "File appears to be WavPack")
    }
}
impl std::error::Error for IsWavPackError {}

/// Parses the format and locates the data chunk in one pass.
/// Returns the format plus the data chunk's offset and size in bytes.
pub fn parse_wav_metadata<R: Read + Seek>(
    reader: &mut R,
    full_path_for_logs: &Path,
) -> Result<(WavFmt, u64, u32)> {
    let mut header = [0; 4];
    reader.read_exact(&mut header)?;

    if &header == b"wvpk" {
        return Err(Error::new(IsWavPackError));
    }
    if &header != b"RIFF" {
        return Err(anyhow!(
            "Not a RIFF file (found {:?}): {:?}",
            header,
            full_path_for_logs
        ));
    }

    let _file_size = reader.read_u32::<LittleEndian>()?;
    let mut wave_header = [0; 4];
    reader.read_exact(&mut wave_header)?;
    if &wave_header != b"WAVE" {
        return Err(anyhow!("Not a WAVE file: {:?}", full_path_for_logs));
    }

    let mut format_chunk: Option<WavFmt> = None;
    let mut data_chunk_info: Option<(u64, u32)> = None; // (offset, size)

    while let Ok(chunk_id) = reader.read_u32::<LittleEndian>().map(|id| id.to_le_bytes()) {
        let chunk_size = reader.read_u32::<LittleEndian>()?;
        let chunk_data_start_pos = reader.stream_position()?;
        let next_chunk_aligned_pos =
            chunk_data_start_pos + (chunk_size as u64 + ((chunk_size as u64) % 2));

        match &chunk_id {
            b"fmt " => {
                let mut fmt_data = vec![0; chunk_size as usize];
                reader.read_exact(&mut fmt_data)?;
                let mut cursor = Cursor::new(fmt_data);
                format_chunk = Some(WavFmt {
                    audio_format: cursor.read_u16::<LittleEndian>()?,
                    num_channels: cursor.read_u16::<LittleEndian>()?,
                    sample_rate: cursor.read_u32::<LittleEndian>()?,
                    bits_per_sample: {
                        cursor.seek(SeekFrom::Start(14))?;
                        cursor.read_u16::<LittleEndian>()?
                    },
                });
            }
            b"data" => {
                data_chunk_info = Some((chunk_data_start_pos, chunk_size));
            }
            _ => {} // 'smpl', 'cue ', 'LIST' etc. carry nothing we play
        }
        if reader.seek(SeekFrom::Start(next_chunk_aligned_pos)).is_err() {
            break; // Reached end of file
        }
    }

    let format = format_chunk
        .ok_or_else(|| anyhow!("File has no 'fmt ' chunk: {:?}", full_path_for_logs))?;
    let (data_offset, data_size) = data_chunk_info
        .ok_or_else(|| anyhow!("File has no 'data' chunk: {:?}", full_path_for_logs))?;

    match (format.audio_format, format.bits_per_sample) {
        (1, 16) | (1, 24) | (1, 32) | (3, 32) => {}
        (f, b) => {
            return Err(anyhow!(
                "Unsupported WAV encoding {}/{}-bit: {:?}",
                f,
                b,
                full_path_for_logs
            ));
        }
    }
    if format.num_channels == 0 {
        return Err(anyhow!("WAV file declares zero channels: {:?}", full_path_for_logs));
    }

    Ok((format, data_offset, data_size))
}

/// An iterator that reads samples from a WAV file's data chunk
/// and converts them to f32.
pub struct WavSampleReader<R: Read + Seek> {
    reader: R,
    fmt: WavFmt,
    data_chunk_size: u32,
    bytes_read: u32,
}

impl<R: Read + Seek> WavSampleReader<R> {
    /// Creates a new reader and seeks to the start of the data chunk.
    pub fn new(mut reader: R, fmt: WavFmt, data_start: u64, data_size: u32) -> Result<Self> {
        reader.seek(SeekFrom::Start(data_start))?;
        Ok(Self {
            reader,
            fmt,
            data_chunk_size: data_size,
            bytes_read: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.fmt.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.fmt.num_channels
    }

    /// Total frames in the data chunk.
    pub fn frames(&self) -> usize {
        (self.data_chunk_size / self.fmt.bytes_per_frame().max(1)) as usize
    }

    /// Reads a single 24-bit signed sample.
    fn read_i24(&mut self) -> std::io::Result<i32> {
        let b1 = self.reader.read_u8()? as i32;
        let b2 = self.reader.read_u8()? as i32;
        let b3 = self.reader.read_u8()? as i32;
        // Combine, then sign-extend from 24th bit
        let sample = (b1 | (b2 << 8) | (b3 << 16)) << 8 >> 8;
        Ok(sample)
    }

    /// Reads up to `frames` frames as interleaved stereo into `out`.
    /// Mono is duplicated, channels past the second are skipped.
    pub fn read_stereo_frames(&mut self, out: &mut [f32], frames: usize) -> usize {
        let channels = self.fmt.num_channels as usize;
        let frames = frames.min(out.len() / 2);
        for i in 0..frames {
            let Some(left) = self.next() else {
                return i;
            };
            let right = if channels == 1 {
                left
            } else {
                match self.next() {
                    Some(r) => r,
                    None => return i,
                }
            };
            for _ in 2..channels {
                if self.next().is_none() {
                    break;
                }
            }
            out[i * 2] = left;
            out[i * 2 + 1] = right;
        }
        frames
    }
}

impl<R: Read + Seek> Iterator for WavSampleReader<R> {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes_read >= self.data_chunk_size {
            return None;
        }

        match self.fmt.bits_per_sample {
            16 => {
                let sample = self.reader.read_i16::<LittleEndian>().ok()?;
                self.bytes_read += 2;
                Some((sample as f32) / I16_MAX_F)
            }
            24 => {
                let sample = self.read_i24().ok()?;
                self.bytes_read += 3;
                Some((sample as f32) / I24_MAX_F)
            }
            32 => {
                if self.fmt.audio_format == 1 {
                    let sample = self.reader.read_i32::<LittleEndian>().ok()?;
                    self.bytes_read += 4;
                    Some((sample as f32) / I32_MAX_F)
                } else {
                    let sample = self.reader.read_f32::<LittleEndian>().ok()?;
                    self.bytes_read += 4;
                    Some(sample)
                }
            }
            _ => {
                log::warn!("Unsupported bits_per_sample: {}", self.fmt.bits_per_sample);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;
    use std::fs::File;
    use std::io::BufReader;

    #[test]
    fn test_reads_stereo_16_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.wav");
        write_wav(&path, 2, 48000, &[0.5, -0.5, 0.25, -0.25]);

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let (fmt, start, size) = parse_wav_metadata(&mut reader, &path).unwrap();
        assert_eq!(fmt.num_channels, 2);
        assert_eq!(fmt.sample_rate, 48000);

        let mut wav = WavSampleReader::new(reader, fmt, start, size).unwrap();
        assert_eq!(wav.frames(), 2);
        let mut out = [0.0f32; 8];
        assert_eq!(wav.read_stereo_frames(&mut out, 4), 2);
        assert!((out[0] - 0.5).abs() < 1e-3);
        assert!((out[3] + 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_mono_is_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wav");
        write_wav(&path, 1, 48000, &[0.5, 0.25]);

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let (fmt, start, size) = parse_wav_metadata(&mut reader, &path).unwrap();
        let mut wav = WavSampleReader::new(reader, fmt, start, size).unwrap();
        let mut out = [0.0f32; 4];
        assert_eq!(wav.read_stereo_frames(&mut out, 2), 2);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[2], out[3]);
    }

    #[test]
    fn test_rejects_wavpack() {
        let mut cursor = Cursor::new(b"wvpk\0\0\0\0".to_vec());
        let err = parse_wav_metadata(&mut cursor, Path::new("x.wv")).unwrap_err();
        assert!(err.downcast_ref::<IsWavPackError>().is_some());
    }
}
