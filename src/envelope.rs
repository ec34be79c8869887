use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::source::SampleSource;

/// Frames summarized by one envelope value.
pub const ENVELOPE_BLOCK_FRAMES: usize = 256;

const MAGIC: &[u8; 4] = b"RKEV";
const VERSION: u32 = 1;

/// Mean square energy of a stereo frame run, averaged over both channels.
pub fn mean_square(interleaved: &[f32]) -> f32 {
    if interleaved.is_empty() {
        return 0.0;
    }
    let sum: f32 = interleaved.iter().map(|s| s * s).sum();
    sum / interleaved.len() as f32
}

/// Coarse square-energy envelope of a sample, one value per block.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyEnvelope {
    block_frames: usize,
    blocks: Vec<f32>,
}

impl EnergyEnvelope {
    pub fn from_blocks(blocks: Vec<f32>) -> Self {
        Self {
            block_frames: ENVELOPE_BLOCK_FRAMES,
            blocks,
        }
    }

    pub fn blocks(&self) -> &[f32] {
        &self.blocks
    }

    /// Energy around `frame`. Past the end this is the last block's energy.
    pub fn energy_at(&self, frame: usize) -> f32 {
        let index = frame / self.block_frames;
        self.blocks
            .get(index)
            .or_else(|| self.blocks.last())
            .copied()
            .unwrap_or(0.0)
    }

    /// Decodes the whole source and measures it.
    pub fn build(source: &mut dyn SampleSource) -> Result<Self, EngineError> {
        let mut block = vec![0.0f32; ENVELOPE_BLOCK_FRAMES * 2];
        let mut blocks = Vec::new();
        loop {
            let mut filled = 0;
            while filled < ENVELOPE_BLOCK_FRAMES {
                let n = source.read_frames(&mut block[filled * 2..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            blocks.push(mean_square(&block[..filled * 2]));
            if filled < ENVELOPE_BLOCK_FRAMES {
                break;
            }
        }
        Ok(Self::from_blocks(blocks))
    }

    pub fn side_file_path(sample: &Path) -> PathBuf {
        let mut name = sample.as_os_str().to_owned();
        name.push(".env");
        PathBuf::from(name)
    }

    /// Reads a side-file, returning `None` if it is absent, stale or malformed.
    pub fn read_side_file(sample: &Path, expected_blocks: Option<usize>) -> Option<Self> {
        let path = Self::side_file_path(sample);
        let side_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let sample_modified = std::fs::metadata(sample).and_then(|m| m.modified()).ok()?;
        if sample_modified > side_modified {
            log::debug!("[Envelope] {:?} is older than its sample", path);
            return None;
        }

        let mut reader = BufReader::new(File::open(&path).ok()?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).ok()?;
        if &magic != MAGIC {
            return None;
        }
        let version = reader.read_u32::<LittleEndian>().ok()?;
        let block_frames = reader.read_u32::<LittleEndian>().ok()? as usize;
        let count = reader.read_u32::<LittleEndian>().ok()? as usize;
        if version != VERSION || block_frames != ENVELOPE_BLOCK_FRAMES {
            return None;
        }
        if expected_blocks.is_some_and(|expected| expected != count) {
            log::debug!("[Envelope] {:?} has {} blocks, expected {:?}", path, count, expected_blocks);
            return None;
        }

        let mut blocks = vec![0.0f32; count];
        reader.read_f32_into::<LittleEndian>(&mut blocks).ok()?;
        Some(Self::from_blocks(blocks))
    }

    pub fn write_side_file(&self, sample: &Path) -> std::io::Result<()> {
        let path = Self::side_file_path(sample);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        writer.write_u32::<LittleEndian>(self.block_frames as u32)?;
        writer.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        for energy in &self.blocks {
            writer.write_f32::<LittleEndian>(*energy)?;
        }
        writer.flush()
    }

    /// Uses the cached side-file when valid, otherwise measures `source` and
    /// rewrites the cache. A failed write only costs a rebuild next time.
    pub fn load_or_build(
        sample: &Path,
        source: &mut dyn SampleSource,
    ) -> Result<Self, EngineError> {
        let expected = source.frames().map(|f| f.div_ceil(ENVELOPE_BLOCK_FRAMES));
        if let Some(envelope) = Self::read_side_file(sample, expected) {
            log::debug!("[Envelope] Reusing cached envelope for {:?}", sample);
            return Ok(envelope);
        }

        let envelope = Self::build(source)?;
        if let Err(e) = envelope.write_side_file(sample) {
            log::warn!("[Envelope] Could not write side-file for {:?}: {}", sample, e);
        }
        Ok(envelope)
    }
}
