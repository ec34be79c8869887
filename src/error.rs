use std::path::PathBuf;

use crate::layer::Layer;

/// Errors raised by the sampler engine.
///
/// Only `Config` is fatal. Everything else is raised on the event or audio
/// paths, where it is logged and playback carries on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error in {path:?}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Voice overflow: {layer:?} layer is at its polyphony ceiling of {ceiling}")]
    VoiceOverflow { layer: Layer, ceiling: usize },

    #[error("Decoder underrun on voice {voice_id}: {missing} frames short")]
    DecoderUnderrun { voice_id: u64, missing: usize },

    #[error("No region matches key {key} velocity {velocity}")]
    MissingSample { key: u8, velocity: u8 },

    #[error("Failed to decode {path:?}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        EngineError::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn decode(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        EngineError::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
