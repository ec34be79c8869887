use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const APP_NAME: &str = "rusty-keys";

/// Settings that are saved to the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    pub instrument_file: Option<PathBuf>,
    pub ir_file: Option<PathBuf>,
    pub reverb_mix: f32,
    pub ir_max_frames: usize,
    pub sample_rate: u32,
    pub audio_buffer_frames: usize,
    pub max_voices_per_layer: usize,
    pub master_gain: f32,
    pub midi_device: Option<String>,
}

/// Default settings for a new installation.
impl Default for AppSettings {
    fn default() -> Self {
        Self {
            instrument_file: None,
            ir_file: None,
            reverb_mix: 0.5,
            ir_max_frames: 4096,
            sample_rate: 48000,
            audio_buffer_frames: 256,
            max_voices_per_layer: 64,
            master_gain: 0.5,
            midi_device: None,
        }
    }
}

/// Everything the engine needs at construction. Not saved to disk.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub period_frames: usize,
    pub max_voices_per_layer: usize,
    pub ir_file: Option<PathBuf>,
    pub ir_max_frames: usize,
    pub reverb_mix: f32,
    pub master_gain: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for EngineConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            period_frames: settings.audio_buffer_frames.max(1),
            max_voices_per_layer: settings.max_voices_per_layer.max(1),
            ir_file: settings.ir_file.clone(),
            ir_max_frames: settings.ir_max_frames,
            reverb_mix: settings.reverb_mix.clamp(0.0, 1.0),
            master_gain: settings.master_gain.max(0.0),
        }
    }
}

/// Loads settings from disk.
pub fn load_settings() -> Result<AppSettings> {
    let settings: AppSettings = confy::load(APP_NAME, "settings")?;
    Ok(settings)
}

/// Saves settings to disk.
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    confy::store(APP_NAME, "settings", settings)?;
    Ok(())
}
