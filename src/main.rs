use anyhow::Result;
use clap::{Parser, ValueEnum};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::File;
use std::io::stdin;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

mod audio;
mod audio_convolver;
mod audio_event;
mod audio_loader;
mod audio_recorder;
mod config;
mod engine;
mod envelope;
mod error;
mod layer;
mod library;
mod midi;
mod mixer;
mod resampler;
mod source;
mod voice;
mod wav;

#[cfg(test)]
mod testutil;

use audio_recorder::AudioRecorder;
use config::{AppSettings, EngineConfig};
use engine::Engine;
use library::Library;

const RELEASE_TAIL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Options left unset fall back to the saved settings.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the instrument definition (e.g., piano/instrument.ini)
    #[arg(value_name = "INSTRUMENT")]
    instrument_file: Option<PathBuf>,

    /// Optional path to a MIDI file to play
    #[arg(value_name = "MIDI_FILE")]
    midi_file: Option<PathBuf>,

    /// Set the application log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Optional path to a convolution reverb Impulse Response (IR) file
    #[arg(long, value_name = "IR_FILE")]
    ir_file: Option<PathBuf>,

    /// Reverb mix level (0.0 = dry, 1.0 = fully wet)
    #[arg(long, value_name = "REVERB_MIX")]
    reverb_mix: Option<f32>,

    /// Longest impulse response to use, in frames (0 = unlimited)
    #[arg(long, value_name = "NUM_FRAMES")]
    ir_max_frames: Option<usize>,

    /// Output sample rate. Every sample must already be at this rate.
    #[arg(long, value_name = "HZ")]
    sample_rate: Option<u32>,

    /// Mixer period in frames (lower values reduce latency but may cause glitches)
    #[arg(long, value_name = "NUM_FRAMES")]
    audio_buffer_frames: Option<usize>,

    /// Voice ceiling for each pitch layer
    #[arg(long, value_name = "COUNT")]
    max_voices: Option<usize>,

    /// Output gain applied after the reverb
    #[arg(long, value_name = "GAIN")]
    master_gain: Option<f32>,

    /// Select a MIDI device by name
    #[arg(long, value_name = "DEVICE_NAME")]
    midi_device: Option<String>,

    /// List all available MIDI input devices and exit
    #[arg(long)]
    list_midi_devices: bool,

    /// Record the output to a WAV file in this directory, or the default one
    #[arg(long, value_name = "DIR", num_args = 0..=1)]
    record: Option<Option<PathBuf>>,

    /// Save the effective settings as the new defaults
    #[arg(long)]
    save_config: bool,
}

impl Args {
    fn apply_to(&self, settings: &mut AppSettings) {
        if let Some(path) = &self.instrument_file {
            settings.instrument_file = Some(path.clone());
        }
        if let Some(path) = &self.ir_file {
            settings.ir_file = Some(path.clone());
        }
        if let Some(mix) = self.reverb_mix {
            settings.reverb_mix = mix;
        }
        if let Some(frames) = self.ir_max_frames {
            settings.ir_max_frames = frames;
        }
        if let Some(rate) = self.sample_rate {
            settings.sample_rate = rate;
        }
        if let Some(frames) = self.audio_buffer_frames {
            settings.audio_buffer_frames = frames;
        }
        if let Some(count) = self.max_voices {
            settings.max_voices_per_layer = count;
        }
        if let Some(gain) = self.master_gain {
            settings.master_gain = gain;
        }
        if let Some(name) = &self.midi_device {
            settings.midi_device = Some(name.clone());
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // --- Setup logging ---
    let log_level = match args.log_level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    };
    WriteLogger::init(log_level, Config::default(), File::create("rusty-keys.log")?)?;

    // This runs before any other setup and exits.
    if args.list_midi_devices {
        println!("Available MIDI Input Devices:");
        match midi::get_midi_device_names() {
            Ok(names) => {
                if names.is_empty() {
                    println!("  No MIDI devices found.");
                } else {
                    for (i, name) in names.iter().enumerate() {
                        println!("  {}: {}", i, name);
                    }
                }
            }
            Err(e) => {
                eprintln!("Error fetching MIDI devices: {}", e);
            }
        }
        return Ok(());
    }

    println!("\nRusty Keys - Sample Player v{}\n", env!("CARGO_PKG_VERSION"));

    let mut settings = config::load_settings().unwrap_or_else(|e| {
        log::warn!("Could not load settings, using defaults: {}", e);
        AppSettings::default()
    });
    args.apply_to(&mut settings);
    if args.save_config {
        config::save_settings(&settings)?;
        log::info!("Settings saved.");
    }

    let instrument_path = settings.instrument_file.clone().ok_or_else(|| {
        anyhow::anyhow!("The INSTRUMENT argument is required when none is saved in the settings.")
    })?;
    if !instrument_path.exists() {
        return Err(anyhow::anyhow!("File not found: {}", instrument_path.display()));
    }

    // --- Load the instrument ---
    println!("Loading instrument...");
    let library = Library::load(&instrument_path, settings.sample_rate)?;
    println!(
        "Successfully loaded instrument: {} ({} regions)",
        library.name,
        library.regions().len()
    );
    let instrument_name = library.name.clone();

    // --- Start the engine and audio ---
    let engine_config = EngineConfig::from(&settings);
    let (engine, mixer) = Engine::start(library, engine_config)?;

    let recorder = match &args.record {
        Some(dir) => {
            let dir = match dir {
                Some(dir) => dir.clone(),
                None => AudioRecorder::default_dir()?,
            };
            let recorder = AudioRecorder::start(&instrument_name, settings.sample_rate, &dir)?;
            println!("Recording to {}", recorder.path().display());
            Some(recorder)
        }
        None => None,
    };

    println!("Starting audio engine...");
    let stream = audio::start_audio_output(
        mixer,
        settings.sample_rate,
        recorder.as_ref().map(AudioRecorder::sink),
    )?;
    println!("Audio engine running.");

    // --- Start MIDI input ---
    let mut midi_connection = None;
    if let Some(path) = args.midi_file.clone() {
        if !path.exists() {
            return Err(anyhow::anyhow!("MIDI file not found: {}", path.display()));
        }
        println!("Playing MIDI file: {}", path.display());
        let player = midi::play_midi_file(path, engine.handle())?;
        if player.join().is_err() {
            log::error!("MIDI file thread panicked");
        }
        // Let release tails ring out.
        let deadline = Instant::now() + RELEASE_TAIL_TIMEOUT;
        while engine.active_voices() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
    } else {
        midi_connection = Some(midi::setup_midi_input(
            engine.handle(),
            settings.midi_device.as_deref(),
        )?);
        println!("Listening for MIDI input. Press Enter to quit.");
        let mut line = String::new();
        stdin().read_line(&mut line)?;
    }

    // --- Shutdown ---
    println!("Shutting down...");
    log::info!("Shutting down...");
    drop(midi_connection);
    engine.all_notes_off();
    drop(stream);
    engine.shutdown();
    if let Some(recorder) = recorder {
        recorder.stop();
    }
    Ok(())
}
