use decibel::{AmplitudeRatio, DecibelRatio};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::envelope::EnergyEnvelope;
use crate::error::EngineError;
use crate::source::open_source;

/// Upper bound for any gain the engine applies, as a linear factor.
pub const MAX_LEVEL: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Attack,
    Release,
}

/// A key/velocity zone mapped to one sample.
#[derive(Debug)]
pub struct Region {
    pub trigger: Trigger,
    pub lo_key: u8,
    pub hi_key: u8,
    pub lo_vel: u8,
    pub hi_vel: u8,
    pub center_key: u8,
    pub sample_path: PathBuf,
    pub envelope: Arc<EnergyEnvelope>,
    /// Seconds to decay by 60 dB after note-off.
    pub release_time: f32,
    /// Velocity tracking, 0.0 to 1.0.
    pub amp_veltrack: f32,
    pub volume_db: f32,
}

impl Region {
    pub fn matches(&self, key: u8, velocity: u8, trigger: Trigger) -> bool {
        self.trigger == trigger
            && (self.lo_key..=self.hi_key).contains(&key)
            && (self.lo_vel..=self.hi_vel).contains(&velocity)
    }

    /// Static volume trim as a linear factor.
    pub fn trim(&self) -> f32 {
        let amplitude_ratio: AmplitudeRatio<f64> = DecibelRatio(self.volume_db as f64).into();
        amplitude_ratio.amplitude_value() as f32
    }

    /// Initial gain for a note struck at `velocity`, clamped to the level ceiling.
    pub fn velocity_gain(&self, velocity: u8) -> f32 {
        let v = velocity.min(127) as f32 / 127.0;
        let t = self.amp_veltrack;
        ((1.0 - t + t * v * v) * self.trim()).clamp(0.0, MAX_LEVEL)
    }
}

/// Every region of one instrument, in file order. Immutable once loaded.
#[derive(Debug)]
pub struct Library {
    pub name: String,
    pub sample_rate: u32,
    regions: Vec<Arc<Region>>,
}

/// Region fields as written in the file, before the samples are inspected.
struct RegionDef {
    section: String,
    trigger: Trigger,
    lo_key: u8,
    hi_key: u8,
    lo_vel: u8,
    hi_vel: u8,
    center_key: u8,
    sample_path: PathBuf,
    release_time: f32,
    amp_veltrack: f32,
    volume_db: f32,
}

struct SampleInfo {
    channels: u16,
    frames: Option<usize>,
    envelope: Arc<EnergyEnvelope>,
}

type Section = HashMap<String, Option<String>>;

fn get_prop(props: &Section, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|opt| opt.as_deref())
        .map(|s| s.trim().replace("__HASH__", "#").replace("__SEMI__", ";"))
        .filter(|s| !s.is_empty())
}

/// '#' and ';' start comments for the ini parser, but are legal in sample
/// names. Whole-line comments are left alone.
fn escape_inline_comment_chars(text: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') || trimmed.starts_with(';') {
                line.to_string()
            } else {
                line.replace('#', "__HASH__").replace(';', "__SEMI__")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl Library {
    /// Parses an instrument description and measures every sample it names.
    pub fn load(path: &Path, sample_rate: u32) -> Result<Self, EngineError> {
        log::info!("[Library] Loading instrument from {:?}", path);
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(path, format!("cannot read file: {}", e)))?;
        let base_path = path.parent().unwrap_or(Path::new("."));

        let safe_content = escape_inline_comment_chars(&text);
        let conf = ini::macro_safe_read(&safe_content)
            .map_err(|e| EngineError::config(path, format!("malformed instrument file: {}", e)))?;

        let empty = Section::new();
        let instrument = conf.get("instrument").unwrap_or(&empty);
        let name = get_prop(instrument, "name").unwrap_or_else(|| {
            path.file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });
        let defaults = (
            parse_or(path, "instrument", instrument, "release", 0.5f32)?,
            parse_or(path, "instrument", instrument, "amp_veltrack", 100.0f32)?,
            parse_or(path, "instrument", instrument, "volume", 0.0f32)?,
        );

        let mut sections: Vec<(u32, &String, &Section)> = Vec::new();
        for (section_name, props) in conf.iter() {
            let lower = section_name.to_lowercase();
            let Some(suffix) = lower.strip_prefix("region") else {
                continue;
            };
            let order = suffix.trim().parse::<u32>().map_err(|_| {
                EngineError::config(path, format!("section [{}] needs a numeric suffix", section_name))
            })?;
            sections.push((order, section_name, props));
        }
        sections.sort_by_key(|(order, _, _)| *order);

        let defs = sections
            .into_iter()
            .map(|(_, section, props)| parse_region(path, base_path, section, props, defaults))
            .collect::<Result<Vec<_>, _>>()?;
        if defs.is_empty() {
            return Err(EngineError::config(path, "no [regionN] sections found"));
        }

        let samples = Self::inspect_samples(path, &defs, sample_rate)?;

        let regions = defs
            .into_iter()
            .map(|def| {
                let info = &samples[&def.sample_path];
                log::debug!(
                    "[Library] [{}] keys {}-{} vel {}-{} center {} {:?}, {} ch, {} frames",
                    def.section,
                    def.lo_key,
                    def.hi_key,
                    def.lo_vel,
                    def.hi_vel,
                    def.center_key,
                    def.trigger,
                    info.channels,
                    info.frames.map_or_else(|| "?".to_string(), |f| f.to_string())
                );
                Arc::new(Region {
                    trigger: def.trigger,
                    lo_key: def.lo_key,
                    hi_key: def.hi_key,
                    lo_vel: def.lo_vel,
                    hi_vel: def.hi_vel,
                    center_key: def.center_key,
                    sample_path: def.sample_path,
                    envelope: Arc::clone(&info.envelope),
                    release_time: def.release_time,
                    amp_veltrack: def.amp_veltrack,
                    volume_db: def.volume_db,
                })
            })
            .collect::<Vec<_>>();

        log::info!(
            "[Library] Loaded '{}': {} regions, {} samples",
            name,
            regions.len(),
            samples.len()
        );
        Ok(Self {
            name,
            sample_rate,
            regions,
        })
    }

    /// Opens each unique sample once, checks its rate and loads its envelope.
    fn inspect_samples(
        path: &Path,
        defs: &[RegionDef],
        sample_rate: u32,
    ) -> Result<HashMap<PathBuf, SampleInfo>, EngineError> {
        let mut unique: Vec<&PathBuf> = defs.iter().map(|d| &d.sample_path).collect();
        unique.sort();
        unique.dedup();

        let total = unique.len();
        let measured = AtomicUsize::new(0);
        log::info!("[Library] Measuring {} unique samples...", total);

        unique
            .par_iter()
            .map(|sample| {
                let mut source = open_source(sample)
                    .map_err(|e| EngineError::config(path, e.to_string()))?;
                if source.sample_rate() != sample_rate {
                    return Err(EngineError::config(
                        path,
                        format!(
                            "{:?} is {} Hz but the engine runs at {} Hz",
                            sample,
                            source.sample_rate(),
                            sample_rate
                        ),
                    ));
                }
                let envelope = EnergyEnvelope::load_or_build(sample, source.as_mut())
                    .map_err(|e| EngineError::config(path, e.to_string()))?;

                let count = measured.fetch_add(1, Ordering::Relaxed) + 1;
                log::trace!("[Library] ({}/{}) {:?}", count, total, sample);

                Ok((
                    (*sample).clone(),
                    SampleInfo {
                        channels: source.channels(),
                        frames: source.frames(),
                        envelope: Arc::new(envelope),
                    },
                ))
            })
            .collect()
    }

    pub fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    /// First region in file order covering the request.
    pub fn find_region(&self, key: u8, velocity: u8, trigger: Trigger) -> Option<&Arc<Region>> {
        self.regions
            .iter()
            .find(|r| r.matches(key, velocity, trigger))
    }
}

fn parse_or<T: std::str::FromStr>(
    path: &Path,
    section: &str,
    props: &Section,
    key: &str,
    default: T,
) -> Result<T, EngineError> {
    match get_prop(props, key) {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            EngineError::config(path, format!("[{}] {} = '{}' is not a number", section, key, raw))
        }),
        None => Ok(default),
    }
}

fn parse_key(path: &Path, section: &str, props: &Section, key: &str) -> Result<Option<u8>, EngineError> {
    if get_prop(props, key).is_none() {
        return Ok(None);
    }
    let value = parse_or::<i64>(path, section, props, key, 0)?;
    if !(0..=127).contains(&value) {
        return Err(EngineError::config(
            path,
            format!("[{}] {} = {} is outside 0..=127", section, key, value),
        ));
    }
    Ok(Some(value as u8))
}

fn parse_region(
    path: &Path,
    base_path: &Path,
    section: &str,
    props: &Section,
    (release, veltrack, volume): (f32, f32, f32),
) -> Result<RegionDef, EngineError> {
    let trigger = match get_prop(props, "trigger").as_deref().map(str::to_lowercase).as_deref() {
        None | Some("attack") => Trigger::Attack,
        Some("release") => Trigger::Release,
        Some(other) => {
            return Err(EngineError::config(
                path,
                format!("[{}] unknown trigger '{}'", section, other),
            ));
        }
    };

    let key = parse_key(path, section, props, "key")?;
    let lo_key = parse_key(path, section, props, "lokey")?.or(key);
    let hi_key = parse_key(path, section, props, "hikey")?.or(key);
    let (Some(lo_key), Some(hi_key)) = (lo_key, hi_key) else {
        return Err(EngineError::config(
            path,
            format!("[{}] needs either key or lokey/hikey", section),
        ));
    };
    let center_key = parse_key(path, section, props, "pitch_keycenter")?
        .or(key)
        .unwrap_or(lo_key);
    let lo_vel = parse_key(path, section, props, "lovel")?.unwrap_or(1);
    let hi_vel = parse_key(path, section, props, "hivel")?.unwrap_or(127);
    if lo_key > hi_key || lo_vel > hi_vel {
        return Err(EngineError::config(
            path,
            format!("[{}] has an inverted key or velocity range", section),
        ));
    }

    let sample = get_prop(props, "sample")
        .ok_or_else(|| EngineError::config(path, format!("[{}] has no sample", section)))?;
    let sample_path = base_path.join(sample.replace('\\', "/"));
    if !sample_path.is_file() {
        return Err(EngineError::config(
            path,
            format!("[{}] sample {:?} not found", section, sample_path),
        ));
    }

    let release_time = parse_or(path, section, props, "release", release)?;
    let amp_veltrack = parse_or(path, section, props, "amp_veltrack", veltrack)?;
    let volume_db = parse_or(path, section, props, "volume", volume)?;

    Ok(RegionDef {
        section: section.to_string(),
        trigger,
        lo_key,
        hi_key,
        lo_vel,
        hi_vel,
        center_key,
        sample_path,
        release_time: release_time.max(0.0),
        amp_veltrack: (amp_veltrack / 100.0).clamp(0.0, 1.0),
        volume_db,
    })
}
