use anyhow::{anyhow, Result};
use midir::{Ignore, MidiInput, MidiInputConnection};
use midly::{MetaMessage, MidiMessage as MidlyMidiMessage, Smf, Timing, TrackEventKind};
use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::EngineHandle;

/// Default tempo: 120 BPM = 500,000 microseconds per quarter note.
const DEFAULT_MICROS_PER_QUARTER: f64 = 500_000.0;

/// CC #123.
const ALL_NOTES_OFF_CONTROLLER: u8 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEvent {
    NoteOn { key: u8, velocity: u8 },
    NoteOff { key: u8 },
    AllNotesOff,
}

/// Converts a MIDI note number to its name (e.g., 60 -> "C4").
fn midi_note_to_name(note: u8) -> String {
    const NOTES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i32 - 1; // MIDI note 0 is C-1
    let note_name = NOTES[(note % 12) as usize];
    format!("{}{}", note_name, octave)
}

/// Decodes a raw channel message. Anything the engine does not play is `None`.
pub fn parse_midi_message(message: &[u8]) -> Option<NoteEvent> {
    if message.len() < 3 {
        return None;
    }
    let key = message[1] & 0x7F;
    let value = message[2] & 0x7F;
    match message[0] & 0xF0 {
        0x90 if value > 0 => Some(NoteEvent::NoteOn { key, velocity: value }),
        // Note On with velocity 0 is a Note Off
        0x90 | 0x80 => Some(NoteEvent::NoteOff { key }),
        0xB0 if key == ALL_NOTES_OFF_CONTROLLER => Some(NoteEvent::AllNotesOff),
        _ => None,
    }
}

pub fn dispatch(handle: &EngineHandle, event: NoteEvent) {
    match event {
        NoteEvent::NoteOn { key, velocity } => {
            log::debug!("[MIDI] Note On: {} (Vel {})", midi_note_to_name(key), velocity);
            handle.note_event(key, velocity);
        }
        NoteEvent::NoteOff { key } => {
            log::debug!("[MIDI] Note Off: {}", midi_note_to_name(key));
            handle.note_event(key, 0);
        }
        NoteEvent::AllNotesOff => {
            log::debug!("[MIDI] All Off");
            handle.all_notes_off();
        }
    }
}

pub fn get_midi_device_names() -> Result<Vec<String>> {
    let midi_in = MidiInput::new("rusty-keys-ports")?;
    let mut names = Vec::new();
    for port in midi_in.ports() {
        names.push(midi_in.port_name(&port)?);
    }
    Ok(names)
}

/// Connects to the named input port, or the first one when no name is given.
pub fn setup_midi_input(handle: EngineHandle, device_name: Option<&str>) -> Result<MidiInputConnection<()>> {
    let mut midi_in = MidiInput::new("rusty-keys-input")?;
    midi_in.ignore(Ignore::ActiveSense);

    let in_ports = midi_in.ports();
    let in_port = match device_name {
        Some(name) => in_ports
            .iter()
            .find(|p| midi_in.port_name(p).map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("MIDI input port '{}' not found", name))?,
        None => in_ports
            .first()
            .ok_or_else(|| anyhow!("No MIDI input ports found!"))?,
    };

    let port_name = midi_in.port_name(in_port)?;
    log::info!("[MIDI] Opening MIDI connection to {}", port_name);

    let connection = midi_in
        .connect(
            in_port,
            &port_name,
            move |_timestamp, message, _| {
                if let Some(event) = parse_midi_message(message) {
                    dispatch(&handle, event);
                }
            },
            (),
        )
        .map_err(|e| anyhow!("Failed to connect to MIDI input: {}", e))?;

    Ok(connection)
}

/// A note event at an absolute offset from the start of playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedEvent {
    pub at: Duration,
    pub event: NoteEvent,
}

/// Flattens every track of a metrical file into one time-ordered list.
///
/// Tempo changes on any track apply from their tick onwards.
pub fn build_timeline(smf: &Smf) -> Result<Vec<TimedEvent>> {
    let tpqn = match smf.header.timing {
        Timing::Metrical(t) => t.as_int() as f64,
        _ => return Err(anyhow!("Unsupported MIDI timing format (must be Metrical/TPQN)")),
    };

    // (absolute tick, track order, kind)
    let mut merged = Vec::new();
    for track in &smf.tracks {
        let mut tick: u64 = 0;
        for event in track {
            tick += event.delta.as_int() as u64;
            merged.push((tick, event.kind));
        }
    }
    // Stable, so events on the same tick keep file order.
    merged.sort_by_key(|(tick, _)| *tick);

    let mut micros_per_quarter = DEFAULT_MICROS_PER_QUARTER;
    let mut last_tick = 0u64;
    let mut elapsed_micros = 0.0f64;
    let mut timeline = Vec::new();

    for (tick, kind) in merged {
        elapsed_micros += (tick - last_tick) as f64 * micros_per_quarter / tpqn;
        last_tick = tick;
        let at = Duration::from_micros(elapsed_micros as u64);

        match kind {
            TrackEventKind::Midi { message, .. } => {
                let event = match message {
                    MidlyMidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => NoteEvent::NoteOn {
                        key: key.as_int(),
                        velocity: vel.as_int(),
                    },
                    MidlyMidiMessage::NoteOn { key, .. } | MidlyMidiMessage::NoteOff { key, .. } => {
                        NoteEvent::NoteOff { key: key.as_int() }
                    }
                    MidlyMidiMessage::Controller { controller, .. }
                        if controller.as_int() == ALL_NOTES_OFF_CONTROLLER =>
                    {
                        NoteEvent::AllNotesOff
                    }
                    _ => continue,
                };
                timeline.push(TimedEvent { at, event });
            }
            TrackEventKind::Meta(MetaMessage::Tempo(micros)) => {
                micros_per_quarter = micros.as_int() as f64;
                log::debug!("[MIDI] Tempo {} μs/q at tick {}", micros.as_int(), tick);
            }
            _ => {}
        }
    }
    Ok(timeline)
}

/// Plays a MIDI file on its own thread. Parse errors are returned before it starts.
pub fn play_midi_file(path: PathBuf, handle: EngineHandle) -> Result<JoinHandle<()>> {
    let data = fs::read(&path).map_err(|e| anyhow!("Failed to read MIDI file {:?}: {}", path, e))?;
    let smf = Smf::parse(&data).map_err(|e| anyhow!("Failed to parse MIDI file {:?}: {}", path, e))?;
    let timeline = build_timeline(&smf)?;
    log::info!(
        "[MIDI] Starting playback of {} ({} events)",
        path.display(),
        timeline.len()
    );

    let thread = thread::Builder::new()
        .name("rusty-keys-midi-file".to_string())
        .spawn(move || {
            let start = Instant::now();
            for timed in timeline {
                let elapsed = start.elapsed();
                if timed.at > elapsed {
                    thread::sleep(timed.at - elapsed);
                }
                dispatch(&handle, timed.event);
            }
            handle.all_notes_off();
            log::info!("[MIDI] Playback finished.");
        })?;

    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u4, u7, u15, u24, u28};
    use midly::{Format, Header, TrackEvent};

    fn note(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message: MidlyMidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                },
            },
        }
    }

    fn tempo(delta: u32, micros: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros))),
        }
    }

    #[test]
    fn test_parse_midi_message() {
        assert_eq!(
            parse_midi_message(&[0x91, 60, 100]),
            Some(NoteEvent::NoteOn { key: 60, velocity: 100 })
        );
        assert_eq!(parse_midi_message(&[0x90, 60, 0]), Some(NoteEvent::NoteOff { key: 60 }));
        assert_eq!(parse_midi_message(&[0x8F, 61, 64]), Some(NoteEvent::NoteOff { key: 61 }));
        assert_eq!(parse_midi_message(&[0xB3, 123, 0]), Some(NoteEvent::AllNotesOff));
        assert_eq!(parse_midi_message(&[0xB0, 64, 127]), None);
        assert_eq!(parse_midi_message(&[0xE0, 0, 64]), None);
        assert_eq!(parse_midi_message(&[0x90, 60]), None);
    }

    #[test]
    fn test_note_names() {
        assert_eq!(midi_note_to_name(60), "C4");
        assert_eq!(midi_note_to_name(0), "C-1");
        assert_eq!(midi_note_to_name(69), "A4");
    }

    #[test]
    fn test_timeline_merges_tracks_and_follows_tempo() {
        let smf = Smf {
            header: Header::new(Format::Parallel, Timing::Metrical(u15::new(480))),
            tracks: vec![
                // 120 BPM for the first beat, then 60 BPM.
                vec![tempo(0, 500_000), tempo(480, 1_000_000)],
                vec![note(0, 60, 100), note(480, 60, 0), note(480, 62, 90)],
            ],
        };

        let timeline = build_timeline(&smf).unwrap();
        assert_eq!(
            timeline,
            vec![
                TimedEvent {
                    at: Duration::ZERO,
                    event: NoteEvent::NoteOn { key: 60, velocity: 100 },
                },
                TimedEvent {
                    at: Duration::from_millis(500),
                    event: NoteEvent::NoteOff { key: 60 },
                },
                TimedEvent {
                    at: Duration::from_millis(1500),
                    event: NoteEvent::NoteOn { key: 62, velocity: 90 },
                },
            ]
        );
    }

    #[test]
    fn test_timecode_files_are_rejected() {
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Timecode(midly::Fps::Fps25, 40)),
            tracks: vec![vec![note(0, 60, 100)]],
        };
        assert!(build_timeline(&smf).is_err());
    }
}
