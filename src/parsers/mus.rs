//! DMX MUS parser: a small binary format whose opcodes map onto a subset of MIDI.

use crate::error::{GusMidiError, Result};
use crate::mdi::{ControllerKind, EventKind, EventValue, Mdi};

use super::{flush_delay, new_mdi, push_event, read_vlq, setup_divisions, ParseOptions, TickClock};

const MUS_DIVISIONS: u16 = 60;
const DEFAULT_FREQUENCY: u16 = 140;

pub fn parse(data: &[u8], opts: &ParseOptions) -> Result<Mdi> {
    if data.len() < 17 || &data[0..4] != b"MUS\x1A" {
        return Err(GusMidiError::NotMus);
    }

    let song_len = u16::from_le_bytes(data[4..6].try_into().unwrap()) as usize;
    let song_ofs = u16::from_le_bytes(data[6..8].try_into().unwrap()) as usize;
    let instrument_count = u16::from_le_bytes(data[12..14].try_into().unwrap()) as usize;

    if data.len() < 16 + instrument_count * 2 + song_len {
        return Err(GusMidiError::Corrupt("MUS file shorter than header declares".into()));
    }

    let round_tempo = opts.mixer_options.contains(crate::config::MixerOptions::ROUNDTEMPO);
    let freq = opts.mus_frequency.unwrap_or(DEFAULT_FREQUENCY).max(1) as u32;
    let raw_tempo = 60_000_000.0 / freq as f32;
    let tempo_usec = if round_tempo { (raw_tempo + 0.5) as u32 } else { raw_tempo as u32 };

    let mut mdi = new_mdi(opts);
    let mut clock = TickClock::new(opts.sample_rate, round_tempo);
    clock.divisions = MUS_DIVISIONS;
    clock.tempo_usec = tempo_usec;
    setup_divisions(&mut mdi, MUS_DIVISIONS);

    let mut prev_vol = [0u8; 16];
    let mut pos = song_ofs;

    loop {
        if pos >= data.len() {
            break;
        }
        let raw_ch_byte = data[pos];
        let channel = swap_drum_channel(raw_ch_byte & 0x0f);
        let group = (raw_ch_byte >> 4) & 0x07;
        let has_delta = raw_ch_byte & 0x80 != 0;

        let event_size = match group {
            0 => {
                let note = *data.get(pos + 1).ok_or(GusMidiError::Corrupt("truncated MUS note-off".into()))?;
                push_event(&mut mdi, EventKind::NoteOff, channel, EventValue::Int(note as u32));
                2
            }
            1 => {
                let note_byte = *data.get(pos + 1).ok_or(GusMidiError::Corrupt("truncated MUS note-on".into()))?;
                if note_byte & 0x80 != 0 {
                    let vel = *data.get(pos + 2).ok_or(GusMidiError::Corrupt("truncated MUS note-on velocity".into()))?;
                    prev_vol[channel as usize] = vel;
                    push_event(&mut mdi, EventKind::NoteOn, channel, EventValue::Int(u32::from(note_byte & 0x7f) | (u32::from(vel) << 8)));
                    3
                } else {
                    let vel = prev_vol[channel as usize];
                    push_event(&mut mdi, EventKind::NoteOn, channel, EventValue::Int(u32::from(note_byte) | (u32::from(vel) << 8)));
                    2
                }
            }
            2 => {
                let raw = *data.get(pos + 1).ok_or(GusMidiError::Corrupt("truncated MUS pitch bend".into()))?;
                let shifted = (raw as u16) << 6;
                let value = (u32::from(shifted & 0x7f) | (u32::from((shifted >> 7) & 0x7f) << 7)) as i32 - 8192;
                push_event(&mut mdi, EventKind::PitchBend, channel, EventValue::Int(value as u32));
                2
            }
            3 => {
                let sub = *data.get(pos + 1).ok_or(GusMidiError::Corrupt("truncated MUS system event".into()))?;
                let controller = match sub {
                    10 => Some(120u8),  // All Sounds Off
                    11 => Some(123u8),  // All Notes Off
                    12 => Some(126u8),  // Mono, unsupported dummy
                    13 => Some(127u8),  // Poly, unsupported dummy
                    14 => Some(121u8),  // Reset All Controllers
                    _ => None,
                };
                if let Some(cc) = controller {
                    push_event(&mut mdi, EventKind::ControlChange(ControllerKind::from_controller_number(cc)), channel, EventValue::Int(0));
                }
                2
            }
            4 => {
                let sub = *data.get(pos + 1).ok_or(GusMidiError::Corrupt("truncated MUS controller event".into()))?;
                let value = *data.get(pos + 2).ok_or(GusMidiError::Corrupt("truncated MUS controller value".into()))?;
                match sub {
                    0 => push_event(&mut mdi, EventKind::ProgramChange, channel, EventValue::Int(value as u32)),
                    1 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::from_controller_number(0)), channel, EventValue::Int(value as u32)),
                    2 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::from_controller_number(1)), channel, EventValue::Int(value as u32)),
                    3 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::ChannelVolume), channel, EventValue::Int(value as u32)),
                    4 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::ChannelPan), channel, EventValue::Int(value as u32)),
                    5 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::ChannelExpression), channel, EventValue::Int(value as u32)),
                    6 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::from_controller_number(91)), channel, EventValue::Int(value as u32)),
                    7 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::from_controller_number(93)), channel, EventValue::Int(value as u32)),
                    8 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::ChannelHold), channel, EventValue::Int(value as u32)),
                    9 => push_event(&mut mdi, EventKind::ControlChange(ControllerKind::from_controller_number(67)), channel, EventValue::Int(value as u32)),
                    _ => {}
                }
                3
            }
            5 | 7 => 1,
            6 => break, // end of song
            _ => unreachable!("masked to 0..=7"),
        };

        pos += event_size;

        if has_delta {
            let (ticks, used) = read_vlq(&data[pos..])?;
            pos += used;
            let samples = clock.samples_for_ticks(ticks);
            flush_delay(&mut mdi, samples);
        }

        if pos >= song_ofs + song_len {
            break;
        }
    }

    push_event(&mut mdi, EventKind::EndOfTrack, 0, EventValue::Int(0));
    mdi.current_sample = 0;
    mdi.cursor = 0;
    mdi.samples_to_mix = 0;
    Ok(mdi)
}

/// Swaps MUS's percussion channel (15) with MIDI's conventional drum channel (9).
fn swap_drum_channel(ch: u8) -> u8 {
    match ch {
        0x0f => 0x09,
        0x09 => 0x0f,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_mus(events: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MUS\x1A");
        out.extend_from_slice(&(events.len() as u16).to_le_bytes()); // song length
        out.extend_from_slice(&16u16.to_le_bytes()); // song offset (right after header)
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // instrument count
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(events);
        out
    }

    #[test]
    fn parses_note_on_with_velocity_then_end() {
        // group1 NoteOn, channel0, note60|0x80 vel100, no delta follows (top bit clear); group6 end.
        let events: &[u8] = &[0x10, 60 | 0x80, 100, 0x60];
        let data = build_mus(events);
        let opts = ParseOptions::new(44100);
        let mdi = parse(&data, &opts).unwrap();
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOn));
        assert_eq!(mdi.divisions, MUS_DIVISIONS);
    }

    #[test]
    fn drum_channel_is_swapped() {
        assert_eq!(swap_drum_channel(0x0f), 0x09);
        assert_eq!(swap_drum_channel(0x09), 0x0f);
        assert_eq!(swap_drum_channel(0x03), 0x03);
    }

    #[test]
    fn rejects_non_mus_input() {
        let opts = ParseOptions::new(44100);
        assert!(parse(b"NOTMUS!!!!!!!!!!!", &opts).is_err());
    }
}
