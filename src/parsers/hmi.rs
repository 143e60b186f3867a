//! HMI parser: `HMI-MIDISONG061595` signature, a 370-byte preamble, a track-offset table,
//! and per-track `HMI-MIDITRACK` preambles whose header length (at relative offset
//! `0x57`) must be skipped before the delta/event stream begins.

use crate::error::{GusMidiError, Result};
use crate::mdi::{ControllerKind, EventKind, EventValue, Mdi};

use super::{flush_delay, new_mdi, push_event, read_vlq, setup_divisions, ParseOptions, TickClock};

const HMI_DIVISIONS: u16 = 60;
const PREAMBLE_LEN: usize = 370;
const TRACK_MAGIC: &[u8; 13] = b"HMI-MIDITRACK";

struct Track {
    offset: usize,
    delta: u32,
    running_event: u8,
    ended: bool,
    note_length: [u32; 128],
    note_channel: [u8; 128],
}

pub fn parse(data: &[u8], opts: &ParseOptions) -> Result<Mdi> {
    if data.len() < 18 || &data[0..18] != b"HMI-MIDISONG061595" {
        return Err(GusMidiError::NotHmi);
    }
    if data.len() < 229 {
        return Err(GusMidiError::NotHmi);
    }
    let bpm = data[212] as u32;
    if bpm == 0 {
        return Err(GusMidiError::NotHmi);
    }
    let track_count = data[228] as usize;

    let round_tempo = opts.mixer_options.contains(crate::config::MixerOptions::ROUNDTEMPO);
    let raw_tempo = 60_000_000.0 / bpm as f32;
    let tempo_usec = if round_tempo { (raw_tempo + 0.5) as u32 } else { raw_tempo as u32 };

    let mut mdi = new_mdi(opts);
    let mut clock = TickClock::new(opts.sample_rate, round_tempo);
    clock.divisions = HMI_DIVISIONS;
    clock.tempo_usec = tempo_usec;
    setup_divisions(&mut mdi, HMI_DIVISIONS);

    if data.len() < PREAMBLE_LEN + track_count * 17 {
        return Err(GusMidiError::Corrupt("HMI file too short for track table".into()));
    }

    let mut tracks = Vec::with_capacity(track_count);
    let mut table_pos = PREAMBLE_LEN;
    for _ in 0..track_count {
        let mut offset = u32::from_le_bytes(data[table_pos..table_pos + 4].try_into().unwrap()) as usize;
        table_pos += 4;

        if data.len() < offset + 0x5a + 4 {
            return Err(GusMidiError::Corrupt("HMI track offset out of range".into()));
        }
        if &data[offset..offset + 13] != TRACK_MAGIC {
            return Err(GusMidiError::NotHmi);
        }

        let header_len = u32::from_le_bytes(data[offset + 0x57..offset + 0x5b].try_into().unwrap()) as usize;
        offset += header_len;

        let (delta, used) = read_vlq(&data[offset..])?;
        offset += used;

        tracks.push(Track {
            offset,
            delta,
            running_event: 0,
            ended: false,
            note_length: [0; 128],
            note_channel: [0; 128],
        });
    }

    merge_tracks(&mut mdi, &mut clock, data, &mut tracks)?;

    mdi.current_sample = 0;
    mdi.cursor = 0;
    mdi.samples_to_mix = 0;
    Ok(mdi)
}

fn merge_tracks(mdi: &mut Mdi, clock: &mut TickClock, data: &[u8], tracks: &mut [Track]) -> Result<()> {
    let mut subtract_delta = tracks.iter().map(|t| t.delta).min().unwrap_or(0);
    let samples = clock.samples_for_ticks(subtract_delta);
    flush_delay(mdi, samples);

    loop {
        if tracks.iter().all(|t| t.ended) {
            break;
        }
        let mut smallest_delta = 0u32;

        for i in 0..tracks.len() {
            if tracks[i].ended {
                continue;
            }

            for note in 0..128usize {
                if tracks[i].note_length[note] == 0 {
                    continue;
                }
                tracks[i].note_length[note] = tracks[i].note_length[note].saturating_sub(subtract_delta);
                if tracks[i].note_length[note] != 0 {
                    if smallest_delta == 0 || smallest_delta > tracks[i].note_length[note] {
                        smallest_delta = tracks[i].note_length[note];
                    }
                } else {
                    let channel = tracks[i].note_channel[note];
                    push_event(mdi, EventKind::NoteOff, channel, EventValue::Int(note as u32));
                }
            }

            if tracks[i].delta != 0 {
                tracks[i].delta -= subtract_delta;
                if tracks[i].delta != 0 {
                    if smallest_delta == 0 || smallest_delta > tracks[i].delta {
                        smallest_delta = tracks[i].delta;
                    }
                    continue;
                }
            }

            loop {
                if process_track_event(mdi, data, &mut tracks[i])? {
                    break; // track ended
                }
                if tracks[i].delta != 0 {
                    break;
                }
            }

            if !tracks[i].ended && (smallest_delta == 0 || smallest_delta > tracks[i].delta) {
                smallest_delta = tracks[i].delta;
            }
        }

        subtract_delta = smallest_delta;
        let samples = clock.samples_for_ticks(smallest_delta);
        flush_delay(mdi, samples);
    }
    Ok(())
}

/// Processes one event (or one skipped `0xFE` HMI-only opcode) at `track`'s current
/// offset, reading the next delta afterwards. Returns `true` if EndOfTrack was seen.
fn process_track_event(mdi: &mut Mdi, data: &[u8], track: &mut Track) -> Result<bool> {
    let pos = track.offset;
    let opcode = *data.get(pos).ok_or(GusMidiError::Corrupt("truncated HMI track".into()))?;

    if opcode == 0xFE {
        let sub = *data.get(pos + 1).ok_or(GusMidiError::Corrupt("truncated HMI opcode".into()))?;
        let mut advance = if sub == 0x10 {
            *data.get(pos + 4).ok_or(GusMidiError::Corrupt("truncated HMI opcode".into()))? as usize + 5
        } else if sub == 0x15 {
            4
        } else {
            0
        };
        advance += 4;
        track.offset += advance;
    } else {
        let (consumed, note_on) = dispatch_hmi_event(mdi, data, track)?;
        if opcode == 0xff && data.get(pos + 1) == Some(&0x2f) && data.get(pos + 2) == Some(&0x00) {
            track.ended = true;
            for note in 0..128usize {
                if track.note_length[note] != 0 {
                    push_event(mdi, EventKind::NoteOff, track.note_channel[note], EventValue::Int(note as u32));
                    track.note_length[note] = 0;
                }
            }
            track.offset += consumed;
            return Ok(true);
        }

        if opcode == 0xF0 || opcode == 0xF7 {
            track.running_event = 0;
        } else if opcode < 0xF0 && opcode >= 0x80 {
            track.running_event = opcode;
        }

        track.offset += consumed;

        if let Some((channel, note)) = note_on {
            let idx = note as usize;
            track.note_channel[idx] = channel;

            let (duration, used) = read_vlq(&data[track.offset..])?;
            track.offset += used;
            track.note_length[idx] = duration;
            if duration == 0 {
                push_event(mdi, EventKind::NoteOff, channel, EventValue::Int(idx as u32));
            }
        }
    }

    let (delta, used) = read_vlq(&data[track.offset..])?;
    track.offset += used;
    track.delta = delta;
    Ok(false)
}

/// Dispatches one MIDI/meta event using `track`'s running status. Returns the number of
/// bytes the event's own encoding occupied (status byte, if present, plus data) and,
/// for a NoteOn, the `(channel, note)` pair the caller needs to read the trailing
/// duration — reading it here, before `track.offset` advances, avoids re-deriving the
/// note number from the wrong buffer position afterwards.
fn dispatch_hmi_event(mdi: &mut Mdi, data: &[u8], track: &mut Track) -> Result<(usize, Option<(u8, u8)>)> {
    let pos = track.offset;
    let first = *data.get(pos).ok_or(GusMidiError::Corrupt("truncated HMI event".into()))?;
    let (status, status_len) = if first >= 0x80 { (first, 1) } else { (track.running_event, 0) };
    let channel = status & 0x0F;
    let args = &data[pos + status_len..];

    let mut note_on = None;
    let (kind, value, data_len) = match status & 0xF0 {
        0x80 => (EventKind::NoteOff, EventValue::Int(u32::from(args[0]) | (u32::from(args[1]) << 8)), 2),
        0x90 => {
            let kind = if args[1] == 0 { EventKind::NoteOff } else { EventKind::NoteOn };
            if kind == EventKind::NoteOn {
                note_on = Some((channel, args[0]));
            }
            (kind, EventValue::Int(u32::from(args[0]) | (u32::from(args[1]) << 8)), 2)
        }
        0xA0 => (EventKind::Aftertouch, EventValue::Int(u32::from(args[0]) | (u32::from(args[1]) << 8)), 2),
        0xB0 => (
            EventKind::ControlChange(ControllerKind::from_controller_number(args[0])),
            EventValue::Int(args[1] as u32),
            2,
        ),
        0xC0 => (EventKind::ProgramChange, EventValue::Int(args[0] as u32), 1),
        0xD0 => (EventKind::ChannelPressure, EventValue::Int(args[0] as u32), 1),
        0xE0 => {
            let value = (u32::from(args[0]) | (u32::from(args[1]) << 7)) as i32 - 8192;
            (EventKind::PitchBend, EventValue::Int(value as u32), 2)
        }
        0xF0 => {
            if status == 0xFF {
                let meta_type = args[0];
                let (len, used) = read_vlq(&args[1..])?;
                let body_start = 1 + used;
                let body = &args[body_start..body_start + len as usize];
                let total = status_len + body_start + len as usize;
                match meta_type {
                    0x2F => push_event(mdi, EventKind::EndOfTrack, 0, EventValue::Int(0)),
                    0x51 => {
                        let usec = ((body[0] as u32) << 16) | ((body[1] as u32) << 8) | body[2] as u32;
                        push_event(mdi, EventKind::SetTempo, 0, EventValue::Int(usec));
                    }
                    0x01 => push_event(mdi, EventKind::Text, 0, EventValue::Text(String::from_utf8_lossy(body).into_owned())),
                    0x03 => push_event(mdi, EventKind::TrackName, 0, EventValue::Text(String::from_utf8_lossy(body).into_owned())),
                    0x05 => push_event(mdi, EventKind::Lyric, 0, EventValue::Text(String::from_utf8_lossy(body).into_owned())),
                    _ => {}
                }
                return Ok((total, None));
            } else {
                // Sysex: length-prefixed, consumed but not specially interpreted.
                let (len, used) = read_vlq(args)?;
                return Ok((status_len + used + len as usize, None));
            }
        }
        _ => return Err(GusMidiError::Corrupt(format!("unexpected HMI status byte {status:#x}"))),
    };
    push_event(mdi, kind, channel, value);
    Ok((status_len + data_len, note_on))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_hmi(bpm: u8, track_body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; PREAMBLE_LEN + 4];
        out[0..18].copy_from_slice(b"HMI-MIDISONG061595");
        out[212] = bpm;
        out[228] = 1; // track count

        let track_offset = out.len();
        out[PREAMBLE_LEN..PREAMBLE_LEN + 4].copy_from_slice(&(track_offset as u32).to_le_bytes());

        let mut track = Vec::new();
        track.extend_from_slice(TRACK_MAGIC);
        // pad to header-length field at 0x57, then the header-length value itself (4 bytes at 0x57..0x5b)
        track.resize(0x57, 0);
        let header_len = 0x5bu32; // header ends exactly at the length field's end
        track.extend_from_slice(&header_len.to_le_bytes());
        track.extend_from_slice(track_body);

        out.extend_from_slice(&track);
        out
    }

    #[test]
    fn parses_minimal_track_with_note_duration() {
        // delta 0, NoteOn ch0 key60 vel100, duration 4; EndOfTrack.
        let body: &[u8] = &[0x00, 0x90, 60, 100, 0x04, 0x00, 0xFF, 0x2F, 0x00];
        let data = build_hmi(120, body);
        let opts = ParseOptions::new(32072);
        let mdi = parse(&data, &opts).unwrap();
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOn));
        assert_eq!(mdi.divisions, HMI_DIVISIONS);
    }

    #[test]
    fn rejects_non_hmi_input() {
        let opts = ParseOptions::new(44100);
        assert!(parse(b"NOTHMI!!", &opts).is_err());
    }
}
