//! Standard MIDI File (Type 0/1/2) and RIFF-wrapped-SMF parser.

use crate::error::{GusMidiError, Result};
use crate::mdi::{ControllerKind, EventKind, EventValue, Mdi};

use super::{
    flush_delay, new_mdi, push_event, read_vlq, setup_divisions, smallest_delta, ParseOptions,
    TickClock, TrackCursor,
};

const ROLAND_SYSEX_ID: [u8; 4] = [0x41, 0x10, 0x42, 0x12];
const GM_RESET: [u8; 5] = [0x7e, 0x7f, 0x09, 0x01, 0xf7];
const YAMAHA_RESET: [u8; 8] = [0x43, 0x10, 0x4c, 0x00, 0x00, 0x7e, 0x00, 0xf7];

pub fn parse(data: &[u8], opts: &ParseOptions) -> Result<Mdi> {
    if data.len() < 14 || &data[0..4] != b"MThd" {
        return Err(GusMidiError::NotMidi);
    }
    let header_len = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if header_len < 6 {
        return Err(GusMidiError::Corrupt("MThd header too short".into()));
    }
    let format = u16::from_be_bytes(data[8..10].try_into().unwrap());
    let ntrks = u16::from_be_bytes(data[10..12].try_into().unwrap());
    let division = u16::from_be_bytes(data[12..14].try_into().unwrap());
    if division & 0x8000 != 0 {
        return Err(GusMidiError::Corrupt("SMTPE division not supported".into()));
    }

    let mut pos = 8 + header_len as usize;
    let mut tracks: Vec<&[u8]> = Vec::with_capacity(ntrks as usize);
    while tracks.len() < ntrks as usize {
        if pos + 8 > data.len() {
            break;
        }
        if &data[pos..pos + 4] != b"MTrk" {
            return Err(GusMidiError::Corrupt("expected MTrk chunk".into()));
        }
        let len = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body_start = pos + 8;
        let body_end = (body_start + len).min(data.len());
        tracks.push(&data[body_start..body_end]);
        pos = body_start + len + (len & 1);
    }

    let mut mdi = new_mdi(opts);
    let round_tempo = opts.mixer_options.contains(crate::config::MixerOptions::ROUNDTEMPO);
    let mut clock = TickClock::new(opts.sample_rate, round_tempo);
    clock.divisions = division;
    setup_divisions(&mut mdi, division);

    if format == 2 {
        mdi.is_type2 = true;
        for track in &tracks {
            parse_track_sequential(&mut mdi, &mut clock, track)?;
        }
    } else {
        let mut cursors: Vec<TrackCursor> = tracks.iter().map(|t| TrackCursor::new(t)).collect();
        merge_tracks(&mut mdi, &mut clock, &mut cursors)?;
    }

    finalize(&mut mdi);
    Ok(mdi)
}

/// Type 0/1 merge: smallest-delta-first across all tracks simultaneously.
fn merge_tracks(mdi: &mut Mdi, clock: &mut TickClock, cursors: &mut [TrackCursor]) -> Result<()> {
    for cursor in cursors.iter_mut() {
        advance_delta(cursor)?;
    }
    loop {
        let Some(delta) = smallest_delta(cursors) else {
            break;
        };
        let samples = clock.samples_for_ticks(delta);
        flush_delay(mdi, samples);
        for cursor in cursors.iter_mut() {
            if cursor.ended {
                continue;
            }
            cursor.delta -= delta;
            while !cursor.ended && cursor.delta == 0 {
                if dispatch_event(mdi, clock, cursor)? {
                    break;
                }
                advance_delta(cursor)?;
            }
        }
    }
    Ok(())
}

/// Type 2: render each track to completion before starting the next.
fn parse_track_sequential(mdi: &mut Mdi, clock: &mut TickClock, track: &[u8]) -> Result<()> {
    let mut cursor = TrackCursor::new(track);
    advance_delta(&mut cursor)?;
    while !cursor.ended {
        let samples = clock.samples_for_ticks(cursor.delta);
        flush_delay(mdi, samples);
        if dispatch_event(mdi, clock, &mut cursor)? {
            break;
        }
        advance_delta(&mut cursor)?;
    }
    Ok(())
}

fn advance_delta(cursor: &mut TrackCursor) -> Result<()> {
    if cursor.pos >= cursor.data.len() {
        cursor.ended = true;
        cursor.delta = 0;
        return Ok(());
    }
    let (delta, used) = read_vlq(cursor.remaining())?;
    cursor.pos += used;
    cursor.delta = delta;
    Ok(())
}

/// Parses and dispatches one event at `cursor`'s current position. Returns `true` if the
/// track has now ended (EndOfTrack seen).
fn dispatch_event(mdi: &mut Mdi, clock: &mut TickClock, cursor: &mut TrackCursor) -> Result<bool> {
    let mut status = cursor.byte(0).ok_or(GusMidiError::Corrupt("truncated track".into()))?;
    if status < 0x80 {
        status = cursor.running_status;
    } else {
        cursor.pos += 1;
    }

    match status {
        0x80..=0xEF => {
            cursor.running_status = status;
            dispatch_channel_event(mdi, cursor, status)?;
        }
        0xF0 | 0xF7 => {
            cursor.running_status = 0;
            dispatch_sysex(mdi, cursor)?;
        }
        0xFF => {
            let ended = dispatch_meta(mdi, clock, cursor)?;
            return Ok(ended);
        }
        _ => return Err(GusMidiError::Corrupt(format!("unexpected status byte {status:#x}"))),
    }
    Ok(false)
}

fn dispatch_channel_event(mdi: &mut Mdi, cursor: &mut TrackCursor, status: u8) -> Result<()> {
    let channel = status & 0x0F;
    let kind_byte = status & 0xF0;
    let data = cursor.remaining();

    let (kind, value, consumed) = match kind_byte {
        0x80 => (
            EventKind::NoteOff,
            EventValue::Int(u32::from(data[0]) | (u32::from(data[1]) << 8)),
            2,
        ),
        0x90 => {
            let note = data[0];
            let velocity = data[1];
            let kind = if velocity == 0 { EventKind::NoteOff } else { EventKind::NoteOn };
            (kind, EventValue::Int(u32::from(note) | (u32::from(velocity) << 8)), 2)
        }
        0xA0 => (
            EventKind::Aftertouch,
            EventValue::Int(u32::from(data[0]) | (u32::from(data[1]) << 8)),
            2,
        ),
        0xB0 => {
            let controller = ControllerKind::from_controller_number(data[0]);
            (EventKind::ControlChange(controller), EventValue::Int(u32::from(data[1])), 2)
        }
        0xC0 => (EventKind::ProgramChange, EventValue::Int(u32::from(data[0])), 1),
        0xD0 => (EventKind::ChannelPressure, EventValue::Int(u32::from(data[0])), 1),
        0xE0 => {
            let value = (u32::from(data[0]) | (u32::from(data[1]) << 7)) as i32 - 8192;
            (EventKind::PitchBend, EventValue::Int(value as u32), 2)
        }
        _ => unreachable!("masked to channel status bytes"),
    };
    if cursor.pos + consumed > cursor.data.len() {
        return Err(GusMidiError::Corrupt("truncated channel event".into()));
    }
    cursor.pos += consumed;
    push_event(mdi, kind, channel, value);
    Ok(())
}

fn dispatch_sysex(mdi: &mut Mdi, cursor: &mut TrackCursor) -> Result<()> {
    let (len, used) = read_vlq(cursor.remaining())?;
    cursor.pos += used;
    let len = len as usize;
    if cursor.pos + len > cursor.data.len() {
        return Err(GusMidiError::Corrupt("truncated sysex event".into()));
    }
    let body = &cursor.data[cursor.pos..cursor.pos + len];
    cursor.pos += len;

    if body.last() == Some(&0xF7) && body.len() >= 5 {
        if body.len() >= 4 && body[0..4] == ROLAND_SYSEX_ID {
            if body.len() > 7 && body[4] == 0x40 {
                if (body[5] & 0xf0) == 0x10 && body[6] == 0x15 {
                    let mut ch = body[5] & 0x0f;
                    ch = if ch == 0x00 { 0x09 } else if ch <= 0x09 { ch - 1 } else { ch };
                    push_event(mdi, EventKind::RolandDrumTrack, ch, EventValue::Int(u32::from(body[7])));
                } else if body[5] == 0x00 && body[6] == 0x7F && body[7] == 0x00 {
                    push_event(mdi, EventKind::RolandReset, 0, EventValue::Int(0));
                }
            }
        } else if body.len() >= 5 && body[0..5] == GM_RESET {
            push_event(mdi, EventKind::GmReset, 0, EventValue::Int(0));
        } else if body.len() >= 8 && body[0..8] == YAMAHA_RESET {
            push_event(mdi, EventKind::YamahaReset, 0, EventValue::Int(0));
        }
    }
    Ok(())
}

/// Returns `true` when EndOfTrack was parsed.
fn dispatch_meta(mdi: &mut Mdi, clock: &mut TickClock, cursor: &mut TrackCursor) -> Result<bool> {
    let meta_type = cursor.byte(0).ok_or(GusMidiError::Corrupt("truncated meta event".into()))?;
    cursor.pos += 1;
    let (len, used) = read_vlq(cursor.remaining())?;
    cursor.pos += used;
    let len = len as usize;
    if cursor.pos + len > cursor.data.len() {
        return Err(GusMidiError::Corrupt("truncated meta event".into()));
    }
    let body = &cursor.data[cursor.pos..cursor.pos + len];
    cursor.pos += len;

    match meta_type {
        0x00 => push_event(mdi, EventKind::SequenceNumber, 0, int_from_be(body)),
        0x01 => push_event(mdi, EventKind::Text, 0, text_event(body)),
        0x02 => {
            if let Ok(text) = std::str::from_utf8(body) {
                mdi.copyright = Some(text.to_string());
            }
            push_event(mdi, EventKind::Copyright, 0, text_event(body));
        }
        0x03 => push_event(mdi, EventKind::TrackName, 0, text_event(body)),
        0x04 => push_event(mdi, EventKind::InstrumentName, 0, text_event(body)),
        0x05 => {
            if let Ok(text) = std::str::from_utf8(body) {
                mdi.last_lyric = Some(text.to_string());
            }
            push_event(mdi, EventKind::Lyric, 0, text_event(body));
        }
        0x06 => push_event(mdi, EventKind::Marker, 0, text_event(body)),
        0x07 => push_event(mdi, EventKind::CuePoint, 0, text_event(body)),
        0x20 => push_event(mdi, EventKind::ChannelPrefix, 0, int_from_be(body)),
        0x21 => push_event(mdi, EventKind::PortPrefix, 0, int_from_be(body)),
        0x2F => {
            push_event(mdi, EventKind::EndOfTrack, 0, EventValue::Int(0));
            cursor.ended = true;
            return Ok(true);
        }
        0x51 => {
            let usec = int_from_be(body).as_int();
            clock.tempo_usec = usec;
            push_event(mdi, EventKind::SetTempo, 0, EventValue::Int(usec));
        }
        0x54 => push_event(mdi, EventKind::SmpteOffset, 0, int_from_be(body)),
        0x58 => push_event(mdi, EventKind::TimeSignature, 0, int_from_be(body)),
        0x59 => push_event(mdi, EventKind::KeySignature, 0, int_from_be(body)),
        _ => {}
    }
    Ok(false)
}

fn int_from_be(body: &[u8]) -> EventValue {
    let mut acc: u32 = 0;
    for &b in body.iter().take(4) {
        acc = (acc << 8) | b as u32;
    }
    EventValue::Int(acc)
}

fn text_event(body: &[u8]) -> EventValue {
    EventValue::Text(String::from_utf8_lossy(body).into_owned())
}

/// Shared MDI finalisation: reset playback cursors so rendering can begin at frame zero.
fn finalize(mdi: &mut Mdi) {
    mdi.current_sample = 0;
    mdi.cursor = 0;
    mdi.samples_to_mix = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_smf(format: u16, division: u16, tracks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());
        for track in tracks {
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(track.len() as u32).to_be_bytes());
            out.extend_from_slice(track);
        }
        out
    }

    #[test]
    fn parses_minimal_type0_file() {
        // delta 0, NoteOn ch0 key60 vel100; delta 4, NoteOff; delta 0, EndOfTrack.
        let track: &[u8] = &[0x00, 0x90, 60, 100, 0x04, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(0, 96, &[track]);
        let opts = ParseOptions::new(32072);
        let mdi = parse(&data, &opts).unwrap();
        assert_eq!(mdi.divisions, 96);
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOn));
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOff));
        assert!(mdi.events.last().unwrap().kind == EventKind::EndOfTrack);
    }

    #[test]
    fn note_on_with_zero_velocity_becomes_note_off() {
        let track: &[u8] = &[0x00, 0x90, 60, 0, 0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(0, 96, &[track]);
        let opts = ParseOptions::new(44100);
        let mdi = parse(&data, &opts).unwrap();
        assert_eq!(mdi.events[1].kind, EventKind::NoteOff);
    }

    #[test]
    fn type2_marks_is_type2() {
        let t1: &[u8] = &[0x00, 0xFF, 0x2F, 0x00];
        let t2: &[u8] = &[0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(2, 96, &[t1, t2]);
        let opts = ParseOptions::new(44100);
        let mdi = parse(&data, &opts).unwrap();
        assert!(mdi.is_type2);
    }

    #[test]
    fn rejects_non_mthd_input() {
        let opts = ParseOptions::new(44100);
        assert!(parse(b"NOTMIDI!!!!", &opts).is_err());
    }
}
