//! Event stream -> Standard MIDI File writer (§4.7).
//!
//! Walks a decoded [`Mdi`]'s event vector and re-emits it as Standard MIDI File bytes,
//! recomputing variable-length deltas from each event's `samples_to_next` using the
//! MDI's recorded divisions and the tempo in effect at that point in the stream.
//!
//! REDESIGN FLAG: the reference decoder's `_WM_Event2Midi` always emits a single
//! Type-0 track regardless of source format, and interleaves event bytes with the
//! *following* delta rather than the conventional leading delta-then-event pairing,
//! producing a track whose very first bytes are not a valid delta-time. Both quirks
//! are corrected here: a Type-2 MDI round-trips to a genuine multi-MTrk Type 2 file
//! unless `SAVEASTYPE0` is set, and every event is preceded by its own delta.

use crate::config::MixerOptions;
use crate::error::{GusMidiError, Result};
use crate::mdi::{Event, EventKind, EventValue, Mdi};

/// Converts a decoded score back into Standard MIDI File bytes (§4.7).
///
/// Emits a single merged Type-0 MTrk unless `mdi.is_type2` is set and `SAVEASTYPE0` is
/// absent from `options`, in which case each original track (delimited by `EndOfTrack`
/// in the event stream) becomes its own MTrk chunk in a Type-2 file.
pub fn event_to_midi(mdi: &Mdi, options: MixerOptions) -> Result<Vec<u8>> {
    if mdi.events.is_empty() {
        return Err(GusMidiError::ConvertFailed("no events to convert".into()));
    }

    let multi_track = mdi.is_type2 && !options.contains(MixerOptions::SAVEASTYPE0);
    let segments = split_segments(&mdi.events, multi_track);
    let format: u16 = if multi_track && segments.len() > 1 { 2 } else { 0 };

    let mut out = Vec::with_capacity(mdi.events.len() * 12 + 14);
    out.extend_from_slice(b"MThd");
    out.extend_from_slice(&6u32.to_be_bytes());
    out.extend_from_slice(&format.to_be_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_be_bytes());
    out.extend_from_slice(&mdi.divisions.to_be_bytes());

    let mut tempo_usec = 500_000u32;
    for segment in &segments {
        let body = encode_track(segment, mdi.divisions, mdi.sample_rate, &mut tempo_usec)?;
        out.extend_from_slice(b"MTrk");
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Splits the event vector into per-track segments at each `EndOfTrack`, dropping the
/// synthetic leading `SetDivisions` event (it only ever updates the MThd division
/// field, never the wire stream). With `multi_track` false the whole stream is one
/// segment.
fn split_segments(events: &[Event], multi_track: bool) -> Vec<Vec<Event>> {
    let body: Vec<Event> = events
        .iter()
        .filter(|e| e.kind != EventKind::SetDivisions)
        .cloned()
        .collect();

    if !multi_track {
        return vec![body];
    }

    let mut segments = Vec::new();
    let mut current = Vec::new();
    for event in body {
        let is_eot = event.kind == EventKind::EndOfTrack;
        current.push(event);
        if is_eot {
            segments.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    if segments.is_empty() {
        segments.push(Vec::new());
    }
    segments
}

/// Ticks elapsed in `samples` rendered frames at the given tempo/division/sample rate,
/// rounded to the nearest tick (§4.7: `ticks = round(samples_to_next / samples_per_tick)`).
fn samples_to_ticks(samples: u32, divisions: u16, sample_rate: u32, tempo_usec: u32) -> u32 {
    let samples_per_tick =
        (tempo_usec as f32 / divisions.max(1) as f32) * (sample_rate as f32 / 1_000_000.0);
    if samples_per_tick <= 0.0 {
        return 0;
    }
    (samples as f32 / samples_per_tick).round().max(0.0) as u32
}

/// Encodes one track's worth of events, maintaining running status and a carried
/// pending delta (the previous event's `samples_to_next`, converted to ticks) so every
/// event is preceded by a standards-compliant delta-time.
fn encode_track(events: &[Event], divisions: u16, sample_rate: u32, tempo_usec: &mut u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(events.len() * 4);
    let mut running_status: u8 = 0;
    let mut pending_ticks: u32 = 0;
    let mut saw_end = false;

    for event in events {
        write_vlq(&mut out, pending_ticks);
        write_event(&mut out, event, &mut running_status)?;

        let ticks = samples_to_ticks(event.samples_to_next, divisions, sample_rate, *tempo_usec);
        if event.kind == EventKind::SetTempo {
            *tempo_usec = event.data.as_int() & 0x00FF_FFFF;
        }
        pending_ticks = ticks;

        if event.kind == EventKind::EndOfTrack {
            saw_end = true;
        }
    }
    if !saw_end {
        out.push(0xFF);
        out.push(0x2F);
        out.push(0x00);
    }
    Ok(out)
}

/// Writes one event's wire bytes (status + data, honouring running status for MIDI
/// channel messages) to `out`.
fn write_event(out: &mut Vec<u8>, event: &Event, running_status: &mut u8) -> Result<()> {
    let ch = event.channel & 0x0F;
    match event.kind {
        EventKind::NoteOff => write_channel_2(out, running_status, 0x80 | ch, note(event), velocity(event)),
        EventKind::NoteOn => write_channel_2(out, running_status, 0x90 | ch, note(event), velocity(event)),
        EventKind::Aftertouch => write_channel_2(out, running_status, 0xA0 | ch, note(event), velocity(event)),
        EventKind::ControlChange(controller) => write_channel_2(
            out,
            running_status,
            0xB0 | ch,
            controller.controller_number(),
            event.data.as_int() as u8,
        ),
        EventKind::ProgramChange => write_channel_1(out, running_status, 0xC0 | ch, event.data.as_int() as u8),
        EventKind::ChannelPressure => write_channel_1(out, running_status, 0xD0 | ch, event.data.as_int() as u8),
        EventKind::PitchBend => {
            let signed = event.data.as_int() as i32;
            let raw14 = (signed + 8192).clamp(0, 0x3FFF) as u32;
            write_channel_2(out, running_status, 0xE0 | ch, (raw14 & 0x7F) as u8, ((raw14 >> 7) & 0x7F) as u8);
        }
        EventKind::RolandDrumTrack => {
            *running_status = 0;
            write_roland_drum_track(out, ch, event.data.as_int() as u8);
        }
        EventKind::RolandReset => {
            *running_status = 0;
            out.extend_from_slice(&[0xF0, 0x0A, 0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7]);
        }
        EventKind::GmReset => {
            *running_status = 0;
            out.extend_from_slice(&[0xF0, 0x05, 0x7E, 0x7F, 0x09, 0x01, 0xF7]);
        }
        EventKind::YamahaReset => {
            *running_status = 0;
            out.extend_from_slice(&[0xF0, 0x08, 0x43, 0x10, 0x4C, 0x00, 0x00, 0x7E, 0x00, 0xF7]);
        }
        EventKind::SetTempo => {
            let usec = event.data.as_int() & 0x00FF_FFFF;
            out.extend_from_slice(&[0xFF, 0x51, 0x03]);
            out.extend_from_slice(&usec.to_be_bytes()[1..]);
        }
        EventKind::TimeSignature => write_meta_be_bytes(out, 0x58, event.data.as_int(), 4),
        EventKind::KeySignature => write_meta_be_bytes(out, 0x59, event.data.as_int(), 2),
        EventKind::SequenceNumber => write_meta_be_bytes(out, 0x00, event.data.as_int(), 2),
        EventKind::ChannelPrefix => write_meta_be_bytes(out, 0x20, event.data.as_int(), 1),
        EventKind::PortPrefix => write_meta_be_bytes(out, 0x21, event.data.as_int(), 1),
        EventKind::SmpteOffset => {
            // The parser does not retain the fifth (fractional-frame) byte; it is
            // reconstructed here as zero.
            let v = event.data.as_int();
            out.extend_from_slice(&[0xFF, 0x54, 0x05]);
            out.extend_from_slice(&v.to_be_bytes());
        }
        EventKind::Text => write_meta_text(out, 0x01, event),
        EventKind::Copyright => write_meta_text(out, 0x02, event),
        EventKind::TrackName => write_meta_text(out, 0x03, event),
        EventKind::InstrumentName => write_meta_text(out, 0x04, event),
        EventKind::Lyric => write_meta_text(out, 0x05, event),
        EventKind::Marker => write_meta_text(out, 0x06, event),
        EventKind::CuePoint => write_meta_text(out, 0x07, event),
        EventKind::EndOfTrack => out.extend_from_slice(&[0xFF, 0x2F, 0x00]),
        EventKind::SetDivisions => {}
    }
    Ok(())
}

fn note(event: &Event) -> u8 {
    (event.data.as_int() & 0xFF) as u8
}

fn velocity(event: &Event) -> u8 {
    ((event.data.as_int() >> 8) & 0xFF) as u8
}

fn write_channel_1(out: &mut Vec<u8>, running_status: &mut u8, status: u8, data0: u8) {
    if *running_status != status {
        out.push(status);
        *running_status = status;
    }
    out.push(data0);
}

fn write_channel_2(out: &mut Vec<u8>, running_status: &mut u8, status: u8, data0: u8, data1: u8) {
    if *running_status != status {
        out.push(status);
        *running_status = status;
    }
    out.push(data0);
    out.push(data1);
}

/// Re-encodes the Roland GS "drum track" sysex, inverting the channel-nibble mapping
/// the parser (`dispatch_sysex` in `parsers::smf`) applies on read.
fn write_roland_drum_track(out: &mut Vec<u8>, channel: u8, value: u8) {
    let nibble = if channel == 9 {
        0
    } else if channel < 9 {
        channel + 1
    } else {
        channel
    };
    out.extend_from_slice(&[
        0xF0, 0x09, 0x41, 0x10, 0x42, 0x12, 0x40, 0x10 | nibble, 0x15, value, 0xF7,
    ]);
}

fn write_meta_be_bytes(out: &mut Vec<u8>, meta_type: u8, value: u32, len: u8) {
    out.push(0xFF);
    out.push(meta_type);
    out.push(len);
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[4 - len as usize..]);
}

fn write_meta_text(out: &mut Vec<u8>, meta_type: u8, event: &Event) {
    let text = match &event.data {
        EventValue::Text(t) => t.as_bytes(),
        EventValue::Int(_) => &[],
    };
    out.push(0xFF);
    out.push(meta_type);
    write_vlq(out, text.len() as u32);
    out.extend_from_slice(text);
}

/// Standard MIDI variable-length quantity: 7 bits per byte, continuation bit on every
/// byte but the last, most-significant group first.
fn write_vlq(out: &mut Vec<u8>, value: u32) {
    if value > 0x0FFF_FFFF {
        out.push((((value >> 28) & 0x7F) | 0x80) as u8);
    }
    if value > 0x1F_FFFF {
        out.push((((value >> 21) & 0x7F) | 0x80) as u8);
    }
    if value > 0x3FFF {
        out.push((((value >> 14) & 0x7F) | 0x80) as u8);
    }
    if value > 0x7F {
        out.push((((value >> 7) & 0x7F) | 0x80) as u8);
    }
    out.push((value & 0x7F) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdi::EventValue;
    use crate::parsers::{self, push_event, ParseOptions};

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
    fn round_trips_simple_type0_file() {
        let track: &[u8] = &[
            0x00, 0xC0, 0, 0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00,
        ];
        let data = build_smf(0, 96, &[track]);
        let opts = ParseOptions::new(32072);
        let mdi = parsers::parse_any(&data, &opts).unwrap();

        let out = event_to_midi(&mdi, MixerOptions::empty()).unwrap();
        assert_eq!(&out[0..4], b"MThd");
        assert_eq!(u16::from_be_bytes([out[8], out[9]]), 0);
        assert_eq!(u16::from_be_bytes([out[12], out[13]]), 96);

        let reparsed = parsers::parse_any(&out, &opts).unwrap();
        assert_eq!(reparsed.events.len(), mdi.events.len());
        for (a, b) in mdi.events.iter().zip(reparsed.events.iter()) {
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.channel, b.channel);
            assert_eq!(a.data, b.data);
            assert!((a.samples_to_next as i64 - b.samples_to_next as i64).abs() <= 1);
        }
    }

    #[test]
    fn refuses_empty_event_stream() {
        let mdi = Mdi::new(44100, crate::reverb::Reverb::new(44100, Default::default()));
        assert!(event_to_midi(&mdi, MixerOptions::empty()).is_err());
    }

    #[test]
    fn type2_without_saveastype0_emits_one_mtrk_per_track() {
        let t1: &[u8] = &[0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00];
        let t2: &[u8] = &[0x00, 0x90, 64, 100, 0x60, 0x80, 64, 0, 0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(2, 96, &[t1, t2]);
        let opts = ParseOptions::new(32072);
        let mdi = parsers::parse_any(&data, &opts).unwrap();
        assert!(mdi.is_type2);

        let out = event_to_midi(&mdi, MixerOptions::empty()).unwrap();
        assert_eq!(u16::from_be_bytes([out[8], out[9]]), 2);
        let mtrk_count = count_mtrk_chunks(&out);
        assert_eq!(mtrk_count, 2);
    }

    #[test]
    fn type2_with_saveastype0_merges_into_one_mtrk() {
        let t1: &[u8] = &[0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00];
        let t2: &[u8] = &[0x00, 0x90, 64, 100, 0x60, 0x80, 64, 0, 0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(2, 96, &[t1, t2]);
        let opts = ParseOptions::new(32072);
        let mdi = parsers::parse_any(&data, &opts).unwrap();

        let out = event_to_midi(&mdi, MixerOptions::SAVEASTYPE0).unwrap();
        assert_eq!(u16::from_be_bytes([out[8], out[9]]), 0);
        assert_eq!(count_mtrk_chunks(&out), 1);
    }

    #[test]
    fn roland_drum_track_channel_nibble_round_trips() {
        let mut mdi = Mdi::new(32072, crate::reverb::Reverb::new(32072, Default::default()));
        mdi.divisions = 96;
        push_event(&mut mdi, EventKind::SetDivisions, 0, EventValue::Int(96));
        push_event(&mut mdi, EventKind::RolandDrumTrack, 9, EventValue::Int(1));
        push_event(&mut mdi, EventKind::EndOfTrack, 0, EventValue::Int(0));

        let out = event_to_midi(&mdi, MixerOptions::empty()).unwrap();
        let opts = ParseOptions::new(32072);
        let reparsed = parsers::parse_any(&out, &opts).unwrap();
        assert!(reparsed
            .events
            .iter()
            .any(|e| e.kind == EventKind::RolandDrumTrack && e.channel == 9));
    }

    fn count_mtrk_chunks(data: &[u8]) -> usize {
        let mut pos = 14;
        let mut count = 0;
        while pos + 8 <= data.len() {
            if &data[pos..pos + 4] == b"MTrk" {
                count += 1;
            }
            let len = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
            pos += 8 + len;
        }
        count
    }
}
