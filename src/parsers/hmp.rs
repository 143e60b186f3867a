//! HMP/HMP2 parser: fixed 712/840-byte header (after a handful of leading fields) plus
//! N `(chunk_number, chunk_length, track_number, midi_data…)` chunks, merged by the
//! smallest-delta algorithm shared with the other multi-track formats.

use crate::error::{GusMidiError, Result};
use crate::mdi::{ControllerKind, EventKind, EventValue, Mdi};

use super::{flush_delay, new_mdi, push_event, read_vlq_reversed, setup_divisions, ParseOptions, TickClock};

const HMP_DIVISIONS: u16 = 60;

struct Chunk<'a> {
    data: &'a [u8],
    pos: usize,
    delta: u32,
    ended: bool,
}

pub fn parse(data: &[u8], opts: &ParseOptions) -> Result<Mdi> {
    if data.len() < 8 || &data[0..8] != b"HMIMIDIP" {
        return Err(GusMidiError::NotHmp);
    }
    let mut pos = 8;
    let is_hmp2 = data.len() >= pos + 6 && &data[pos..pos + 6] == b"013195";
    if is_hmp2 {
        pos += 6;
    }

    let zero_cnt = if is_hmp2 { 18 } else { 24 };
    if data.len() < pos + zero_cnt || data[pos..pos + zero_cnt].iter().any(|&b| b != 0) {
        return Err(GusMidiError::NotHmp);
    }
    pos += zero_cnt;

    if data.len() < pos + 28 {
        return Err(GusMidiError::NotHmp);
    }
    let _file_length = u32_le(data, pos);
    pos += 4;
    pos += 12; // normally zero, undeciphered
    let chunk_count = u32_le(data, pos);
    pos += 4;
    let _unknown = u32_le(data, pos);
    pos += 4;
    let bpm = u32_le(data, pos);
    pos += 4;
    let _song_time = u32_le(data, pos);
    pos += 4;

    if bpm == 0 {
        return Err(GusMidiError::NotHmp);
    }

    let skip = if is_hmp2 { 840 } else { 712 };
    if data.len() < pos + skip {
        return Err(GusMidiError::NotHmp);
    }
    pos += skip;

    let round_tempo = opts.mixer_options.contains(crate::config::MixerOptions::ROUNDTEMPO);
    let raw_tempo = 60_000_000.0 / bpm as f32;
    let tempo_usec = if round_tempo { (raw_tempo + 0.5) as u32 } else { raw_tempo as u32 };

    let mut mdi = new_mdi(opts);
    let mut clock = TickClock::new(opts.sample_rate, round_tempo);
    clock.divisions = HMP_DIVISIONS;
    clock.tempo_usec = tempo_usec;
    setup_divisions(&mut mdi, HMP_DIVISIONS);

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for _ in 0..chunk_count {
        if data.len() < pos + 12 {
            return Err(GusMidiError::Corrupt("truncated HMP chunk header".into()));
        }
        let _chunk_num = u32_le(data, pos);
        let chunk_length = u32_le(data, pos + 4) as usize;
        let _track_number = u32_le(data, pos + 8);
        let body_start = pos + 12;
        if data.len() < body_start + chunk_length {
            return Err(GusMidiError::Corrupt("HMP chunk length exceeds file size".into()));
        }
        let body = &data[body_start..body_start + chunk_length];
        let (delta, used) = read_vlq_reversed(body)?;
        chunks.push(Chunk { data: body, pos: used, delta, ended: false });
        pos = body_start + chunk_length;
    }

    merge_chunks(&mut mdi, &mut clock, &mut chunks)?;

    mdi.current_sample = 0;
    mdi.cursor = 0;
    mdi.samples_to_mix = 0;
    Ok(mdi)
}

fn u32_le(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap())
}

fn merge_chunks(mdi: &mut Mdi, clock: &mut TickClock, chunks: &mut [Chunk]) -> Result<()> {
    loop {
        let smallest = chunks.iter().filter(|c| !c.ended).map(|c| c.delta).min();
        let Some(delta) = smallest else { break };
        let samples = clock.samples_for_ticks(delta);
        flush_delay(mdi, samples);

        for chunk in chunks.iter_mut() {
            if chunk.ended {
                continue;
            }
            if chunk.delta != 0 {
                chunk.delta -= delta;
                if chunk.delta != 0 {
                    continue;
                }
            }
            loop {
                if dispatch_hmp_event(mdi, clock, chunk)? {
                    break;
                }
                let (next_delta, used) = read_vlq_reversed(&chunk.data[chunk.pos..])?;
                chunk.pos += used;
                chunk.delta = next_delta;
                if chunk.delta != 0 {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Parses and dispatches one event for `chunk`. Returns `true` if EndOfTrack ended it.
fn dispatch_hmp_event(mdi: &mut Mdi, clock: &mut TickClock, chunk: &mut Chunk) -> Result<bool> {
    let status = *chunk
        .data
        .get(chunk.pos)
        .ok_or(GusMidiError::Corrupt("truncated HMP chunk".into()))?;

    // Loop markers: controller 110/111 with a value above 0x7f are elided entirely.
    if status & 0xf0 == 0xb0 {
        let cc = chunk.data.get(chunk.pos + 1).copied().unwrap_or(0);
        let val = chunk.data.get(chunk.pos + 2).copied().unwrap_or(0);
        if (cc == 110 || cc == 111) && val > 0x7f {
            chunk.pos += 3;
            return Ok(false);
        }
    }

    let channel = status & 0x0F;
    match status & 0xF0 {
        0x80 => {
            let note = byte_at(chunk, 1)?;
            let _vel = byte_at(chunk, 2)?;
            push_event(mdi, EventKind::NoteOff, channel, EventValue::Int(note as u32));
            chunk.pos += 3;
        }
        0x90 => {
            let note = byte_at(chunk, 1)?;
            let vel = byte_at(chunk, 2)?;
            let kind = if vel == 0 { EventKind::NoteOff } else { EventKind::NoteOn };
            push_event(mdi, kind, channel, EventValue::Int(u32::from(note) | (u32::from(vel) << 8)));
            chunk.pos += 3;
        }
        0xA0 => {
            let note = byte_at(chunk, 1)?;
            let value = byte_at(chunk, 2)?;
            push_event(mdi, EventKind::Aftertouch, channel, EventValue::Int(u32::from(note) | (u32::from(value) << 8)));
            chunk.pos += 3;
        }
        0xB0 => {
            let cc = byte_at(chunk, 1)?;
            let value = byte_at(chunk, 2)?;
            push_event(mdi, EventKind::ControlChange(ControllerKind::from_controller_number(cc)), channel, EventValue::Int(value as u32));
            chunk.pos += 3;
        }
        0xC0 => {
            let program = byte_at(chunk, 1)?;
            push_event(mdi, EventKind::ProgramChange, channel, EventValue::Int(program as u32));
            chunk.pos += 2;
        }
        0xD0 => {
            let pressure = byte_at(chunk, 1)?;
            push_event(mdi, EventKind::ChannelPressure, channel, EventValue::Int(pressure as u32));
            chunk.pos += 2;
        }
        0xE0 => {
            let lsb = byte_at(chunk, 1)?;
            let msb = byte_at(chunk, 2)?;
            let value = (u32::from(lsb) | (u32::from(msb) << 7)) as i32 - 8192;
            push_event(mdi, EventKind::PitchBend, channel, EventValue::Int(value as u32));
            chunk.pos += 3;
        }
        0xF0 => match status {
            0xFF => {
                let meta_type = byte_at(chunk, 1)?;
                let len = byte_at(chunk, 2)? as usize;
                let body_start = chunk.pos + 3;
                if chunk.data.len() < body_start + len {
                    return Err(GusMidiError::Corrupt("truncated HMP meta event".into()));
                }
                let body = &chunk.data[body_start..body_start + len];
                if meta_type == 0x2F {
                    push_event(mdi, EventKind::EndOfTrack, 0, EventValue::Int(0));
                    chunk.pos = body_start + len;
                    chunk.ended = true;
                    return Ok(true);
                } else if meta_type == 0x51 && len == 3 {
                    let usec = ((body[0] as u32) << 16) | ((body[1] as u32) << 8) | body[2] as u32;
                    clock.tempo_usec = if usec == 0 { 500_000 } else { usec };
                    push_event(mdi, EventKind::SetTempo, 0, EventValue::Int(clock.tempo_usec));
                } else if meta_type == 0x05 {
                    if let Ok(text) = std::str::from_utf8(body) {
                        mdi.last_lyric = Some(text.to_string());
                    }
                    push_event(mdi, EventKind::Lyric, 0, EventValue::Text(String::from_utf8_lossy(body).into_owned()));
                } else if meta_type == 0x03 {
                    push_event(mdi, EventKind::TrackName, 0, EventValue::Text(String::from_utf8_lossy(body).into_owned()));
                }
                chunk.pos = body_start + len;
            }
            _ => {
                // Sysex or unrecognised; not expected in HMP streams but skip gracefully.
                chunk.pos += 1;
            }
        },
        _ => return Err(GusMidiError::Corrupt(format!("unexpected HMP status byte {status:#x}"))),
    }
    Ok(false)
}

fn byte_at(chunk: &Chunk, offset: usize) -> Result<u8> {
    chunk
        .data
        .get(chunk.pos + offset)
        .copied()
        .ok_or(GusMidiError::Corrupt("truncated HMP event".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_hmp(bpm: u32, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"HMIMIDIP");
        out.extend_from_slice(&[0u8; 24]); // zero padding
        out.extend_from_slice(&0u32.to_le_bytes()); // file length
        out.extend_from_slice(&[0u8; 12]); // undeciphered
        out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // unknown
        out.extend_from_slice(&bpm.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // song time
        out.extend_from_slice(&[0u8; 712]);
        for (i, body) in chunks.iter().enumerate() {
            out.extend_from_slice(&(i as u32).to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn parses_minimal_single_chunk() {
        // delta 0 (terminal byte>=0x80), NoteOn, delta 4, NoteOff, delta 0, EOT.
        let body: &[u8] = &[0x80, 0x90, 60, 100, 0x84, 0x80, 60, 0, 0x80, 0xFF, 0x2F, 0x00];
        let data = build_hmp(120, &[body]);
        let opts = ParseOptions::new(32072);
        let mdi = parse(&data, &opts).unwrap();
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOn));
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::EndOfTrack));
        assert_eq!(mdi.divisions, HMP_DIVISIONS);
    }

    #[test]
    fn rejects_non_hmp_input() {
        let opts = ParseOptions::new(44100);
        assert!(parse(b"NOTHMP!!", &opts).is_err());
    }
}
