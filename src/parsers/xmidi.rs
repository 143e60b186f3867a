//! EA IFF-85 XMIDI container parser (`FORM`/`XDIRINFO`/`CAT XMID`/`FORM XMID` with `TIMB`,
//! optional `RBRN`, and one or more `EVNT` chunks).

use crate::error::{GusMidiError, Result};
use crate::mdi::{ControllerKind, EventKind, EventValue, Mdi};

use super::{flush_delay, new_mdi, push_event, read_vlq, setup_divisions, ParseOptions, TickClock};

const XMIDI_DIVISIONS: u16 = 60;
const XMIDI_TEMPO_USEC: u32 = 500_000;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn tag(&mut self, expected: &[u8]) -> Result<()> {
        let len = expected.len();
        if self.remaining() < len || &self.data[self.pos..self.pos + len] != expected {
            return Err(GusMidiError::NotXmi);
        }
        self.pos += len;
        Ok(())
    }

    fn peek_tag(&self) -> Option<&[u8]> {
        self.data.get(self.pos..self.pos + 4)
    }

    fn u32_be(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(GusMidiError::Corrupt("truncated XMIDI chunk".into()));
        }
        let v = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn u8(&mut self) -> Result<u8> {
        let v = *self.data.get(self.pos).ok_or(GusMidiError::Corrupt("truncated XMIDI data".into()))?;
        self.pos += 1;
        Ok(v)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(GusMidiError::Corrupt("XMIDI chunk shorter than declared".into()));
        }
        self.pos += n;
        Ok(())
    }

    fn byte_at(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }
}

pub fn parse(data: &[u8], opts: &ParseOptions) -> Result<Mdi> {
    let mut r = Reader::new(data);
    r.tag(b"FORM")?;
    let xdirinfo_len = r.u32_be()?;
    r.tag(b"XDIRINFO")?;
    r.skip(4)?; // unknown two 16-bit fields
    let form_count = r.u8()?;
    if form_count == 0 {
        return Err(GusMidiError::NotXmi);
    }
    // xdirinfo_len counted "XDIRINFO"(8) + the two unknown words(4) + the count byte(1) =
    // 13 bytes already consumed; anything beyond that is skipped before CAT.
    let consumed_after_form = 13u32;
    if xdirinfo_len >= consumed_after_form {
        r.skip((xdirinfo_len - consumed_after_form) as usize)?;
    }
    r.tag(b"CAT ")?;
    let _cat_len = r.u32_be()?;
    r.tag(b"XMID")?;

    let mut mdi = new_mdi(opts);
    let round_tempo = opts.mixer_options.contains(crate::config::MixerOptions::ROUNDTEMPO);
    let mut clock = TickClock::new(opts.sample_rate, round_tempo);
    clock.divisions = XMIDI_DIVISIONS;
    clock.tempo_usec = XMIDI_TEMPO_USEC;
    setup_divisions(&mut mdi, XMIDI_DIVISIONS);

    let mut notelen = [[0u32; 128]; 16];
    let mut evnt_count = 0usize;

    for _ in 0..form_count {
        r.tag(b"FORM")?;
        let subform_len = r.u32_be()?;
        let subform_start = r.pos;
        r.tag(b"XMID")?;

        while r.pos < subform_start + subform_len as usize {
            match r.peek_tag() {
                Some(b"TIMB") => {
                    r.skip(4)?;
                    let len = r.u32_be()? as usize;
                    r.skip(len)?;
                }
                Some(b"RBRN") => {
                    r.skip(4)?;
                    let len = r.u32_be()? as usize;
                    r.skip(len)?;
                }
                Some(b"EVNT") => {
                    r.skip(4)?;
                    let len = r.u32_be()? as usize;
                    let evnt_end = r.pos + len;
                    evnt_count += 1;
                    if evnt_count > 1 {
                        mdi.is_type2 = true;
                    }
                    parse_evnt(&mut mdi, &mut clock, &mut r, evnt_end, &mut notelen)?;
                }
                _ => return Err(GusMidiError::NotXmi),
            }
        }
    }

    mdi.current_sample = 0;
    mdi.cursor = 0;
    mdi.samples_to_mix = 0;
    Ok(mdi)
}

fn parse_evnt(
    mdi: &mut Mdi,
    clock: &mut TickClock,
    r: &mut Reader,
    evnt_end: usize,
    notelen: &mut [[u32; 128]; 16],
) -> Result<()> {
    let mut lowest_delta: u32 = 0;

    while r.pos < evnt_end {
        let next_byte = r.data[r.pos];
        if next_byte < 0x80 {
            let (mut delta, used) = read_vlq(&r.data[r.pos..])?;
            r.pos += used;

            loop {
                let step = if lowest_delta != 0 && lowest_delta <= delta { lowest_delta } else { delta };
                let samples = clock.samples_for_ticks(step);
                flush_delay(mdi, samples);

                lowest_delta = 0;
                for ch in 0..16usize {
                    for note in 0..128usize {
                        if notelen[ch][note] == 0 {
                            continue;
                        }
                        notelen[ch][note] -= step;
                        if notelen[ch][note] == 0 {
                            push_event(mdi, EventKind::NoteOff, ch as u8, EventValue::Int(note as u32));
                        } else if lowest_delta == 0 || lowest_delta > notelen[ch][note] {
                            lowest_delta = notelen[ch][note];
                        }
                    }
                }
                delta -= step;
                if delta == 0 {
                    break;
                }
            }
        } else {
            if r.byte_at(0) == Some(0xFF) && r.byte_at(1) == Some(0x51) && r.byte_at(2) == Some(0x03) {
                r.skip(6)?; // ignore embedded tempo: XMIDI tempo is fixed
                continue;
            }
            dispatch_event(mdi, r, notelen, &mut lowest_delta)?;
        }
    }
    Ok(())
}

fn dispatch_event(
    mdi: &mut Mdi,
    r: &mut Reader,
    notelen: &mut [[u32; 128]; 16],
    lowest_delta: &mut u32,
) -> Result<()> {
    let status = r.u8()?;
    let channel = status & 0x0F;
    let kind_byte = status & 0xF0;

    match kind_byte {
        0x80 => {
            let note = r.u8()?;
            let _vel = r.u8()?;
            push_event(mdi, EventKind::NoteOff, channel, EventValue::Int(note as u32));
        }
        0x90 => {
            let note = r.u8()?;
            let vel = r.u8()?;
            push_event(mdi, EventKind::NoteOn, channel, EventValue::Int(u32::from(note) | (u32::from(vel) << 8)));
            let (duration, used) = read_vlq(&r.data[r.pos..])?;
            r.pos += used;
            notelen[channel as usize][note as usize] = duration;
            if duration > 0 && (*lowest_delta == 0 || duration < *lowest_delta) {
                *lowest_delta = duration;
            }
        }
        0xA0 => {
            let note = r.u8()?;
            let value = r.u8()?;
            push_event(mdi, EventKind::Aftertouch, channel, EventValue::Int(u32::from(note) | (u32::from(value) << 8)));
        }
        0xB0 => {
            let controller = r.u8()?;
            let value = r.u8()?;
            push_event(mdi, EventKind::ControlChange(ControllerKind::from_controller_number(controller)), channel, EventValue::Int(value as u32));
        }
        0xC0 => {
            let program = r.u8()?;
            push_event(mdi, EventKind::ProgramChange, channel, EventValue::Int(program as u32));
        }
        0xD0 => {
            let pressure = r.u8()?;
            push_event(mdi, EventKind::ChannelPressure, channel, EventValue::Int(pressure as u32));
        }
        0xE0 => {
            let lsb = r.u8()?;
            let msb = r.u8()?;
            let value = (u32::from(lsb) | (u32::from(msb) << 7)) as i32 - 8192;
            push_event(mdi, EventKind::PitchBend, channel, EventValue::Int(value as u32));
        }
        0xF0 => {
            let (len, used) = read_vlq(&r.data[r.pos..])?;
            r.pos += used;
            r.skip(len as usize)?;
        }
        0xFF => {
            let meta_type = r.u8()?;
            let (len, used) = read_vlq(&r.data[r.pos..])?;
            r.pos += used;
            let body = &r.data[r.pos..r.pos + len as usize];
            r.skip(len as usize)?;
            let kind = match meta_type {
                0x01 => Some(EventKind::Text),
                0x02 => Some(EventKind::Copyright),
                0x03 => Some(EventKind::TrackName),
                0x05 => Some(EventKind::Lyric),
                0x06 => Some(EventKind::Marker),
                0x2F => Some(EventKind::EndOfTrack),
                _ => None,
            };
            if let Some(kind) = kind {
                let value = if matches!(kind, EventKind::EndOfTrack) {
                    EventValue::Int(0)
                } else {
                    EventValue::Text(String::from_utf8_lossy(body).into_owned())
                };
                push_event(mdi, kind, 0, value);
            }
        }
        _ => return Err(GusMidiError::Corrupt(format!("unexpected XMIDI status byte {status:#x}"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_xmi(evnt: &[u8]) -> Vec<u8> {
        let mut subform = Vec::new();
        subform.extend_from_slice(b"XMID");
        subform.extend_from_slice(b"EVNT");
        subform.extend_from_slice(&(evnt.len() as u32).to_be_bytes());
        subform.extend_from_slice(evnt);

        let mut form = Vec::new();
        form.extend_from_slice(b"FORM");
        form.extend_from_slice(&(subform.len() as u32).to_be_bytes());
        form.extend_from_slice(&subform);

        let mut cat = Vec::new();
        cat.extend_from_slice(b"CAT ");
        cat.extend_from_slice(&((4 + form.len()) as u32).to_be_bytes());
        cat.extend_from_slice(b"XMID");
        cat.extend_from_slice(&form);

        let mut out = Vec::new();
        out.extend_from_slice(b"FORM");
        out.extend_from_slice(&0u32.to_be_bytes()); // patched below
        out.extend_from_slice(b"XDIRINFO");
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.push(1); // form count
        out.extend_from_slice(&cat);
        let xdirinfo_len = (13u32).to_be_bytes();
        out[4..8].copy_from_slice(&xdirinfo_len);
        out
    }

    #[test]
    fn parses_minimal_single_note() {
        // delta 0, NoteOn ch0 key60 vel100, duration 4; EndOfTrack.
        let evnt: &[u8] = &[0x00, 0x90, 60, 100, 0x04, 0xFF, 0x2F, 0x00];
        let data = build_minimal_xmi(evnt);
        let opts = ParseOptions::new(32072);
        let mdi = parse(&data, &opts).unwrap();
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOn));
        assert!(mdi.events.iter().any(|e| e.kind == EventKind::NoteOff));
        assert_eq!(mdi.divisions, XMIDI_DIVISIONS);
    }

    #[test]
    fn rejects_non_form_input() {
        let opts = ParseOptions::new(44100);
        assert!(parse(b"NOTXMID!", &opts).is_err());
    }
}
