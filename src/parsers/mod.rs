//! Score format detection and the shared merge/tick machinery every concrete parser
//! (SMF, XMIDI, HMP/HMP2, HMI, MUS) builds its `Mdi` with.

mod hmi;
mod hmp;
mod mus;
mod smf;
mod xmidi;

use crate::config::MixerOptions;
use crate::error::{GusMidiError, Result};
use crate::mdi::{Event, EventKind, EventValue, Mdi};
use crate::reverb::Reverb;

/// Parse-time knobs that live outside the byte stream itself: output sample rate, mixer
/// options (only `ROUNDTEMPO` affects parsing), and the MUS playback frequency default.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub sample_rate: u32,
    pub mixer_options: MixerOptions,
    /// Playback frequency used to derive MUS's synthetic tempo (`WM_CO_FREQUENCY`);
    /// defaults to 140 Hz when unset, matching the reference converter.
    pub mus_frequency: Option<u16>,
}

impl ParseOptions {
    pub fn new(sample_rate: u32) -> Self {
        ParseOptions {
            sample_rate,
            mixer_options: MixerOptions::default(),
            mus_frequency: None,
        }
    }
}

/// Detects the container format from its leading bytes and dispatches to the matching
/// parser, producing a canonical `Mdi`. Mirrors the reference loader's magic-byte
/// `detect_format`/`load` dispatch, generalised over the five supported score formats.
pub fn parse_any(data: &[u8], opts: &ParseOptions) -> Result<Mdi> {
    if data.len() < 4 {
        return Err(GusMidiError::NotMidi);
    }
    if &data[0..4] == b"RIFF" {
        if data.len() < 12 || &data[8..12] != b"RMID" {
            return Err(GusMidiError::NotMidi);
        }
        return smf::parse(find_chunk(data, b"data", 12).ok_or(GusMidiError::NotMidi)?, opts);
    }
    if &data[0..4] == b"MThd" {
        return smf::parse(data, opts);
    }
    if data.len() >= 4 && &data[0..4] == b"MUS\x1A" {
        return mus::parse(data, opts);
    }
    if data.len() >= 12 && &data[0..4] == b"FORM" && &data[8..12] == b"XDIR" {
        return xmidi::parse(data, opts);
    }
    if data.len() >= 8 && &data[0..4] == b"HMIM" && &data[0..8] == b"HMIMIDIP" {
        return hmp::parse(data, opts);
    }
    if data.len() >= 18 && &data[0..18] == b"HMI-MIDISONG061595" {
        return hmi::parse(data, opts);
    }
    Err(GusMidiError::NotMidi)
}

/// Scans a RIFF file for the first chunk with the given 4-byte id, returning its payload.
fn find_chunk<'a>(data: &'a [u8], id: &[u8; 4], mut pos: usize) -> Option<&'a [u8]> {
    while pos + 8 <= data.len() {
        let chunk_id = &data[pos..pos + 4];
        let len = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().ok()?) as usize;
        let body_start = pos + 8;
        if chunk_id == id {
            return data.get(body_start..body_start + len);
        }
        pos = body_start + len + (len & 1);
    }
    None
}

/// Converts a tick delta to a rendered-frame count, carrying a float remainder across
/// calls exactly as the reference decoder's `_WM_GetSamplesPerTick` accumulation does.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickClock {
    pub divisions: u16,
    pub tempo_usec: u32,
    pub sample_rate: u32,
    pub round_tempo: bool,
    remainder: f32,
}

impl TickClock {
    pub fn new(sample_rate: u32, round_tempo: bool) -> Self {
        TickClock {
            divisions: 96,
            tempo_usec: 500_000,
            sample_rate,
            round_tempo,
            remainder: 0.0,
        }
    }

    fn samples_per_tick(&self) -> f32 {
        let raw = (self.tempo_usec as f32 / self.divisions.max(1) as f32)
            * (self.sample_rate as f32 / 1_000_000.0);
        if self.round_tempo {
            raw.round()
        } else {
            raw
        }
    }

    /// Converts `ticks` to a sample count, folding the carried remainder in.
    pub fn samples_for_ticks(&mut self, ticks: u32) -> u32 {
        let total = ticks as f32 * self.samples_per_tick() + self.remainder;
        let count = total.floor();
        self.remainder = total - count;
        count as u32
    }
}

/// Reads a standard (SMF/XMIDI/HMI-style) variable-length quantity: continuation while
/// the top bit is set, MSB-first accumulation. Returns the value and bytes consumed.
pub(crate) fn read_vlq(data: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    let mut consumed = 0;
    loop {
        let byte = *data
            .get(consumed)
            .ok_or_else(|| GusMidiError::Corrupt("truncated variable-length quantity".into()))?;
        value = (value << 7) | (byte & 0x7F) as u32;
        consumed += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if consumed > 4 {
            return Err(GusMidiError::Corrupt("variable-length quantity too long".into()));
        }
    }
    Ok((value, consumed))
}

/// Reads an HMP-style variable-length quantity: continuation while the top bit is
/// *clear* (byte < 0x80), LSB-first shift accumulation — the reversed convention noted
/// against SMF/XMIDI's `read_vlq`.
pub(crate) fn read_vlq_reversed(data: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    let mut consumed = 0;
    loop {
        let byte = *data
            .get(consumed)
            .ok_or_else(|| GusMidiError::Corrupt("truncated variable-length quantity".into()))?;
        value |= ((byte & 0x7F) as u32) << shift;
        consumed += 1;
        if byte & 0x80 != 0 {
            break;
        }
        shift += 7;
        if consumed > 4 {
            return Err(GusMidiError::Corrupt("variable-length quantity too long".into()));
        }
    }
    Ok((value, consumed))
}

/// One track/chunk mid-merge: remaining byte slice, the delta (in ticks) until its next
/// event, running status byte, and whether it has reached its end marker.
pub(crate) struct TrackCursor<'a> {
    pub data: &'a [u8],
    pub pos: usize,
    pub delta: u32,
    pub running_status: u8,
    pub ended: bool,
}

impl<'a> TrackCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        TrackCursor {
            data,
            pos: 0,
            delta: 0,
            running_status: 0,
            ended: false,
        }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }
}

/// Finds the smallest non-zero delta across all non-ended tracks, or `None` if every
/// track has ended. Shared by the SMF/XMIDI/HMP/HMI mergers.
pub(crate) fn smallest_delta(cursors: &[TrackCursor]) -> Option<u32> {
    cursors
        .iter()
        .filter(|c| !c.ended)
        .map(|c| c.delta)
        .min()
}

/// Appends `event` to the MDI, first folding `samples` into the previous event's
/// `samples_to_next` (the reference decoder always accumulates onto the *last emitted*
/// event, never the one about to be pushed).
pub(crate) fn flush_delay(mdi: &mut Mdi, samples: u32) {
    if let Some(last) = mdi.events.last_mut() {
        last.samples_to_next += samples;
    }
    mdi.approx_total_samples += samples as u64;
}

pub(crate) fn push_event(mdi: &mut Mdi, kind: EventKind, channel: u8, value: EventValue) {
    mdi.events.push(Event::new(kind, channel, value));
}

/// Emits the synthetic `SetDivisions` event the writer relies on, and records `divisions`
/// on the MDI itself for the engine's tick math.
pub(crate) fn setup_divisions(mdi: &mut Mdi, divisions: u16) {
    mdi.divisions = divisions;
    push_event(mdi, EventKind::SetDivisions, 0, EventValue::Int(divisions as u32));
}

pub(crate) fn new_mdi(opts: &ParseOptions) -> Mdi {
    Mdi::new(opts.sample_rate, Reverb::new(opts.sample_rate, Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_vlq_decodes_multi_byte() {
        let (value, len) = read_vlq(&[0x81, 0x00]).unwrap();
        assert_eq!(value, 128);
        assert_eq!(len, 2);
    }

    #[test]
    fn standard_vlq_decodes_single_byte() {
        let (value, len) = read_vlq(&[0x40]).unwrap();
        assert_eq!(value, 0x40);
        assert_eq!(len, 1);
    }

    #[test]
    fn reversed_vlq_decodes_multi_byte() {
        // low 7 bits first, continuation marked on the terminal (high) byte.
        let (value, len) = read_vlq_reversed(&[0x00, 0x81]).unwrap();
        assert_eq!(value, 128);
        assert_eq!(len, 2);
    }

    #[test]
    fn tick_clock_carries_remainder() {
        let mut clock = TickClock::new(32072, false);
        clock.divisions = 6;
        clock.tempo_usec = 500_000;
        let a = clock.samples_for_ticks(100);
        let b = clock.samples_for_ticks(8);
        assert!(a > 0 && b > 0);
    }

    #[test]
    fn detect_rejects_unknown_magic() {
        let opts = ParseOptions::new(44100);
        assert!(parse_any(b"NOPE", &opts).is_err());
    }
}
