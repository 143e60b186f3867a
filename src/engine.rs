//! `Engine`/`Song`: process-wide synthesis state (patch table, master volume) and the
//! per-open-score playback cursor built on top of it (§5, §6, §9 "Global state").

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::{EngineConfig, MixerOptions};
use crate::error::{GusMidiError, Result};
use crate::mdi::{Event, EventKind, ControllerKind, Mdi};
use crate::parsers::{self, ParseOptions};
use crate::patch::PatchStore;
use crate::synth::{self, voice};

/// Largest input accepted by `open_buffer`/`open_file` (§6): `< 2^31` bytes.
const MAX_INPUT_BYTES: usize = 1 << 31;

/// Process-wide synthesis state: the resident patch table and master volume, built once
/// from an `EngineConfig` and shared by every `Song` opened from it.
///
/// REDESIGN FLAG: the reference decoder gathers this state (patch table, master volume,
/// mixer options, Gauss table) behind a process-wide handle list; here it is a single
/// owned object threaded through explicitly, with no global mutable state at all.
pub struct Engine {
    config: EngineConfig,
    patches: PatchStore,
    master_volume: AtomicU8,
}

impl Engine {
    /// Loads every patch directive in `config` and returns the ready-to-use engine.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let patches = PatchStore::load(&config)?;
        Ok(Engine {
            config,
            patches,
            master_volume: AtomicU8::new(127),
        })
    }

    /// Explicit, idempotent early drop of the patch store. Optional: normal `Drop` does
    /// the same; kept for API parity with the reference decoder's `shutdown()`.
    pub fn shutdown(self) {}

    pub fn set_master_volume(&self, volume: u8) {
        self.master_volume.store(volume.min(127), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> u8 {
        self.master_volume.load(Ordering::Relaxed)
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Reads and parses a score file from disk.
    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<Song<'_>> {
        let data = std::fs::read(path)?;
        self.open_buffer(&data)
    }

    /// Parses a score held entirely in memory.
    pub fn open_buffer(&self, data: &[u8]) -> Result<Song<'_>> {
        if data.len() >= MAX_INPUT_BYTES {
            return Err(GusMidiError::FileTooLong);
        }
        let mut opts = ParseOptions::new(self.config.sample_rate);
        opts.mixer_options = self.config.mixer_options;
        let mut mdi = parsers::parse_any(data, &opts)?;
        mdi.master_volume = self.master_volume();
        Ok(Song {
            engine: self,
            mdi,
            options: self.config.mixer_options,
            cvt_xmi_type: 0,
            cvt_frequency: 0,
        })
    }
}

/// Conversion-option tags accepted by `Song::set_cvt_option` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvtTag {
    XmiType,
    Frequency,
}

/// `Song::song_seek` direction (§6), valid only on Type-2 MDIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Previous,
    Current,
    Next,
}

/// Snapshot returned by `Song::get_info` (§6).
#[derive(Debug, Clone)]
pub struct SongInfo {
    pub copyright: Option<String>,
    pub current_sample: u64,
    pub approx_total_samples: u64,
    pub mixer_options: MixerOptions,
    pub total_midi_time_ms: u64,
}

/// One open score, borrowing the engine's patch table and master volume for its lifetime.
pub struct Song<'e> {
    engine: &'e Engine,
    mdi: Mdi,
    options: MixerOptions,
    /// `CvtTag::XmiType` storage. Parity field only: conversion-time XMIDI dialect
    /// selection happens in `parsers::xmidi` at `open_buffer` time, so this setter has no
    /// live effect on an already-parsed `Song` (there is no reparse operation in this
    /// API); it exists so callers that set it before `get_output` don't get a surprise
    /// "no such method" compile error when porting code from the reference decoder.
    cvt_xmi_type: u32,
    cvt_frequency: u32,
}

enum DispatchSignal {
    /// `samples_to_mix` was just set to a positive value; keep rendering.
    Continue,
    /// The stream ended (no LOOP option, or genuinely out of events).
    EndOfStream,
}

impl<'e> Song<'e> {
    /// Fills `buffer` (a multiple of 4 bytes: 2 channels x 16-bit) with rendered PCM,
    /// returning the number of bytes actually written (less than `buffer.len()` only at
    /// end of stream with looping disabled).
    pub fn get_output(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if buffer.len() % 4 != 0 {
            return Err(GusMidiError::InvalidArg("buffer length must be a multiple of 4".into()));
        }
        let frames_wanted = buffer.len() / 4;
        let mut produced = 0usize;

        while produced < frames_wanted {
            if self.mdi.samples_to_mix == 0 {
                if matches!(self.dispatch_until_delay(), DispatchSignal::EndOfStream) {
                    break;
                }
            }
            let n = self.mdi.samples_to_mix.min((frames_wanted - produced) as u32);
            for _ in 0..n {
                let (left, right) =
                    synth::render_frame(&mut self.mdi, self.engine.config.sample_rate, self.options);
                write_frame(buffer, produced, left, right);
                produced += 1;
            }
            self.mdi.samples_to_mix -= n;
            self.mdi.current_sample += n as u64;
        }
        Ok(produced * 4)
    }

    /// Enables/disables a mixer option on this handle. Only `LOG_VOLUME`, `REVERB`,
    /// `ENHANCED_RESAMPLING`, `LOOP`, `TEXTASLYRIC` are meaningful here (others are
    /// parse-time only and have no effect on an already-open `Song`).
    pub fn set_option(&mut self, option: MixerOptions, enabled: bool) {
        let relevant = MixerOptions::LOG_VOLUME
            | MixerOptions::REVERB
            | MixerOptions::ENHANCED_RESAMPLING
            | MixerOptions::LOOP
            | MixerOptions::TEXTASLYRIC;
        self.options.set(option & relevant, enabled);
        if option.intersects(MixerOptions::LOG_VOLUME) {
            for ch in 0..16u8 {
                voice::recompute_channel_mix_volumes(
                    &mut self.mdi,
                    ch,
                    self.options.contains(MixerOptions::LOG_VOLUME),
                );
            }
        }
    }

    pub fn set_cvt_option(&mut self, tag: CvtTag, value: u32) {
        match tag {
            CvtTag::XmiType => self.cvt_xmi_type = value,
            CvtTag::Frequency => self.cvt_frequency = value,
        }
    }

    /// Seeks to `target_sample` (clamped to `[0, approx_total_samples]`) by dispatching
    /// events without mixing, then clearing active voices and reverb state.
    pub fn fast_seek(&mut self, target_sample: u32) {
        let target = (target_sample as u64).min(self.mdi.approx_total_samples);
        self.reset_to_start();
        while self.mdi.current_sample < target {
            match self.dispatch_until_delay() {
                DispatchSignal::Continue => {
                    let remaining = target - self.mdi.current_sample;
                    let step = (self.mdi.samples_to_mix as u64).min(remaining);
                    self.mdi.current_sample += step;
                    self.mdi.samples_to_mix = 0;
                }
                DispatchSignal::EndOfStream => break,
            }
        }
    }

    /// Jumps to the previous/current/next song boundary in a Type-2 MDI, by scanning
    /// `EndOfTrack` markers. No-op on non-Type-2 MDIs.
    pub fn song_seek(&mut self, direction: SeekDirection) {
        if !self.mdi.is_type2 {
            return;
        }
        let boundaries: Vec<usize> = self
            .mdi
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == EventKind::EndOfTrack)
            .map(|(i, _)| i)
            .collect();
        if boundaries.is_empty() {
            return;
        }
        let current_track = boundaries.iter().position(|&b| b >= self.mdi.cursor).unwrap_or(boundaries.len() - 1);
        let target_track = match direction {
            SeekDirection::Previous => current_track.saturating_sub(1),
            SeekDirection::Current => current_track,
            SeekDirection::Next => (current_track + 1).min(boundaries.len() - 1),
        };
        let start = if target_track == 0 { 0 } else { boundaries[target_track - 1] + 1 };

        self.mdi.clear_voices();
        self.mdi.cursor = start;
        self.mdi.samples_to_mix = 0;
        self.mdi.current_sample = 0;
    }

    pub fn get_info(&self) -> SongInfo {
        let total_midi_time_ms = (self.mdi.approx_total_samples * 1000)
            / self.engine.config.sample_rate.max(1) as u64;
        SongInfo {
            copyright: self.mdi.copyright.clone(),
            current_sample: self.mdi.current_sample,
            approx_total_samples: self.mdi.approx_total_samples,
            mixer_options: self.options,
            total_midi_time_ms,
        }
    }

    /// Returns and clears the most recently encountered lyric, if any.
    pub fn get_lyric(&mut self) -> Option<String> {
        self.mdi.last_lyric.take()
    }

    /// Output sample rate this score renders at, in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.engine.config.sample_rate
    }

    /// Re-emits this score's event stream as a Standard MIDI File byte sequence (§4.7).
    pub fn convert_to_midi(&self) -> Result<Vec<u8>> {
        crate::writer::event_to_midi(&self.mdi, self.options)
    }

    fn reset_to_start(&mut self) {
        self.mdi.cursor = 0;
        self.mdi.current_sample = 0;
        self.mdi.samples_to_mix = 0;
        self.mdi.clear_voices();
    }

    /// Dispatches events at the current cursor until one leaves a positive
    /// `samples_to_mix`, or the stream ends (looping if the LOOP option is set).
    fn dispatch_until_delay(&mut self) -> DispatchSignal {
        loop {
            if self.mdi.cursor >= self.mdi.events.len() {
                return DispatchSignal::EndOfStream;
            }
            let event = self.mdi.events[self.mdi.cursor].clone();
            self.mdi.cursor += 1;
            self.apply_event(&event);

            if event.kind == EventKind::EndOfTrack {
                if self.options.contains(MixerOptions::LOOP) {
                    self.reset_to_start();
                    continue;
                }
                return DispatchSignal::EndOfStream;
            }
            if event.samples_to_next > 0 {
                self.mdi.samples_to_mix = event.samples_to_next;
                return DispatchSignal::Continue;
            }
            if self.mdi.approx_total_samples > 0
                && self.mdi.current_sample >= self.mdi.approx_total_samples
            {
                return DispatchSignal::EndOfStream;
            }
        }
    }

    fn apply_event(&mut self, event: &Event) {
        let sample_rate = self.engine.config.sample_rate;
        let log_volume = self.options.contains(MixerOptions::LOG_VOLUME);
        let ch = (event.channel & 0x0F) as usize;

        match event.kind {
            EventKind::NoteOn => {
                let raw = event.data.as_int();
                let key = (raw & 0xFF) as u8;
                let velocity = ((raw >> 8) & 0xFF) as u8;
                voice::note_on(&mut self.mdi, sample_rate, log_volume, ch as u8, key, velocity);
            }
            EventKind::NoteOff => {
                let key = (event.data.as_int() & 0xFF) as u8;
                voice::note_off(&mut self.mdi, ch as u8, key);
            }
            EventKind::ControlChange(controller) => self.apply_controller(ch as u8, controller, event.data.as_int() as u8),
            EventKind::ProgramChange => {
                let program = event.data.as_int() as u8;
                let bank_byte = self.mdi.channels[ch].bank | if self.mdi.channels[ch].is_drum { 0x80 } else { 0 };
                self.mdi.channels[ch].patch = self.engine.patches.get_patch(bank_byte, program);
            }
            EventKind::ChannelPressure => {
                self.mdi.channels[ch].pressure = event.data.as_int() as u8;
                voice::recompute_channel_mix_volumes(&mut self.mdi, ch as u8, log_volume);
            }
            EventKind::PitchBend => {
                let signed = event.data.as_int() as i32;
                self.mdi.channels[ch].pitch_wheel = signed.clamp(-8192, 8191) as i16;
                self.mdi.channels[ch].recompute_pitch_adjust();
                voice::recompute_channel_pitch(&mut self.mdi, sample_rate, ch as u8);
            }
            EventKind::RolandDrumTrack => {
                self.mdi.channels[ch].is_drum = event.data.as_int() != 0;
            }
            EventKind::RolandReset | EventKind::GmReset | EventKind::YamahaReset => {
                self.mdi.reset_all_channels();
            }
            EventKind::Copyright => {
                if self.mdi.copyright.is_none() {
                    if let Some(text) = event.data.as_text() {
                        self.mdi.copyright = Some(text.to_string());
                    }
                }
            }
            EventKind::Lyric => {
                if let Some(text) = event.data.as_text() {
                    self.mdi.last_lyric = Some(text.to_string());
                }
            }
            EventKind::Text if self.options.contains(MixerOptions::TEXTASLYRIC) => {
                if let Some(text) = event.data.as_text() {
                    self.mdi.last_lyric = Some(text.to_string());
                }
            }
            _ => {}
        }
    }

    fn apply_controller(&mut self, ch: u8, controller: ControllerKind, value: u8) {
        let sample_rate = self.engine.config.sample_rate;
        let log_volume = self.options.contains(MixerOptions::LOG_VOLUME);
        let ch_idx = ch as usize;

        match controller {
            ControllerKind::BankSelectMsb => self.mdi.channels[ch_idx].bank = value & 0x7F,
            ControllerKind::ChannelVolume => {
                self.mdi.channels[ch_idx].volume = value;
                voice::recompute_channel_mix_volumes(&mut self.mdi, ch, log_volume);
            }
            ControllerKind::ChannelBalance => {
                self.mdi.channels[ch_idx].balance = value;
                voice::recompute_channel_mix_volumes(&mut self.mdi, ch, log_volume);
            }
            ControllerKind::ChannelPan => {
                self.mdi.channels[ch_idx].pan = value;
                voice::recompute_channel_mix_volumes(&mut self.mdi, ch, log_volume);
            }
            ControllerKind::ChannelExpression => {
                self.mdi.channels[ch_idx].expression = value;
                voice::recompute_channel_mix_volumes(&mut self.mdi, ch, log_volume);
            }
            ControllerKind::ChannelHold => {
                let was_held = self.mdi.channels[ch_idx].hold;
                let now_held = value >= 64;
                self.mdi.channels[ch_idx].hold = now_held;
                if was_held && !now_held {
                    voice::release_hold(&mut self.mdi, ch);
                }
            }
            ControllerKind::DataEntryMsb => {
                self.apply_data_entry(ch_idx, sample_rate, value, true);
            }
            ControllerKind::DataEntryLsb => {
                self.apply_data_entry(ch_idx, sample_rate, value, false);
            }
            ControllerKind::DataIncrement => self.nudge_rpn_pitch_range(ch_idx, sample_rate, 1),
            ControllerKind::DataDecrement => self.nudge_rpn_pitch_range(ch_idx, sample_rate, -1),
            ControllerKind::NrpnLsb | ControllerKind::NrpnMsb => {
                self.mdi.channels[ch_idx].nrpn_selected = true;
            }
            ControllerKind::RpnLsb => {
                let hi = self.mdi.channels[ch_idx].rpn & 0xFF00;
                self.mdi.channels[ch_idx].rpn = hi | value as u16;
                self.mdi.channels[ch_idx].nrpn_selected = false;
            }
            ControllerKind::RpnMsb => {
                let lo = self.mdi.channels[ch_idx].rpn & 0x00FF;
                self.mdi.channels[ch_idx].rpn = ((value as u16) << 8) | lo;
                self.mdi.channels[ch_idx].nrpn_selected = false;
            }
            ControllerKind::AllSoundOff => voice::all_sound_off(&mut self.mdi, ch),
            ControllerKind::AllNotesOff => voice::all_notes_off(&mut self.mdi, ch),
            ControllerKind::ResetAllControllers => {
                let patch = self.mdi.channels[ch_idx].patch.clone();
                let is_drum = self.mdi.channels[ch_idx].is_drum;
                self.mdi.reset_channel(ch_idx);
                self.mdi.channels[ch_idx].patch = patch;
                self.mdi.channels[ch_idx].is_drum = is_drum;
                voice::recompute_channel_pitch(&mut self.mdi, sample_rate, ch);
                voice::recompute_channel_mix_volumes(&mut self.mdi, ch, log_volume);
            }
            ControllerKind::Other(_) => {}
        }
    }

    /// RPN 0 (pitch bend range): MSB sets whole semitones, LSB sets the cents remainder.
    /// Any other selected RPN/NRPN register is accepted but has no synthesis effect.
    fn apply_data_entry(&mut self, ch_idx: usize, sample_rate: u32, value: u8, msb: bool) {
        if self.mdi.channels[ch_idx].nrpn_selected || self.mdi.channels[ch_idx].rpn != 0 {
            return;
        }
        let cents = self.mdi.channels[ch_idx].pitch_range_cents;
        let (semitones, remainder) = (cents / 100, cents % 100);
        self.mdi.channels[ch_idx].pitch_range_cents = if msb {
            value as u16 * 100 + remainder
        } else {
            semitones * 100 + value as u16
        };
        self.mdi.channels[ch_idx].recompute_pitch_adjust();
        voice::recompute_channel_pitch(&mut self.mdi, sample_rate, ch_idx as u8);
    }

    fn nudge_rpn_pitch_range(&mut self, ch_idx: usize, sample_rate: u32, delta: i32) {
        if self.mdi.channels[ch_idx].nrpn_selected || self.mdi.channels[ch_idx].rpn != 0 {
            return;
        }
        let cents = self.mdi.channels[ch_idx].pitch_range_cents as i32;
        self.mdi.channels[ch_idx].pitch_range_cents = (cents + delta).clamp(0, 12700) as u16;
        self.mdi.channels[ch_idx].recompute_pitch_adjust();
        voice::recompute_channel_pitch(&mut self.mdi, sample_rate, ch_idx as u8);
    }
}

/// Packs one stereo frame into `buffer` at frame index `frame`, little-endian 16-bit,
/// with saturating clamp to the int16 range.
fn write_frame(buffer: &mut [u8], frame: usize, left: i32, right: i32) {
    let l = left.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    let r = right.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    let base = frame * 4;
    buffer[base..base + 2].copy_from_slice(&l.to_le_bytes());
    buffer[base + 2..base + 4].copy_from_slice(&r.to_le_bytes());
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

    fn test_engine() -> Engine {
        Engine::new(EngineConfig::new(44100).unwrap()).unwrap()
    }

    #[test]
    fn accepts_buffer_under_the_size_bound() {
        // A 2GiB fixture isn't practical in a unit test; this exercises the accepted
        // side of the `MAX_INPUT_BYTES` check the oversize path shares.
        let engine = test_engine();
        let track: &[u8] = &[0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(0, 96, &[track]);
        assert!(engine.open_buffer(&data).is_ok());
    }

    #[test]
    fn get_output_rejects_non_multiple_of_four_buffer() {
        let engine = test_engine();
        let track: &[u8] = &[0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(0, 96, &[track]);
        let mut song = engine.open_buffer(&data).unwrap();
        let mut buf = [0u8; 3];
        assert!(song.get_output(&mut buf).is_err());
    }

    #[test]
    fn empty_stream_produces_no_output() {
        let engine = test_engine();
        let track: &[u8] = &[0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(0, 96, &[track]);
        let mut song = engine.open_buffer(&data).unwrap();
        let mut buf = [0u8; 64];
        let n = song.get_output(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn get_info_reports_copyright_and_timing() {
        let engine = test_engine();
        let track: &[u8] =
            &[0x00, 0xFF, 0x02, 0x03, b'(', b'c', b')', 0x00, 0xFF, 0x2F, 0x00];
        let data = build_smf(0, 96, &[track]);
        let song = engine.open_buffer(&data).unwrap();
        let info = song.get_info();
        assert_eq!(info.copyright.as_deref(), Some("(c)"));
    }

    #[test]
    fn fast_seek_clamps_to_total_samples() {
        let engine = test_engine();
        let track: &[u8] = &[
            0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00,
        ];
        let data = build_smf(0, 96, &[track]);
        let mut song = engine.open_buffer(&data).unwrap();
        song.fast_seek(u32::MAX);
        assert_eq!(song.mdi.current_sample, song.mdi.approx_total_samples);
    }

    #[test]
    fn master_volume_is_clamped_and_readable() {
        let engine = test_engine();
        engine.set_master_volume(200);
        assert_eq!(engine.master_volume(), 127);
    }

    #[test]
    fn note_on_then_off_allocates_and_releases_a_voice() {
        let engine = test_engine();
        let track: &[u8] = &[
            0x00, 0xC0, 0, 0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00,
        ];
        let data = build_smf(0, 96, &[track]);
        let mut song = engine.open_buffer(&data).unwrap();
        // No patch is loaded (no directives registered), so NoteOn should be silently
        // dropped rather than panicking.
        let mut buf = [0u8; 4096];
        let _ = song.get_output(&mut buf).unwrap();
    }
}
