//! MDI (Midi Decoded Image): the canonical in-memory form every parser produces and the
//! synthesis engine consumes.

pub mod event;

use std::sync::Arc;

pub use event::{ControllerKind, Event, EventKind, EventValue};

use crate::patch::Patch;
use crate::reverb::Reverb;

/// Per-channel MIDI controller state (§3 Channel state).
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub patch: Option<Arc<Patch>>,
    pub bank: u8,
    pub is_drum: bool,
    pub hold: bool,
    pub volume: u8,
    pub expression: u8,
    pub pressure: u8,
    pub balance: u8,
    pub pan: u8,
    /// Signed, zero-centred pitch wheel position (-8192..=8191).
    pub pitch_wheel: i16,
    pub pitch_range_cents: u16,
    pub pitch_adjust_cents: i32,
    pub rpn: u16,
    pub nrpn: u16,
    /// `true` selects the NRPN register pair as the target of data-entry events.
    pub nrpn_selected: bool,
}

impl ChannelState {
    /// Recomputes `pitch_adjust_cents` from the current pitch wheel position and range
    /// (§4.4): `pitch_range · (pitch / 8192)`.
    pub fn recompute_pitch_adjust(&mut self) {
        self.pitch_adjust_cents =
            (self.pitch_range_cents as i32 * self.pitch_wheel as i32) / 8192;
    }

    fn reset(channel_index: usize) -> Self {
        ChannelState {
            patch: None,
            bank: 0,
            is_drum: channel_index == 9,
            hold: false,
            volume: 100,
            expression: 127,
            pressure: 127,
            balance: 64,
            pan: 64,
            pitch_wheel: 0,
            pitch_range_cents: 200,
            pitch_adjust_cents: 0,
            rpn: 0xFFFF,
            nrpn: 0xFFFF,
            nrpn_selected: false,
        }
    }
}

/// A queued re-trigger for a `(channel, key)` slot that is still fading out.
#[derive(Debug, Clone)]
pub struct PendingReplay {
    pub velocity: u8,
    pub patch: Arc<Patch>,
    pub sample_index: usize,
    /// Pre-computed resampling step for the queued re-trigger, so the handover on
    /// termination doesn't need to re-derive it from channel/pitch state that may have
    /// since moved on.
    pub sample_inc: u32,
}

/// One active playing instance of a sample (§3 Note).
#[derive(Debug, Clone)]
pub struct ActiveNote {
    pub velocity: u8,
    pub patch: Arc<Patch>,
    pub sample_index: usize,
    /// Fixed-point (10 fractional bits) position into the sample buffer.
    pub sample_pos: u64,
    pub sample_inc: u32,
    pub env_level: i32,
    pub env_inc: i32,
    /// Current envelope stage, 0..=6.
    pub env_stage: u8,
    pub modes: crate::patch::SampleModes,
    pub hold_off: bool,
    pub is_off: bool,
    pub ignore_chan_events: bool,
    pub left_mix_volume: i32,
    pub right_mix_volume: i32,
    pub replay: Option<PendingReplay>,
}

/// One of the two pre-reserved voice slots for a given `(channel, key)`.
#[derive(Debug, Clone, Default)]
pub enum NoteSlot {
    #[default]
    Inactive,
    Active(Box<ActiveNote>),
}

impl NoteSlot {
    pub fn is_active(&self) -> bool {
        matches!(self, NoteSlot::Active(_))
    }
}

/// Identifies one of the two slots for a `(channel, key)` pair, used by the engine's
/// explicit active-voice walk list (REDESIGN FLAG: replaces the intrusive singly-linked
/// active-voice list with an index list over the owned note table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceHandle {
    pub channel: u8,
    pub key: u8,
    pub slot: u8,
}

/// The canonical decoded score image: events, channel/note state, and render scratch.
pub struct Mdi {
    pub events: Vec<Event>,
    pub cursor: usize,
    pub samples_to_mix: u32,
    pub channels: [ChannelState; 16],
    /// Two pre-reserved slots per (channel, key): `note_table[channel][key][slot]`.
    pub note_table: Vec<[[NoteSlot; 2]; 128]>,
    pub active_voices: Vec<VoiceHandle>,
    pub reverb: Reverb,
    pub mix_buffer: Vec<i32>,
    /// Present in the reference decoder but never driven; kept for field parity per the
    /// recorded "dynamic volume pass left unimplemented" decision.
    pub dynamic_volume_accumulator: f32,
    pub master_volume: u8,
    pub is_type2: bool,
    pub copyright: Option<String>,
    pub last_lyric: Option<String>,
    pub current_sample: u64,
    pub approx_total_samples: u64,
    pub divisions: u16,
    /// Output sample rate this image was parsed/rendered for; the writer needs it to
    /// invert `samples_to_next` back into ticks.
    pub sample_rate: u32,
}

impl Mdi {
    pub fn new(sample_rate: u32, reverb: Reverb) -> Self {
        Mdi {
            events: Vec::new(),
            cursor: 0,
            samples_to_mix: 0,
            channels: std::array::from_fn(ChannelState::reset),
            note_table: (0..16).map(|_| std::array::from_fn(|_| Default::default())).collect(),
            active_voices: Vec::new(),
            reverb,
            mix_buffer: vec![0; sample_rate as usize / 10 * 2],
            dynamic_volume_accumulator: 0.0,
            master_volume: 127,
            is_type2: false,
            copyright: None,
            last_lyric: None,
            current_sample: 0,
            approx_total_samples: 0,
            divisions: 96,
            sample_rate,
        }
    }

    /// Applies the GM/Roland/Yamaha reset defaults (§3 Channel state) to every channel.
    pub fn reset_all_channels(&mut self) {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            *ch = ChannelState::reset(i);
        }
    }

    pub fn reset_channel(&mut self, channel: usize) {
        self.channels[channel] = ChannelState::reset(channel);
    }

    /// Clears every active voice and resets the reverb state, used by `fast_seek`.
    pub fn clear_voices(&mut self) {
        for track in self.note_table.iter_mut() {
            for key in track.iter_mut() {
                key[0] = NoteSlot::Inactive;
                key[1] = NoteSlot::Inactive;
            }
        }
        self.active_voices.clear();
        self.reverb.reset();
    }
}
