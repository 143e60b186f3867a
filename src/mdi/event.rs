//! The canonical event shape every format parser lowers into.

use num_derive::FromPrimitive;

/// Which controller number a `ControlChange` event binds to.
///
/// REDESIGN FLAG: the reference decoder dispatches events through a table of function
/// pointers compared by identity; this enum plus `match` replaces that chain everywhere
/// (engine render loop, writer) without losing the "each controller number has exactly
/// one handler" shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ControllerKind {
    BankSelectMsb = 0,
    DataEntryMsb = 6,
    ChannelVolume = 7,
    ChannelBalance = 8,
    ChannelPan = 10,
    ChannelExpression = 11,
    DataEntryLsb = 38,
    ChannelHold = 64,
    DataIncrement = 96,
    DataDecrement = 97,
    NrpnLsb = 98,
    NrpnMsb = 99,
    RpnLsb = 100,
    RpnMsb = 101,
    AllSoundOff = 120,
    ResetAllControllers = 121,
    AllNotesOff = 123,
    /// Any controller number with no dedicated handler: recorded for the writer's
    /// round-trip but otherwise inert to the synthesis engine.
    Other(u8),
}

impl ControllerKind {
    /// Maps a raw MIDI controller number to its handler.
    pub fn from_controller_number(n: u8) -> Self {
        match n {
            0 => ControllerKind::BankSelectMsb,
            6 => ControllerKind::DataEntryMsb,
            7 => ControllerKind::ChannelVolume,
            8 => ControllerKind::ChannelBalance,
            10 => ControllerKind::ChannelPan,
            11 => ControllerKind::ChannelExpression,
            38 => ControllerKind::DataEntryLsb,
            64 => ControllerKind::ChannelHold,
            96 => ControllerKind::DataIncrement,
            97 => ControllerKind::DataDecrement,
            98 => ControllerKind::NrpnLsb,
            99 => ControllerKind::NrpnMsb,
            100 => ControllerKind::RpnLsb,
            101 => ControllerKind::RpnMsb,
            120 => ControllerKind::AllSoundOff,
            121 => ControllerKind::ResetAllControllers,
            123 => ControllerKind::AllNotesOff,
            other => ControllerKind::Other(other),
        }
    }

    /// Recovers the wire controller number, for the writer.
    pub fn controller_number(&self) -> u8 {
        match self {
            ControllerKind::BankSelectMsb => 0,
            ControllerKind::DataEntryMsb => 6,
            ControllerKind::ChannelVolume => 7,
            ControllerKind::ChannelBalance => 8,
            ControllerKind::ChannelPan => 10,
            ControllerKind::ChannelExpression => 11,
            ControllerKind::DataEntryLsb => 38,
            ControllerKind::ChannelHold => 64,
            ControllerKind::DataIncrement => 96,
            ControllerKind::DataDecrement => 97,
            ControllerKind::NrpnLsb => 98,
            ControllerKind::NrpnMsb => 99,
            ControllerKind::RpnLsb => 100,
            ControllerKind::RpnMsb => 101,
            ControllerKind::AllSoundOff => 120,
            ControllerKind::ResetAllControllers => 121,
            ControllerKind::AllNotesOff => 123,
            ControllerKind::Other(n) => *n,
        }
    }
}

/// Discriminant for every event the parsers and engine recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOff,
    NoteOn,
    Aftertouch,
    ControlChange(ControllerKind),
    ProgramChange,
    ChannelPressure,
    PitchBend,
    RolandDrumTrack,
    RolandReset,
    GmReset,
    YamahaReset,
    SetTempo,
    TimeSignature,
    KeySignature,
    SequenceNumber,
    ChannelPrefix,
    PortPrefix,
    SmpteOffset,
    Text,
    Copyright,
    TrackName,
    InstrumentName,
    Lyric,
    Marker,
    CuePoint,
    EndOfTrack,
    /// Synthetic: records the file's PPQN for the writer. Never produced by the wire
    /// format itself.
    SetDivisions,
}

/// Payload carried by an event: either a packed integer (note/velocity, controller
/// value, tempo µs/quarter, ...) or owned text (meta string events).
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Int(u32),
    Text(String),
}

impl EventValue {
    pub fn as_int(&self) -> u32 {
        match self {
            EventValue::Int(v) => *v,
            EventValue::Text(_) => 0,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            EventValue::Text(t) => Some(t),
            EventValue::Int(_) => None,
        }
    }
}

/// One entry in the canonical event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub channel: u8,
    pub data: EventValue,
    /// Rendered stereo frames to wait after this event before executing the next one.
    /// The final sentinel event always has `samples_to_next == 0`.
    pub samples_to_next: u32,
}

impl Event {
    pub fn new(kind: EventKind, channel: u8, data: EventValue) -> Self {
        Event {
            kind,
            channel,
            data,
            samples_to_next: 0,
        }
    }
}
