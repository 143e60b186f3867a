//! Canonical in-memory sample: decoded PCM plus envelope and loop metadata.

use bitflags::bitflags;

bitflags! {
    /// Sample mode bits. Values match the reference GUS `.pat` decoder exactly so that
    /// raw `.pat` mode bytes can be widened into this type with no remapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SampleModes: u8 {
        /// Raw PCM was 16-bit (cleared after decode; canonical storage is always 16-bit).
        const SIXTEEN_BIT = 0x01;
        /// Raw PCM was unsigned (cleared after decode; canonical storage is always signed).
        const UNSIGNED    = 0x02;
        /// Sample loops between `loop_start` and `loop_end`.
        const LOOP        = 0x04;
        /// Raw PCM was stored ping-pong (cleared after decode; expanded into a straight
        /// forward+reverse+forward buffer).
        const PINGPONG    = 0x08;
        /// Raw PCM was stored reverse (cleared after decode).
        const REVERSE     = 0x10;
        /// Envelope freezes at stage 2 until note-off instead of advancing to stage 3.
        const SUSTAIN     = 0x20;
        /// Sample has a real 6-stage envelope; if unset, all stages ramp to full scale.
        const ENVELOPE    = 0x40;
        /// Note-off jumps directly to stage 5 instead of passing through stage 3/4.
        const CLAMPED     = 0x80;
    }
}

/// One pitch range of one patch: PCM buffer, loop points, envelope rate/target arrays.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Signed 16-bit mono PCM, natural rate.
    pub data: Vec<i16>,
    /// Length of `data` in 10-bit fixed-point sample positions (`data.len() << 10`).
    pub data_length: u32,
    /// Loop start in 10-bit fixed-point sample positions.
    pub loop_start: u32,
    /// Loop end in 10-bit fixed-point sample positions.
    pub loop_end: u32,
    /// `loop_end - loop_start`, precomputed for the wrap modulus.
    pub loop_size: u32,
    /// Low nibble = start fraction, high nibble = end fraction (pre-fixed-point-merge).
    pub loop_fraction: u8,
    /// Native sample rate in Hz.
    pub rate: u16,
    /// Lowest frequency (milliHertz) this sample covers.
    pub freq_low: u32,
    /// Highest frequency (milliHertz) this sample covers.
    pub freq_high: u32,
    /// Root frequency (milliHertz) at which the sample plays at its native rate.
    pub freq_root: u32,
    /// `((freq_root * 512) / rate) * 2`, precomputed resampling divisor (split into two
    /// multiplications in the reference decoder to dodge 32-bit overflow on high root
    /// frequencies; preserved here for bit-identical output rather than simplified to
    /// `(freq_root * 1024) / rate`).
    pub inc_div: u32,
    /// Canonicalised mode bits (16-bit/unsigned/reverse/pingpong always cleared).
    pub modes: SampleModes,
    /// Per-stage envelope increment (signed; sign selects the stage-completion comparison).
    pub env_rate: [i32; 7],
    /// Per-stage envelope target level (0..=4_194_303).
    pub env_target: [i32; 7],
    /// Samples of decay remaining after note-off, summed from the post-release stages.
    pub note_off_decay: u32,
}

impl Sample {
    /// Number of raw (non-fixed-point) samples stored.
    pub fn raw_len(&self) -> usize {
        self.data.len()
    }
}
