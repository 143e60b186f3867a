//! Seven-stage (0..=6) envelope state machine (§4.3): stage 0 attack, 1-2 decay, 3
//! sustain hold, 4-5 release, 6 a synthetic fast-kill used on voice stealing / All
//! Sound Off.

use crate::mdi::ActiveNote;
use crate::patch::{Sample, SampleModes};
use crate::tables::ENV_LEVEL_MAX;

/// What the caller must do after one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// Keep rendering; no action required.
    Continue,
    /// Stage 0 just completed while a note-off arrived during it; the caller (which
    /// holds channel hold-pedal state) must now apply the deferred note-off.
    DeferredNoteOff,
    /// The voice has fully decayed and should be torn down.
    Terminate,
}

/// Computes the `(target, env_inc)` pair for entering `stage` from `level`. The sign of
/// `env_inc` is chosen by whether the stage moves the level up or down.
pub fn enter_stage(level: i32, sample: &Sample, stage: u8) -> (i32, i32) {
    let target = sample.env_target[stage as usize];
    let rate = sample.env_rate[stage as usize].abs().max(1);
    let inc = if target >= level { rate } else { -rate };
    (target, inc)
}

fn enter(note: &mut ActiveNote, sample: &Sample, stage: u8) {
    let (_, inc) = enter_stage(note.env_level, sample, stage);
    note.env_stage = stage;
    note.env_inc = inc;
}

/// Advances `note`'s envelope by one sample frame against `sample`'s per-stage rate and
/// target tables.
pub fn advance(note: &mut ActiveNote, sample: &Sample) -> EnvelopeOutcome {
    if note.env_inc == 0 {
        return EnvelopeOutcome::Continue;
    }

    note.env_level = (note.env_level + note.env_inc).clamp(0, ENV_LEVEL_MAX);
    let target = sample.env_target[note.env_stage as usize];
    let completed = if note.env_inc < 0 {
        note.env_level <= target
    } else {
        note.env_level >= target
    };
    if !completed {
        return EnvelopeOutcome::Continue;
    }
    note.env_level = target;

    match note.env_stage {
        0 => {
            if sample.modes.contains(SampleModes::ENVELOPE) {
                enter(note, sample, 1);
            } else {
                note.env_inc = 0;
            }
            if note.is_off {
                note.is_off = false;
                EnvelopeOutcome::DeferredNoteOff
            } else {
                EnvelopeOutcome::Continue
            }
        }
        1 => {
            enter(note, sample, 2);
            EnvelopeOutcome::Continue
        }
        2 => {
            if sample.modes.contains(SampleModes::SUSTAIN) {
                note.env_inc = 0;
            } else if sample.modes.contains(SampleModes::CLAMPED) {
                enter(note, sample, 5);
            } else {
                enter(note, sample, 3);
            }
            EnvelopeOutcome::Continue
        }
        3 => {
            enter(note, sample, 4);
            EnvelopeOutcome::Continue
        }
        4 => {
            enter(note, sample, 5);
            EnvelopeOutcome::Continue
        }
        5 => {
            if note.env_level == 0 {
                EnvelopeOutcome::Terminate
            } else {
                note.modes -= SampleModes::LOOP;
                note.env_inc = 0;
                EnvelopeOutcome::Continue
            }
        }
        _ => EnvelopeOutcome::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use std::sync::Arc;

    fn sample_with(modes: SampleModes) -> Sample {
        Sample {
            data: vec![0; 8],
            data_length: 8 << 10,
            loop_start: 0,
            loop_end: 8 << 10,
            loop_size: 8 << 10,
            loop_fraction: 0,
            rate: 44100,
            freq_low: 0,
            freq_high: u32::MAX,
            freq_root: 44_100_000,
            inc_div: 1024,
            modes,
            env_rate: [1_000_000, 1_000_000, 1_000_000, 1, 1_000_000, 1_000_000, 1_000_000],
            env_target: [ENV_LEVEL_MAX, ENV_LEVEL_MAX, ENV_LEVEL_MAX, ENV_LEVEL_MAX, 0, 0, 0],
            note_off_decay: 0,
        }
    }

    fn note_with(sample: &Sample) -> ActiveNote {
        let patch = Arc::new(Patch {
            program: 0,
            bank_byte: 0,
            forced_note: None,
            samples: vec![sample.clone()],
        });
        let (_, inc) = enter_stage(0, sample, 0);
        ActiveNote {
            velocity: 100,
            patch,
            sample_index: 0,
            sample_pos: 0,
            sample_inc: 1024,
            env_level: 0,
            env_inc: inc,
            env_stage: 0,
            modes: sample.modes,
            hold_off: false,
            is_off: false,
            ignore_chan_events: false,
            left_mix_volume: 1024,
            right_mix_volume: 1024,
            replay: None,
        }
    }

    #[test]
    fn stage_zero_without_envelope_freezes() {
        let sample = sample_with(SampleModes::empty());
        let mut note = note_with(&sample);
        let outcome = advance(&mut note, &sample);
        assert_eq!(outcome, EnvelopeOutcome::Continue);
        assert_eq!(note.env_inc, 0);
        assert_eq!(note.env_stage, 0);
    }

    #[test]
    fn stage_zero_advances_with_envelope_and_reports_deferred_off() {
        let sample = sample_with(SampleModes::ENVELOPE);
        let mut note = note_with(&sample);
        note.is_off = true;
        let outcome = advance(&mut note, &sample);
        assert_eq!(outcome, EnvelopeOutcome::DeferredNoteOff);
        assert_eq!(note.env_stage, 1);
        assert!(!note.is_off);
    }

    #[test]
    fn sustain_freezes_at_stage_two() {
        let sample = sample_with(SampleModes::ENVELOPE | SampleModes::SUSTAIN);
        let mut note = note_with(&sample);
        note.env_stage = 2;
        note.env_level = sample.env_target[2];
        note.env_inc = 1;
        let outcome = advance(&mut note, &sample);
        assert_eq!(outcome, EnvelopeOutcome::Continue);
        assert_eq!(note.env_inc, 0);
        assert_eq!(note.env_stage, 2);
    }

    #[test]
    fn stage_five_reaching_zero_terminates() {
        let sample = sample_with(SampleModes::ENVELOPE);
        let mut note = note_with(&sample);
        note.env_stage = 5;
        note.env_level = 1;
        note.env_inc = -1;
        let outcome = advance(&mut note, &sample);
        assert_eq!(outcome, EnvelopeOutcome::Terminate);
        assert_eq!(note.env_level, 0);
    }

    #[test]
    fn stage_six_always_terminates() {
        let sample = sample_with(SampleModes::ENVELOPE);
        let mut note = note_with(&sample);
        let (_, inc) = enter_stage(note.env_level, &sample, 6);
        note.env_stage = 6;
        note.env_inc = inc;
        note.env_level = 1;
        let outcome = advance(&mut note, &sample);
        assert_eq!(outcome, EnvelopeOutcome::Terminate);
    }
}
