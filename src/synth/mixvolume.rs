//! Per-voice mix volume: combines velocity, channel volume/expression, master volume, and
//! pan/balance into a stereo pair of 10-bit fixed-point scalars (§4.3 Master volume).

use crate::mdi::{ActiveNote, ChannelState};
use crate::tables::{lin_volume, DBM_PAN_VOLUME, DBM_VOLUME};

/// Combines `pan` and `balance` into a single `0..=127` stereo position, matching the
/// reference decoder's treatment of balance as a second, additive pan control.
fn pan_offset(pan: u8, balance: u8) -> u8 {
    let offset = (pan as i32 - 64) + (balance as i32 - 64);
    (offset + 64).clamp(0, 127) as u8
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Looks up the dBm table entry closest to `fraction` (`0.0..=1.0`) by mapping it onto the
/// same 128-point grid `DBM_VOLUME` is indexed by.
fn volume_to_db(fraction: f32) -> f32 {
    if fraction <= 0.0 {
        return DBM_VOLUME[0];
    }
    let idx = ((fraction.min(1.0) * 127.0).round() as usize).min(127);
    DBM_VOLUME[idx]
}

/// Recomputes `note.left_mix_volume`/`right_mix_volume` from velocity, the owning
/// channel's volume/expression/pan/balance, and the song's master volume. `log_volume`
/// selects the logarithmic (dBm table) path over the default linear one.
pub fn recompute(note: &mut ActiveNote, channel: &ChannelState, master_volume: u8, log_volume: bool) {
    let pan_pos = pan_offset(channel.pan, channel.balance);

    if log_volume {
        let vol_db = volume_to_db(note.velocity as f32 / 127.0)
            + volume_to_db(channel.volume as f32 / 127.0)
            + volume_to_db(channel.expression as f32 / 127.0)
            + volume_to_db(master_volume as f32 / 127.0);
        let left_db = vol_db + DBM_PAN_VOLUME[127 - pan_pos as usize];
        let right_db = vol_db + DBM_PAN_VOLUME[pan_pos as usize];
        note.left_mix_volume = (db_to_linear(left_db) * 1024.0).round() as i32;
        note.right_mix_volume = (db_to_linear(right_db) * 1024.0).round() as i32;
        return;
    }

    let velocity_vol = lin_volume(note.velocity);
    let channel_vol = lin_volume(channel.volume);
    let expr_vol = lin_volume(channel.expression);
    let master_vol = lin_volume(master_volume);

    let combined = ((velocity_vol as i64 * channel_vol as i64) / 1024)
        * ((expr_vol as i64 * master_vol as i64) / 1024)
        / 1024;

    let left_pan = lin_volume(127 - pan_pos) as i64;
    let right_pan = lin_volume(pan_pos) as i64;
    note.left_mix_volume = ((combined * left_pan) / 1024) as i32;
    note.right_mix_volume = ((combined * right_pan) / 1024) as i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdi::Mdi;
    use crate::patch::Patch;
    use crate::reverb::Reverb;
    use std::sync::Arc;

    fn note_with_velocity(velocity: u8) -> ActiveNote {
        let patch = Arc::new(Patch {
            program: 0,
            bank_byte: 0,
            forced_note: None,
            samples: vec![],
        });
        ActiveNote {
            velocity,
            patch,
            sample_index: 0,
            sample_pos: 0,
            sample_inc: 1024,
            env_level: 0,
            env_inc: 0,
            env_stage: 0,
            modes: crate::patch::SampleModes::empty(),
            hold_off: false,
            is_off: false,
            ignore_chan_events: false,
            left_mix_volume: 0,
            right_mix_volume: 0,
            replay: None,
        }
    }

    #[test]
    fn centered_pan_splits_evenly() {
        let mdi = Mdi::new(44100, Reverb::new(44100, Default::default()));
        let channel = mdi.channels[0].clone();
        let mut note = note_with_velocity(127);
        recompute(&mut note, &channel, 127, false);
        assert!((note.left_mix_volume - note.right_mix_volume).abs() <= 1);
        assert!(note.left_mix_volume > 900);
    }

    #[test]
    fn hard_left_pan_silences_right_channel() {
        let mdi = Mdi::new(44100, Reverb::new(44100, Default::default()));
        let mut channel = mdi.channels[0].clone();
        channel.pan = 0;
        let mut note = note_with_velocity(127);
        recompute(&mut note, &channel, 127, false);
        assert_eq!(note.right_mix_volume, 0);
        assert!(note.left_mix_volume > 0);
    }

    #[test]
    fn zero_velocity_is_silent_in_both_paths() {
        let mdi = Mdi::new(44100, Reverb::new(44100, Default::default()));
        let channel = mdi.channels[0].clone();
        let mut note = note_with_velocity(0);
        recompute(&mut note, &channel, 127, false);
        assert_eq!(note.left_mix_volume, 0);
        assert_eq!(note.right_mix_volume, 0);

        recompute(&mut note, &channel, 127, true);
        assert!(note.left_mix_volume.abs() < 2);
    }

    #[test]
    fn balance_and_pan_combine_additively() {
        let pos = pan_offset(96, 96);
        assert_eq!(pos, 127);
        let pos = pan_offset(32, 32);
        assert_eq!(pos, 0);
    }
}
