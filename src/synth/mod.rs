//! Synthesis: per-sample voice rendering, built from the envelope, resampling, mix
//! volume and voice-allocation modules.

pub mod envelope;
pub mod mixvolume;
pub mod resample;
pub mod voice;

use crate::config::MixerOptions;
use crate::mdi::{Mdi, NoteSlot, VoiceHandle};
use crate::patch::SampleModes;
use crate::tables::ENV_LEVEL_MAX;
use envelope::EnvelopeOutcome;

/// Renders and advances every active voice by one stereo frame, returning the mixed,
/// pre-clip sample pair. Terminated voices are torn down (handing off to a queued replay
/// if one is pending); voices whose attack completed with a note-off pending apply it now.
pub fn render_frame(mdi: &mut Mdi, sample_rate: u32, mixer_options: MixerOptions) -> (i32, i32) {
    let enhanced = mixer_options.contains(MixerOptions::ENHANCED_RESAMPLING);
    let log_volume = mixer_options.contains(MixerOptions::LOG_VOLUME);
    let handles: Vec<VoiceHandle> = mdi.active_voices.clone();

    let mut left_sum = 0i64;
    let mut right_sum = 0i64;

    for handle in handles {
        let ch = handle.channel as usize;
        let key = handle.key as usize;
        let slot = handle.slot as usize;

        let is_drum = mdi.channels[ch].is_drum;
        let hold = mdi.channels[ch].hold;

        let NoteSlot::Active(note) = &mut mdi.note_table[ch][key][slot] else {
            continue;
        };

        let patch = note.patch.clone();
        let sample = &patch.samples[note.sample_index];

        let raw = resample::resample(&sample.data, note.sample_pos, enhanced);
        let env_scaled = (raw as i64 * note.env_level as i64) / ENV_LEVEL_MAX as i64;
        left_sum += (env_scaled * note.left_mix_volume as i64) / 1024;
        right_sum += (env_scaled * note.right_mix_volume as i64) / 1024;

        note.sample_pos += note.sample_inc as u64;
        let looping = sample.modes.contains(SampleModes::LOOP);
        let mut finished = false;
        if looping && note.sample_pos >= sample.loop_end as u64 {
            let size = sample.loop_size.max(1) as u64;
            let start = sample.loop_start as u64;
            note.sample_pos = start + (note.sample_pos - start) % size;
        } else if !looping && note.sample_pos >= sample.data_length as u64 {
            finished = true;
        }

        if finished {
            voice::terminate_voice(mdi, sample_rate, log_volume, handle.channel, handle.key, handle.slot);
            continue;
        }

        let outcome = envelope::advance(note, sample);
        match outcome {
            EnvelopeOutcome::Terminate => {
                voice::terminate_voice(mdi, sample_rate, log_volume, handle.channel, handle.key, handle.slot);
            }
            EnvelopeOutcome::DeferredNoteOff => {
                voice::apply_deferred_note_off(note, is_drum, hold);
            }
            EnvelopeOutcome::Continue => {}
        }
    }

    if mixer_options.contains(MixerOptions::REVERB) {
        let mut left = left_sum as i32;
        let mut right = right_sum as i32;
        mdi.reverb.process_frame(&mut left, &mut right);
        return (left, right);
    }

    (left_sum as i32, right_sum as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdi::{ActiveNote, NoteSlot};
    use crate::patch::Patch;
    use crate::reverb::Reverb;
    use std::sync::Arc;

    fn looping_sample() -> crate::patch::Sample {
        crate::patch::Sample {
            data: vec![1000; 8],
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
            modes: SampleModes::LOOP | SampleModes::ENVELOPE,
            env_rate: [1_000_000, 1_000_000, 1_000_000, 1, 1_000_000, 1_000_000, 1_000_000],
            env_target: [ENV_LEVEL_MAX, ENV_LEVEL_MAX, ENV_LEVEL_MAX, ENV_LEVEL_MAX, 0, 0, 0],
            note_off_decay: 0,
        }
    }

    #[test]
    fn looping_voice_renders_nonzero_and_wraps_position() {
        let mut mdi = Mdi::new(44100, Reverb::new(44100, Default::default()));
        let patch = Arc::new(Patch {
            program: 0,
            bank_byte: 0,
            forced_note: None,
            samples: vec![looping_sample()],
        });
        mdi.channels[0].patch = Some(patch.clone());
        let note = ActiveNote {
            velocity: 127,
            patch,
            sample_index: 0,
            sample_pos: 0,
            sample_inc: 1 << 10,
            env_level: ENV_LEVEL_MAX,
            env_inc: 0,
            env_stage: 2,
            modes: SampleModes::LOOP | SampleModes::ENVELOPE,
            hold_off: false,
            is_off: false,
            ignore_chan_events: false,
            left_mix_volume: 1024,
            right_mix_volume: 1024,
            replay: None,
        };
        mdi.note_table[0][60][0] = NoteSlot::Active(Box::new(note));
        mdi.active_voices.push(VoiceHandle { channel: 0, key: 60, slot: 0 });

        let mut opts = MixerOptions::empty();
        let (l, r) = render_frame(&mut mdi, 44100, opts);
        assert_ne!(l, 0);
        assert_ne!(r, 0);

        for _ in 0..20 {
            render_frame(&mut mdi, 44100, opts);
        }
        let NoteSlot::Active(note) = &mdi.note_table[0][60][0] else {
            panic!("voice should still be active (looping)")
        };
        assert!(note.sample_pos < looping_sample().data_length as u64);
        opts = MixerOptions::REVERB;
        render_frame(&mut mdi, 44100, opts);
    }

    #[test]
    fn non_looping_voice_terminates_and_frees_slot() {
        let mut mdi = Mdi::new(44100, Reverb::new(44100, Default::default()));
        let mut sample = looping_sample();
        sample.modes -= SampleModes::LOOP;
        sample.data_length = 4 << 10;
        let patch = Arc::new(Patch {
            program: 0,
            bank_byte: 0,
            forced_note: None,
            samples: vec![sample.clone()],
        });
        let note = ActiveNote {
            velocity: 127,
            patch,
            sample_index: 0,
            sample_pos: 3 << 10,
            sample_inc: 1 << 10,
            env_level: 0,
            env_inc: 0,
            env_stage: 6,
            modes: sample.modes,
            hold_off: false,
            is_off: false,
            ignore_chan_events: false,
            left_mix_volume: 1024,
            right_mix_volume: 1024,
            replay: None,
        };
        mdi.note_table[0][60][0] = NoteSlot::Active(Box::new(note));
        mdi.active_voices.push(VoiceHandle { channel: 0, key: 60, slot: 0 });

        render_frame(&mut mdi, 44100, MixerOptions::empty());
        assert!(!mdi.note_table[0][60][0].is_active());
        assert!(mdi.active_voices.is_empty());
    }
}
