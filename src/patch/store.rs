//! Patch table: loads `.pat` files named by an `EngineConfig`'s directives, keeps them
//! resident for the lifetime of an `Engine`, and resolves program/bank/note lookups.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{AutoAmpMode, EngineConfig, PatchDirective};
use crate::error::{GusMidiError, Result};
use crate::patch::pat_format::parse_pat;
use crate::patch::sample::{Sample, SampleModes};

/// One loaded `.pat` file: every pitch-range sample it contains, plus the directive-level
/// overrides that were folded in while loading.
#[derive(Debug, Clone)]
pub struct Patch {
    /// MIDI program number.
    pub program: u8,
    /// Bank/drum identity byte this patch was registered under.
    pub bank_byte: u8,
    /// Forced note override, if the directive set `note=`.
    pub forced_note: Option<u8>,
    /// Decoded pitch-range samples, in file order.
    pub samples: Vec<Sample>,
}

impl Patch {
    /// Picks the first sample whose `[freq_low, freq_high]` range covers `freq_millihertz`;
    /// if none brackets it, falls back to the sample with the highest `freq_low` seen, in
    /// file order (matches the reference loader's linear scan-and-remember fallback).
    pub fn sample_for_frequency(&self, freq_millihertz: u32) -> Option<&Sample> {
        self.sample_index_for_frequency(freq_millihertz)
            .map(|i| &self.samples[i])
    }

    /// Same selection as `sample_for_frequency`, returning the index instead of the
    /// sample itself so callers (voice allocation) can store it on the active note
    /// without borrowing the patch for the note's lifetime.
    pub fn sample_index_for_frequency(&self, freq_millihertz: u32) -> Option<usize> {
        if let Some(bracketed) = self
            .samples
            .iter()
            .position(|s| freq_millihertz >= s.freq_low && freq_millihertz <= s.freq_high)
        {
            return Some(bracketed);
        }
        self.samples
            .iter()
            .enumerate()
            .fold(None, |best, (i, s)| match best {
                None => Some(i),
                Some(b) if s.freq_low > self.samples[b].freq_low => Some(i),
                Some(b) => Some(b),
            })
    }
}

/// Thread-safe table of loaded patches, keyed by `(bank_byte, program)`.
pub struct PatchStore {
    patches: RwLock<HashMap<(u8, u8), Arc<Patch>>>,
}

impl PatchStore {
    /// Loads every directive in `config`, applying its per-directive overrides, and
    /// returns the populated store. A directive whose `.pat` file fails to load is
    /// reported immediately rather than silently skipped.
    pub fn load(config: &EngineConfig) -> Result<Self> {
        let store = PatchStore {
            patches: RwLock::new(HashMap::new()),
        };
        for directive in &config.directives {
            store.load_directive(directive, config)?;
        }
        Ok(store)
    }

    fn load_directive(&self, directive: &PatchDirective, config: &EngineConfig) -> Result<()> {
        let mut samples = load_pat_file(
            &directive.path,
            config.quirks.fix_release_time,
            config.sample_rate,
        )?;

        for sample in &mut samples {
            apply_directive_overrides(sample, directive, config.sample_rate);
        }
        if let AutoAmpMode::Auto | AutoAmpMode::AutoWithAmp = config.quirks.auto_amp {
            for sample in &mut samples {
                auto_amplify(sample, config.quirks.auto_amp, directive.amp);
            }
        }

        let patch = Arc::new(Patch {
            program: directive.program,
            bank_byte: directive.bank_byte,
            forced_note: directive.note,
            samples,
        });
        self.patches
            .write()
            .insert((directive.bank_byte, directive.program), patch);
        Ok(())
    }

    /// Looks up a patch by bank and program, falling back to bank 0 if the requested
    /// bank has no entry for that program (matches the reference library's bank
    /// fallback behaviour).
    pub fn get_patch(&self, bank_byte: u8, program: u8) -> Option<Arc<Patch>> {
        let table = self.patches.read();
        table
            .get(&(bank_byte, program))
            .or_else(|| table.get(&(0, program)))
            .cloned()
    }

    /// Number of distinct `(bank, program)` entries currently loaded.
    pub fn len(&self) -> usize {
        self.patches.read().len()
    }

    /// True if no patches have been loaded.
    pub fn is_empty(&self) -> bool {
        self.patches.read().is_empty()
    }
}

fn load_pat_file(path: &Path, fix_release: bool, sample_rate: u32) -> Result<Vec<Sample>> {
    let data = std::fs::read(path)
        .map_err(|e| GusMidiError::Load(format!("{}: {e}", path.display())))?;
    parse_pat(&data, fix_release, sample_rate)
}

fn apply_directive_overrides(sample: &mut Sample, directive: &PatchDirective, sample_rate: u32) {
    if let Some(amp) = directive.amp {
        scale_amplitude(sample, amp);
    }
    if directive.keep_loop {
        // Loop bit is intentionally preserved even if the envelope/auto-amp pass would
        // otherwise have cleared it; nothing to do here since decode never clears LOOP.
    }
    if directive.remove_sustain {
        sample.modes -= SampleModes::SUSTAIN;
    }
    if directive.remove_clamped {
        sample.modes -= SampleModes::CLAMPED;
    }
    for (stage, ov) in directive.env_overrides.iter().enumerate() {
        if let Some(level) = ov.level {
            sample.env_target[stage] = (level * crate::tables::ENV_LEVEL_MAX as f32) as i32;
        }
        if let Some(time) = ov.time {
            let rate = (crate::tables::ENV_LEVEL_MAX as f32 / (time * sample_rate as f32)).ceil();
            sample.env_rate[stage] = rate.max(1.0) as i32;
        }
    }
}

fn scale_amplitude(sample: &mut Sample, amp_fixed: u16) {
    let scale = amp_fixed as i32;
    for s in sample.data.iter_mut() {
        let scaled = (*s as i32 * scale) >> 10;
        *s = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

fn auto_amplify(sample: &mut Sample, mode: AutoAmpMode, directive_amp: Option<u16>) {
    let peak = sample.data.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    if peak == 0 {
        return;
    }
    let mut scale = i16::MAX as i64 * 1024 / peak as i64;
    if matches!(mode, AutoAmpMode::AutoWithAmp) {
        if let Some(amp) = directive_amp {
            scale = scale * amp as i64 / 1024;
        }
    }
    for s in sample.data.iter_mut() {
        let scaled = (*s as i64 * scale) >> 10;
        *s = scaled.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
    }
}
