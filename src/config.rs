//! Engine configuration: mixer options, room geometry, and the `timidity.cfg`-dialect
//! patch directory parser.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{GusMidiError, Result};

bitflags! {
    /// Mixer behaviour flags, settable at `Engine::new` time and (a subset) per-`Song`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MixerOptions: u32 {
        /// Use the logarithmic (dBm table) volume path instead of the linear one.
        const LOG_VOLUME          = 0x0001;
        /// Use the 34-point Gauss/Newton resampler instead of linear interpolation.
        const ENHANCED_RESAMPLING = 0x0002;
        /// Run the six-comb-plus-allpass reverb on the mixed signal.
        const REVERB              = 0x0004;
        /// Loop back to the start of the MDI on EndOfTrack instead of stopping.
        const LOOP                = 0x0008;
        /// Emit a single merged Type-0 MTrk from the writer instead of per-track Type-2.
        const SAVEASTYPE0          = 0x0010;
        /// Round tempo-derived floats to the nearest integer before use.
        const ROUNDTEMPO           = 0x0020;
        /// Strip leading/trailing silence when rendering (not implemented by the core
        /// engine; reserved for a caller-side post-process, kept for API parity).
        const STRIPSILENCE         = 0x0040;
        /// Route MIDI Text meta events into the lyric slot instead of discarding them.
        const TEXTASLYRIC          = 0x0080;
    }
}

impl Default for MixerOptions {
    fn default() -> Self {
        MixerOptions::REVERB
    }
}

/// Room geometry driving the reverb's comb-filter delay lengths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoomGeometry {
    /// Room width in metres, clamped to `[1, 100]`.
    pub width: f32,
    /// Room length in metres, clamped to `[1, 100]`.
    pub length: f32,
    /// Listener X position in metres, clamped to `[0, width]`.
    pub listener_x: f32,
    /// Listener Y position in metres, clamped to `[0, length]`.
    pub listener_y: f32,
}

impl Default for RoomGeometry {
    fn default() -> Self {
        RoomGeometry {
            width: 20.0,
            length: 26.0,
            listener_x: 10.0,
            listener_y: 13.0,
        }
    }
}

impl RoomGeometry {
    fn clamp(mut self) -> Self {
        self.width = self.width.clamp(1.0, 100.0);
        self.length = self.length.clamp(1.0, 100.0);
        self.listener_x = self.listener_x.clamp(0.0, self.width);
        self.listener_y = self.listener_y.clamp(0.0, self.length);
        self
    }
}

/// Governs how a patch's fixed release-time heuristic (§4.1 step 2) behaves for
/// author-misordered `.pat` files, and whether peak-based auto-amplification runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuirksConfig {
    /// `guspat_editor_author_cant_read_so_fix_release_time_for_me` directive.
    pub fix_release_time: bool,
    /// `auto_amp` / `auto_amp_with_amp` directive.
    pub auto_amp: AutoAmpMode,
}

/// Peak-based auto-amplification mode selected by the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoAmpMode {
    /// No automatic amplitude scaling.
    #[default]
    Off,
    /// Scale each sample so its peak reaches full scale.
    Auto,
    /// Scale each sample so its peak reaches full scale, then apply the patch's `amp=`.
    AutoWithAmp,
}

/// One resolved patch directory entry, produced while parsing the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchDirective {
    /// MIDI program number (0-127) this directive defines.
    pub program: u8,
    /// Patch identity bank/drum byte in effect when this directive was read.
    pub bank_byte: u8,
    /// Resolved `.pat` file path (directory-qualified, `.pat` suffix guaranteed).
    pub path: PathBuf,
    /// `amp=` option, pre-scaled to the 10-bit fixed representation (1024 == unity).
    pub amp: Option<u16>,
    /// `note=` option: forced MIDI note override.
    pub note: Option<u8>,
    /// `env_timeN=` / `env_levelN=` overrides, indexed 0..6, each with a two-bit set mask
    /// (bit 0 = time set, bit 1 = level set).
    pub env_overrides: [EnvOverride; 6],
    /// `keep=loop` / `keep=env`.
    pub keep_loop: bool,
    /// `keep=env`.
    pub keep_env: bool,
    /// `remove=sustain`.
    pub remove_sustain: bool,
    /// `remove=clamped`.
    pub remove_clamped: bool,
}

/// A single envelope stage override parsed from `env_timeN=`/`env_levelN=`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvOverride {
    /// Overridden time in seconds, clamped to `[1.47, 45000]`; `None` if unset or rejected.
    pub time: Option<f32>,
    /// Overridden level fraction in `[0, 1]`; `None` if unset.
    pub level: Option<f32>,
}

impl EnvOverride {
    /// Two-bit set mask: bit 0 = time set, bit 1 = level set.
    pub fn set_mask(&self) -> u8 {
        (self.time.is_some() as u8) | ((self.level.is_some() as u8) << 1)
    }
}

/// Top-level engine configuration: sample rate, mixer options, patch search results and
/// reverb geometry. Built either from a config file (`from_file`) or programmatically.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Output sample rate in Hz, constrained to `11025..=65535`.
    pub sample_rate: u32,
    /// Mixer option bitflags.
    pub mixer_options: MixerOptions,
    /// Reverb room geometry.
    pub reverb_room: RoomGeometry,
    /// Loader quirk flags.
    pub quirks: QuirksConfig,
    /// Patch directives discovered while parsing the config file, in file order.
    pub directives: Vec<PatchDirective>,
}

impl EngineConfig {
    /// Builds a configuration with no patches defined, for programmatic patch registration.
    pub fn new(sample_rate: u32) -> Result<Self> {
        if !(11025..=65535).contains(&sample_rate) {
            return Err(GusMidiError::InvalidArg(format!(
                "sample_rate {sample_rate} out of range 11025..=65535"
            )));
        }
        Ok(EngineConfig {
            sample_rate,
            mixer_options: MixerOptions::default(),
            reverb_room: RoomGeometry::default(),
            quirks: QuirksConfig::default(),
            directives: Vec::new(),
        })
    }

    /// Sets the mixer options, replacing any previous value.
    pub fn with_mixer_options(mut self, options: MixerOptions) -> Self {
        self.mixer_options = options;
        self
    }

    /// Parses a `timidity.cfg`-dialect configuration file, recursively following `source`
    /// directives relative to the directory of the file that names them.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = EngineConfig::new(44100)?;
        let mut state = ParseState::default();
        parse_config_file(path.as_ref(), &mut cfg, &mut state)?;
        Ok(cfg)
    }
}

#[derive(Default)]
struct ParseState {
    base_dir: PathBuf,
    bank_byte: u8,
}

fn parse_config_file(path: &Path, cfg: &mut EngineConfig, outer: &mut ParseState) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let mut state = ParseState {
        base_dir: path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
        bank_byte: outer.bank_byte,
    };

    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let directive = match parts.next() {
            Some(d) => d,
            None => continue,
        };

        match directive {
            "dir" => {
                if let Some(p) = parts.next() {
                    state.base_dir = resolve_path(&state.base_dir, p);
                }
            }
            "source" => {
                if let Some(p) = parts.next() {
                    let sub = resolve_path(&state.base_dir, p);
                    parse_config_file(&sub, cfg, &mut state)?;
                }
            }
            "bank" => {
                if let Some(n) = parts.next().and_then(|s| s.parse::<u8>().ok()) {
                    state.bank_byte = n & 0x7F;
                }
            }
            "drumset" => {
                if let Some(n) = parts.next().and_then(|s| s.parse::<u8>().ok()) {
                    state.bank_byte = (n & 0x7F) | 0x80;
                }
            }
            "reverb_room_width" => {
                if let Some(v) = parts.next().and_then(|s| s.parse::<f32>().ok()) {
                    cfg.reverb_room.width = v;
                    cfg.reverb_room = cfg.reverb_room.clamp();
                }
            }
            "reverb_room_length" => {
                if let Some(v) = parts.next().and_then(|s| s.parse::<f32>().ok()) {
                    cfg.reverb_room.length = v;
                    cfg.reverb_room = cfg.reverb_room.clamp();
                }
            }
            "reverb_listener_posx" => {
                if let Some(v) = parts.next().and_then(|s| s.parse::<f32>().ok()) {
                    cfg.reverb_room.listener_x = v;
                    cfg.reverb_room = cfg.reverb_room.clamp();
                }
            }
            "reverb_listener_posy" => {
                if let Some(v) = parts.next().and_then(|s| s.parse::<f32>().ok()) {
                    cfg.reverb_room.listener_y = v;
                    cfg.reverb_room = cfg.reverb_room.clamp();
                }
            }
            "guspat_editor_author_cant_read_so_fix_release_time_for_me" => {
                cfg.quirks.fix_release_time = true;
            }
            "auto_amp" => cfg.quirks.auto_amp = AutoAmpMode::Auto,
            "auto_amp_with_amp" => cfg.quirks.auto_amp = AutoAmpMode::AutoWithAmp,
            maybe_program => {
                if let Ok(program) = maybe_program.parse::<u8>() {
                    if let Some(filename) = parts.next() {
                        let directive = parse_patch_line(&state, program, filename, parts)?;
                        if let Some(existing) = cfg.directives.iter_mut().find(|d| {
                            d.program == directive.program && d.bank_byte == directive.bank_byte
                        }) {
                            *existing = directive;
                        } else {
                            cfg.directives.push(directive);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_patch_line<'a>(
    state: &ParseState,
    program: u8,
    filename: &str,
    rest: impl Iterator<Item = &'a str>,
) -> Result<PatchDirective> {
    let mut path = filename.to_string();
    if !path.to_ascii_lowercase().ends_with(".pat") {
        path.push_str(".pat");
    }
    let path = resolve_path(&state.base_dir, &path);

    let mut directive = PatchDirective {
        program,
        bank_byte: state.bank_byte,
        path,
        amp: None,
        note: None,
        env_overrides: [EnvOverride::default(); 6],
        keep_loop: false,
        keep_env: false,
        remove_sustain: false,
        remove_clamped: false,
    };

    for opt in rest {
        let Some((key, value)) = opt.split_once('=') else {
            continue;
        };
        match key {
            "amp" => {
                if let Ok(percent) = value.parse::<u32>() {
                    directive.amp = Some(((percent << 10) / 100) as u16);
                }
            }
            "note" => {
                if let Ok(n) = value.parse::<u8>() {
                    directive.note = Some(n);
                }
            }
            "keep" => match value {
                "loop" => directive.keep_loop = true,
                "env" => directive.keep_env = true,
                _ => {}
            },
            "remove" => match value {
                "sustain" => directive.remove_sustain = true,
                "clamped" => directive.remove_clamped = true,
                _ => {}
            },
            _ if key.starts_with("env_time") => {
                if let Some(idx) = key.strip_prefix("env_time").and_then(|s| s.parse::<usize>().ok())
                {
                    if idx < 6 {
                        if let Ok(secs) = value.parse::<f32>() {
                            if (1.47..=45000.0).contains(&secs) {
                                directive.env_overrides[idx].time = Some(secs);
                            }
                        }
                    }
                }
            }
            _ if key.starts_with("env_level") => {
                if let Some(idx) =
                    key.strip_prefix("env_level").and_then(|s| s.parse::<usize>().ok())
                {
                    if idx < 6 {
                        if let Ok(level) = value.parse::<f32>() {
                            directive.env_overrides[idx].level = Some(level.clamp(0.0, 1.0));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(directive)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn resolve_path(base: &Path, candidate: &str) -> PathBuf {
    let p = Path::new(candidate);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gusmidi-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_scenario_4_config_fragment() {
        let path = write_temp(
            "scenario4.cfg",
            "bank 0\n0 grandpiano amp=50 note=60 env_time0=0.1 env_level0=0.8 keep=loop\n",
        );
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.directives.len(), 1);
        let d = &cfg.directives[0];
        assert_eq!(d.program, 0);
        assert_eq!(d.bank_byte, 0);
        assert_eq!(d.amp, Some(512));
        assert_eq!(d.note, Some(60));
        assert_eq!(d.env_overrides[0].set_mask(), 0x03);
        assert!(d.keep_loop);
    }

    #[test]
    fn out_of_range_env_time_is_silently_dropped() {
        let path = write_temp("scenario7.cfg", "0 lead env_time0=9999999\n");
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.directives[0].env_overrides[0].set_mask() & 0x01, 0);
    }

    #[test]
    fn reverb_room_width_clamped_to_100() {
        let path = write_temp("scenario8.cfg", "reverb_room_width 200\n");
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.reverb_room.width, 100.0);
    }

    #[test]
    fn drumset_sets_bank_byte_with_drum_bit() {
        let path = write_temp("drumset.cfg", "drumset 0\n35 kick\n");
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.directives[0].bank_byte, 0x80);
    }

    #[test]
    fn source_directive_resolves_relative_to_including_file() {
        let dir = std::env::temp_dir().join(format!("gusmidi-test-nested-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("sub").join("inner.cfg"), "0 lead\n").unwrap();
        std::fs::write(dir.join("outer.cfg"), "source sub/inner.cfg\n").unwrap();
        let cfg = EngineConfig::from_file(dir.join("outer.cfg")).unwrap();
        assert_eq!(cfg.directives.len(), 1);
        assert!(cfg.directives[0].path.ends_with("sub/lead.pat"));
    }

    #[test]
    fn duplicate_program_in_same_bank_replaces_previous() {
        let path = write_temp("dup.cfg", "0 first\n0 second\n");
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.directives.len(), 1);
        assert!(cfg.directives[0].path.ends_with("second.pat"));
    }
}
