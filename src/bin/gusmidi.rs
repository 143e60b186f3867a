//! Demonstration CLI: load a `timidity.cfg`-dialect patch config, render a score to a
//! WAV file, and optionally re-emit it as a Standard MIDI File.
//!
//! Not part of the library surface; mirrors the reference decoder's own bare-bones
//! `main.rs` driver rather than a fully-featured player front-end (terminal UI, live
//! audio devices and command-line option parsing beyond this are explicitly out of
//! scope, per spec.md §1).

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use gusmidi::{Engine, EngineConfig};

struct Args {
    config: PathBuf,
    input: PathBuf,
    output: PathBuf,
    to_midi: Option<PathBuf>,
    reverb: bool,
    enhanced: bool,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut input = None;
    let mut output = None;
    let mut to_midi = None;
    let mut reverb = false;
    let mut enhanced = false;

    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(it.next().context("--config needs a path")?)),
            "--out" => output = Some(PathBuf::from(it.next().context("--out needs a path")?)),
            "--to-midi" => to_midi = Some(PathBuf::from(it.next().context("--to-midi needs a path")?)),
            "--reverb" => reverb = true,
            "--enhanced" => enhanced = true,
            other if input.is_none() => input = Some(PathBuf::from(other)),
            other => bail!("unrecognized argument: {other}"),
        }
    }

    Ok(Args {
        config: config.unwrap_or_else(|| PathBuf::from("timidity.cfg")),
        input: input.context("usage: gusmidi [--config timidity.cfg] [--out out.wav] [--to-midi out.mid] [--reverb] [--enhanced] <input>")?,
        output: output.unwrap_or_else(|| PathBuf::from("out.wav")),
        to_midi,
        reverb,
        enhanced,
    })
}

fn run() -> Result<()> {
    let args = parse_args()?;

    let config = EngineConfig::from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let engine = Engine::new(config).context("initializing engine")?;
    let mut song = engine
        .open_file(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;

    song.set_option(gusmidi::MixerOptions::REVERB, args.reverb);
    song.set_option(gusmidi::MixerOptions::ENHANCED_RESAMPLING, args.enhanced);

    if let Some(midi_path) = &args.to_midi {
        let bytes = song.convert_to_midi().context("converting to MIDI")?;
        std::fs::write(midi_path, &bytes)
            .with_context(|| format!("writing {}", midi_path.display()))?;
    }

    gusmidi::export_to_wav(&mut song, &args.output)
        .with_context(|| format!("rendering {}", args.output.display()))?;

    let info = song.get_info();
    eprintln!(
        "rendered {} of {} samples ({} ms) to {}",
        info.current_sample,
        info.approx_total_samples,
        info.total_midi_time_ms,
        args.output.display()
    );

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gusmidi: {err:#}");
            ExitCode::FAILURE
        }
    }
}
