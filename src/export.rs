//! WAV-file export helper built on `hound`.
//!
//! Optional (`wav-export` feature): test fixtures and the bundled `gusmidi` CLI render
//! through this rather than re-implementing RIFF/WAVE header construction, the way the
//! reference decoder leaves that entirely to its audio-device back-ends and its own
//! test harness's WAV writer.
#![cfg(feature = "wav-export")]

use std::path::Path;

use crate::engine::Song;
use crate::error::Result;

/// Renders `song` from its current cursor to end of stream and writes the result as a
/// 16-bit stereo PCM WAV file at `output_path`.
pub fn export_to_wav<P: AsRef<Path>>(song: &mut Song<'_>, output_path: P) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: song.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, spec)?;

    let mut buffer = vec![0u8; 4096];
    loop {
        let produced = song.get_output(&mut buffer)?;
        if produced == 0 {
            break;
        }
        for frame in buffer[..produced].chunks_exact(4) {
            let left = i16::from_le_bytes([frame[0], frame[1]]);
            let right = i16::from_le_bytes([frame[2], frame[3]]);
            writer.write_sample(left)?;
            writer.write_sample(right)?;
        }
    }
    writer.finalize()?;
    Ok(())
}
