//! GUS `.pat` binary decoder: header validation, per-sample descriptor parsing, PCM
//! decoding for all sixteen (8/16-bit x signed/unsigned x linear/reverse/ping-pong)
//! encodings, and the canonicalisation steps of SPEC_FULL.md §4.1.

use nom::bytes::complete::{tag, take};
use nom::number::complete::{le_u16, le_u32, u8 as nom_u8};
use nom::IResult;

use crate::error::{GusMidiError, Result};
use crate::patch::sample::{Sample, SampleModes};
use crate::tables::{ENV_TIME_FALLBACK_INDEX, ENV_TIME_TABLE, ENV_LEVEL_MAX};

const HEADER_LEN: usize = 239;
const DESCRIPTOR_LEN: usize = 96;

/// Parses a whole `.pat` file buffer into its chain of samples. `sample_rate` is the
/// engine's configured output rate, used (per SPEC_FULL.md §4.1 step 4) to convert each
/// envelope stage's ramp time into a per-sample rate.
pub fn parse_pat(data: &[u8], fix_release: bool, sample_rate: u32) -> Result<Vec<Sample>> {
    if data.len() < HEADER_LEN {
        return Err(GusMidiError::Corrupt("gus pat: file too short".into()));
    }
    validate_header(data)?;

    let no_of_samples = data[198];
    if no_of_samples == 0 {
        return Err(GusMidiError::Invalid("gus pat: no samples".into()));
    }

    let mut samples = Vec::with_capacity(no_of_samples as usize);
    let mut ofs = HEADER_LEN;
    for _ in 0..no_of_samples {
        let (sample, consumed) = parse_one_sample(data, ofs, fix_release, sample_rate)?;
        samples.push(sample);
        ofs += consumed;
    }
    Ok(samples)
}

fn validate_header(data: &[u8]) -> Result<()> {
    fn header_tag(input: &[u8]) -> IResult<&[u8], &[u8]> {
        let (input, _) = tag(b"GF1PATCH1")(input)?;
        let (input, _) = nom::branch::alt((tag(b"10"), tag(b"00")))(input)?;
        let (input, magic) = take(12usize)(input)?;
        Ok((input, magic))
    }

    match header_tag(&data[..22]) {
        Ok((_, magic)) if magic == b"\0ID#000002\0" => Ok(()),
        _ => Err(GusMidiError::Invalid(
            "gus pat: unrecognised header magic".into(),
        )),
    }?;

    if data[82] > 1 {
        return Err(GusMidiError::Invalid(
            "gus pat: more than one instrument".into(),
        ));
    }
    if data[151] > 1 {
        return Err(GusMidiError::Invalid("gus pat: more than one layer".into()));
    }
    Ok(())
}

fn descriptor_fields(input: &[u8]) -> IResult<&[u8], RawDescriptor> {
    let (input, _name) = take(7usize)(input)?;
    let (input, loop_fraction) = nom_u8(input)?;
    let (input, data_length) = le_u32(input)?;
    let (input, loop_start) = le_u32(input)?;
    let (input, loop_end) = le_u32(input)?;
    let (input, rate) = le_u16(input)?;
    let (input, freq_low) = le_u32(input)?;
    let (input, freq_high) = le_u32(input)?;
    let (input, freq_root) = le_u32(input)?;
    let (input, _tune) = take(2usize)(input)?;
    let (input, _balance) = nom_u8(input)?;
    let (input, env_rates) = take(6usize)(input)?;
    let (input, env_levels) = take(6usize)(input)?;
    let (input, _tremolo_vibrato) = take(6usize)(input)?;
    let (input, modes) = nom_u8(input)?;
    Ok((
        input,
        RawDescriptor {
            loop_fraction,
            data_length,
            loop_start,
            loop_end,
            rate,
            freq_low,
            freq_high,
            freq_root,
            env_rates: [
                env_rates[0],
                env_rates[1],
                env_rates[2],
                env_rates[3],
                env_rates[4],
                env_rates[5],
            ],
            env_levels: [
                env_levels[0],
                env_levels[1],
                env_levels[2],
                env_levels[3],
                env_levels[4],
                env_levels[5],
            ],
            modes,
        },
    ))
}

struct RawDescriptor {
    loop_fraction: u8,
    data_length: u32,
    loop_start: u32,
    loop_end: u32,
    rate: u16,
    freq_low: u32,
    freq_high: u32,
    freq_root: u32,
    env_rates: [u8; 6],
    env_levels: [u8; 6],
    modes: u8,
}

fn parse_one_sample(
    data: &[u8],
    ofs: usize,
    fix_release: bool,
    sample_rate: u32,
) -> Result<(Sample, usize)> {
    if ofs + DESCRIPTOR_LEN > data.len() {
        return Err(GusMidiError::Corrupt(
            "gus pat: truncated sample descriptor".into(),
        ));
    }
    let (_, mut raw) = descriptor_fields(&data[ofs..ofs + DESCRIPTOR_LEN])
        .map_err(|_| GusMidiError::Corrupt("gus pat: malformed descriptor".into()))?;

    if fix_release {
        apply_release_time_heuristic(&mut raw.env_rates);
    }

    let pcm_start = ofs + DESCRIPTOR_LEN;
    let pcm_end = pcm_start
        .checked_add(raw.data_length as usize)
        .ok_or_else(|| GusMidiError::Corrupt("gus pat: sample length overflow".into()))?;
    if pcm_end > data.len() {
        return Err(GusMidiError::Corrupt(
            "gus pat: sample data runs past end of file".into(),
        ));
    }
    let raw_pcm = &data[pcm_start..pcm_end];

    let modes = SampleModes::from_bits_truncate(raw.modes & 0x7F);

    let mut loop_start = raw.loop_start;
    let mut loop_end = raw.loop_end;
    let mut loop_fraction = raw.loop_fraction;
    if loop_start > loop_end {
        std::mem::swap(&mut loop_start, &mut loop_end);
        loop_fraction = swap_nibbles(loop_fraction);
    }

    let sixteen_bit = modes.contains(SampleModes::SIXTEEN_BIT);
    let unsigned = modes.contains(SampleModes::UNSIGNED);
    let reverse = modes.contains(SampleModes::REVERSE);
    let pingpong = modes.contains(SampleModes::PINGPONG);

    let mut pcm = decode_raw_pcm(raw_pcm, sixteen_bit, unsigned);
    let mut data_length = pcm.len() as u32;

    if reverse {
        pcm.reverse();
        let new_end = data_length - loop_start;
        let new_start = data_length - loop_end;
        loop_start = new_start;
        loop_end = new_end;
        loop_fraction = swap_nibbles(loop_fraction);
    }

    if pingpong {
        let loop_length = loop_end - loop_start;
        pcm = expand_pingpong(&pcm, loop_start as usize, loop_end as usize);
        loop_start += loop_length;
        loop_end += loop_length * 2;
        data_length += loop_length * 2;
    }

    let canonical_modes = modes
        - SampleModes::SIXTEEN_BIT
        - SampleModes::UNSIGNED
        - SampleModes::REVERSE
        - SampleModes::PINGPONG;

    let inc_div = ((raw.freq_root as u64 * 512) / raw.rate.max(1) as u64 * 2) as u32;

    let (env_rate, env_target) =
        compute_envelope(&raw.env_rates, &raw.env_levels, canonical_modes, sample_rate);

    let note_off_decay = compute_note_off_decay(&env_rate, canonical_modes);

    let sample = Sample {
        data: pcm,
        data_length: data_length << 10,
        loop_start: (loop_start << 10) | ((u32::from(loop_fraction & 0x0F) << 10) / 16),
        loop_end: (loop_end << 10) | ((u32::from((loop_fraction & 0xF0) >> 4) << 10) / 16),
        loop_size: 0,
        loop_fraction,
        rate: raw.rate,
        freq_low: raw.freq_low,
        freq_high: raw.freq_high,
        freq_root: raw.freq_root,
        inc_div,
        modes: canonical_modes,
        env_rate,
        env_target,
        note_off_decay,
    };
    let mut sample = sample;
    sample.loop_size = sample.loop_end.saturating_sub(sample.loop_start);

    Ok((sample, DESCRIPTOR_LEN + raw.data_length as usize))
}

fn swap_nibbles(b: u8) -> u8 {
    ((b & 0x0F) << 4) | ((b & 0xF0) >> 4)
}

fn decode_raw_pcm(raw: &[u8], sixteen_bit: bool, unsigned: bool) -> Vec<i16> {
    if sixteen_bit {
        raw.chunks_exact(2)
            .map(|c| {
                let v = i16::from_le_bytes([c[0], c[1]]);
                if unsigned {
                    v ^ i16::MIN
                } else {
                    v
                }
            })
            .collect()
    } else {
        raw.iter()
            .map(|&b| {
                let v = (b as i16) << 8;
                if unsigned {
                    v ^ i16::MIN
                } else {
                    v
                }
            })
            .collect()
    }
}

/// Expands a looped buffer into a straight-play forward + reverse + forward-tail buffer,
/// matching the reference decoder's `convert_*p`/`convert_*rp` family.
fn expand_pingpong(pcm: &[i16], loop_start: usize, loop_end: usize) -> Vec<i16> {
    let mut out = Vec::with_capacity(pcm.len() + (loop_end - loop_start) * 2);
    out.extend_from_slice(&pcm[..loop_start]);
    out.extend_from_slice(&pcm[loop_start..loop_end]);
    let mut mirrored: Vec<i16> = pcm[loop_start..loop_end].to_vec();
    mirrored.reverse();
    out.extend_from_slice(&mirrored);
    out.extend_from_slice(&pcm[loop_end..]);
    out
}

fn apply_release_time_heuristic(env_rates: &mut [u8; 6]) {
    let t = |i: usize| ENV_TIME_TABLE[env_rates[i] as usize];
    let (r0, r1, r2) = (3, 4, 5); // file offsets 40, 41, 42 map to env indices 3, 4, 5
    if t(r0) < t(r1) {
        if t(r1) < t(r2) {
            // 1 2 3
            env_rates.swap(r0, r2);
        } else if t(r1) == t(r2) {
            // 1 2 2
            let tmp = env_rates[r0];
            env_rates[r0] = env_rates[r2];
            env_rates[r1] = env_rates[r2];
            env_rates[r2] = tmp;
        } else if t(r0) < t(r2) {
            // 1 3 2
            let tmp = env_rates[r0];
            env_rates[r0] = env_rates[r1];
            env_rates[r1] = env_rates[r2];
            env_rates[r2] = tmp;
        } else {
            // 2 3 1 or 1 2 1
            env_rates.swap(r0, r1);
        }
    } else if t(r1) < t(r2) {
        if t(r0) < t(r2) {
            // 2 1 3
            let tmp = env_rates[r0];
            env_rates[r0] = env_rates[r2];
            env_rates[r2] = env_rates[r1];
            env_rates[r1] = tmp;
        } else {
            // 3 1 2
            env_rates.swap(r1, r2);
        }
    }
}

fn compute_envelope(
    env_rates: &[u8; 6],
    env_levels: &[u8; 6],
    modes: SampleModes,
    sample_rate: u32,
) -> ([i32; 7], [i32; 7]) {
    let mut rate = [0i32; 7];
    let mut target = [0i32; 7];
    let has_envelope = modes.contains(SampleModes::ENVELOPE);

    for i in 0..6 {
        if has_envelope {
            let time = ENV_TIME_TABLE[env_rates[i] as usize];
            let mut r = if time > 0.0 {
                (ENV_LEVEL_MAX as f64 / (sample_rate as f64 * time as f64)).ceil() as i32
            } else {
                0
            };
            if r == 0 {
                r = fallback_rate(sample_rate);
            }
            rate[i] = r;
            target[i] = 16448 * env_levels[i] as i32;
        } else {
            rate[i] = fallback_rate(sample_rate);
            target[i] = ENV_LEVEL_MAX;
        }
    }
    // Stage 6: synthetic fast-release kill.
    rate[6] = fallback_rate(sample_rate);
    target[6] = 0;

    (rate, target)
}

fn fallback_rate(sample_rate: u32) -> i32 {
    (ENV_LEVEL_MAX as f64 / (sample_rate as f64 * ENV_TIME_TABLE[ENV_TIME_FALLBACK_INDEX] as f64))
        .ceil() as i32
}

fn compute_note_off_decay(env_rate: &[i32; 7], modes: SampleModes) -> u32 {
    let stage_frames = |stage: usize| -> u32 {
        if env_rate[stage] <= 0 {
            0
        } else {
            (ENV_LEVEL_MAX as u32).div_ceil(env_rate[stage] as u32)
        }
    };
    let mut total = 0u32;
    if modes.contains(SampleModes::CLAMPED) {
        total += stage_frames(5);
    } else if modes.contains(SampleModes::SUSTAIN) {
        total += stage_frames(3) + stage_frames(4) + stage_frames(5);
    } else {
        total += stage_frames(4) + stage_frames(5);
    }
    total += stage_frames(6);
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_pat(no_of_samples: u8, sample_descriptors: &[(Vec<u8>, [u8; 96])]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[..13].copy_from_slice(b"GF1PATCH110\0I");
        buf[13..22].copy_from_slice(b"D#000002");
        buf[82] = 0;
        buf[151] = 0;
        buf[198] = no_of_samples;
        for (pcm, descriptor) in sample_descriptors {
            buf.extend_from_slice(descriptor);
            buf.extend_from_slice(pcm);
        }
        buf
    }

    fn descriptor(
        data_length: u32,
        loop_start: u32,
        loop_end: u32,
        rate: u16,
        modes: u8,
        env_rates: [u8; 6],
        env_levels: [u8; 6],
    ) -> [u8; 96] {
        let mut d = [0u8; 96];
        d[8..12].copy_from_slice(&data_length.to_le_bytes());
        d[12..16].copy_from_slice(&loop_start.to_le_bytes());
        d[16..20].copy_from_slice(&loop_end.to_le_bytes());
        d[20..22].copy_from_slice(&rate.to_le_bytes());
        d[22..26].copy_from_slice(&60_000_000u32.to_le_bytes());
        d[26..30].copy_from_slice(&80_000_000u32.to_le_bytes());
        d[30..34].copy_from_slice(&60_000_000u32.to_le_bytes());
        d[37..43].copy_from_slice(&env_rates);
        d[43..49].copy_from_slice(&env_levels);
        d[55] = modes;
        d
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[..4].copy_from_slice(b"NOPE");
        let err = parse_pat(&buf, false, 44100).unwrap_err();
        assert!(matches!(err, GusMidiError::Invalid(_)));
    }

    #[test]
    fn rejects_too_short_file() {
        let err = parse_pat(&[0u8; 10], false, 44100).unwrap_err();
        assert!(matches!(err, GusMidiError::Corrupt(_)));
    }

    #[test]
    fn rejects_zero_samples() {
        let buf = build_minimal_pat(0, &[]);
        let err = parse_pat(&buf, false, 44100).unwrap_err();
        assert!(matches!(err, GusMidiError::Invalid(_)));
    }

    #[test]
    fn decodes_8bit_signed_plain_sample() {
        let pcm = vec![0x01, 0x02, 0x7F, 0x80u8];
        let desc = descriptor(4, 1, 3, 44100, 0, [10; 6], [64; 6]);
        let buf = build_minimal_pat(1, &[(pcm, desc)]);
        let samples = parse_pat(&buf, false, 44100).unwrap();
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.data, vec![0x0100, 0x0200, 0x7F00, -32768i16.wrapping_sub(0) as i16]);
        assert!(!s.modes.contains(SampleModes::SIXTEEN_BIT));
    }

    #[test]
    fn decodes_8bit_unsigned_sample() {
        let pcm = vec![0x00, 0x80, 0xFF];
        let desc = descriptor(3, 0, 2, 44100, 0x02, [10; 6], [64; 6]);
        let buf = build_minimal_pat(1, &[(pcm, desc)]);
        let samples = parse_pat(&buf, false, 44100).unwrap();
        let s = &samples[0];
        // 0x00^0x80 = 0x80 -> signed byte -128 -> << 8  == i16::MIN
        assert_eq!(s.data[0], i16::MIN);
        assert!(!s.modes.contains(SampleModes::UNSIGNED));
    }

    #[test]
    fn pingpong_expansion_mirrors_loop_region() {
        let pcm = vec![1i16, 2, 3, 4, 5];
        let expanded = expand_pingpong(&pcm, 1, 4);
        // prefix [1], loop forward [2,3,4], mirrored [4,3,2], tail [5]
        assert_eq!(expanded, vec![1, 2, 3, 4, 4, 3, 2, 5]);
    }

    #[test]
    fn reverse_swaps_loop_points_around_data_length() {
        let pcm = vec![0x10u8, 0x20, 0x30, 0x40];
        let desc = descriptor(4, 1, 3, 44100, 0x10, [10; 6], [64; 6]);
        let buf = build_minimal_pat(1, &[(pcm, desc)]);
        let samples = parse_pat(&buf, false, 44100).unwrap();
        let s = &samples[0];
        assert!(!s.modes.contains(SampleModes::REVERSE));
        // data_length=4, old loop_start=1 old loop_end=3 -> new_start=4-3=1, new_end=4-1=3
        assert_eq!(s.loop_start >> 10, 1);
        assert_eq!(s.loop_end >> 10, 3);
    }

    #[test]
    fn envelope_with_no_envelope_bit_uses_fallback_full_scale() {
        let pcm = vec![0u8; 4];
        let desc = descriptor(4, 0, 4, 44100, 0, [10; 6], [64; 6]);
        let buf = build_minimal_pat(1, &[(pcm, desc)]);
        let samples = parse_pat(&buf, false, 44100).unwrap();
        let s = &samples[0];
        for i in 0..6 {
            assert_eq!(s.env_target[i], ENV_LEVEL_MAX);
        }
    }

    #[test]
    fn envelope_with_envelope_bit_uses_level_and_rate_bytes() {
        let pcm = vec![0u8; 4];
        let desc = descriptor(4, 0, 4, 44100, 0x40, [30; 6], [32; 6]);
        let buf = build_minimal_pat(1, &[(pcm, desc)]);
        let samples = parse_pat(&buf, false, 44100).unwrap();
        let s = &samples[0];
        assert_eq!(s.env_target[0], 16448 * 32);
        assert!(s.env_rate[0] > 0);
    }

    #[test]
    fn note_off_decay_sums_release_stages_plus_kill_stage() {
        let pcm = vec![0u8; 4];
        let desc = descriptor(4, 0, 4, 44100, 0x40, [20; 6], [100; 6]);
        let buf = build_minimal_pat(1, &[(pcm, desc)]);
        let samples = parse_pat(&buf, false, 44100).unwrap();
        let s = &samples[0];
        assert!(s.note_off_decay > 0);
    }
}
