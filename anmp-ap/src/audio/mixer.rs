//! Voice mixer
//!
//! Folds every voice of a source into the output channel count.
//!
//! # Algorithm (per frame)
//!
//! - Zero an accumulator with one slot per output channel
//! - For each unmuted voice with `c` channels: for `m` in `0..max(c, out)`,
//!   `acc[m % out] += input[m % c]`. Muted voices are skipped but still
//!   consume their input channels.
//! - Multiply by volume
//! - Convert to the output type: rescale by the ratio of full scales, then
//!   clip (floats to [-1.0, 1.0], integers to the type range with rounding)
//!
//! Voices are summed, never averaged: a mono voice is copied into every
//! output channel and a stereo voice folded into mono output adds both
//! channels. Gain compensation belongs upstream (loudness normalization).
//!
//! Mixing never allocates; the accumulator lives on the stack.

use super::types::{Frame, PcmSlice, Sample, SongFormat, Voice, MAX_OUTPUT_CHANNELS};
use crate::error::{Error, Result};

/// Mix one interleaved input frame into one output frame.
///
/// `input` must hold the total channel count of `voices`; `output` holds the
/// output channels (at most [`MAX_OUTPUT_CHANNELS`]).
#[inline]
pub fn mix_frame<I: Sample, O: Sample>(input: &[I], voices: &[Voice], output: &mut [O], volume: f32) {
    let scale = volume as f64 * O::FULL_SCALE / I::FULL_SCALE;
    let out_channels = output.len().min(MAX_OUTPUT_CHANNELS);
    let mut acc = [0.0f64; MAX_OUTPUT_CHANNELS];
    accumulate(input, voices, &mut acc[..out_channels]);

    for (dest, sum) in output.iter_mut().zip(&acc[..out_channels]) {
        *dest = O::from_f64_saturating(sum * scale);
    }
}

#[inline(always)]
fn accumulate<I: Sample>(input: &[I], voices: &[Voice], acc: &mut [f64]) {
    let out = acc.len();
    let mut cursor = 0;
    for voice in voices {
        let c = voice.channels as usize;
        if !voice.muted {
            let channels = &input[cursor..cursor + c];
            for m in 0..c.max(out) {
                acc[m % out] += channels[m % c].to_f64();
            }
        }
        cursor += c;
    }
}

/// Mix as many whole frames as both buffers hold.
///
/// Layout checks run once per chunk. Returns the number of frames mixed.
pub fn mix_chunk<I: Sample, O: Sample>(
    input: &[I],
    format: &SongFormat,
    output: &mut [O],
    out_channels: u16,
    volume: f32,
) -> Result<Frame> {
    let in_channels = format.channels() as usize;
    let out_channels = out_channels as usize;

    if out_channels == 0 || out_channels > MAX_OUTPUT_CHANNELS {
        return Err(Error::FormatMismatch(format!(
            "cannot mix to {} output channels (1..={} supported)",
            out_channels, MAX_OUTPUT_CHANNELS
        )));
    }
    if in_channels == 0 || format.voices.iter().any(|v| v.channels == 0) {
        return Err(Error::FormatMismatch(format!(
            "voice layout {:?} has no channels",
            format.voices.iter().map(|v| v.channels).collect::<Vec<_>>()
        )));
    }

    let frames = (input.len() / in_channels).min(output.len() / out_channels);
    let scale = volume as f64 * O::FULL_SCALE / I::FULL_SCALE;
    let mut acc = [0.0f64; MAX_OUTPUT_CHANNELS];

    for (in_frame, out_frame) in input
        .chunks_exact(in_channels)
        .zip(output.chunks_exact_mut(out_channels))
        .take(frames)
    {
        let acc = &mut acc[..out_channels];
        acc.fill(0.0);
        accumulate(in_frame, &format.voices, acc);
        for (dest, sum) in out_frame.iter_mut().zip(acc.iter()) {
            *dest = O::from_f64_saturating(sum * scale);
        }
    }

    Ok(frames)
}

/// Mix a type-erased input view into a typed output buffer
pub fn mix_pcm<O: Sample>(
    input: PcmSlice<'_>,
    format: &SongFormat,
    output: &mut [O],
    out_channels: u16,
    volume: f32,
) -> Result<Frame> {
    match input {
        PcmSlice::I16(s) => mix_chunk(s, format, output, out_channels, volume),
        PcmSlice::I32(s) => mix_chunk(s, format, output, out_channels, volume),
        PcmSlice::F32(s) => mix_chunk(s, format, output, out_channels, volume),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::SampleFormat;

    fn layout(channels: &[u16]) -> SongFormat {
        SongFormat::with_voices(
            44100,
            SampleFormat::I16,
            channels
                .iter()
                .enumerate()
                .map(|(i, c)| Voice::new(format!("v{i}"), *c))
                .collect(),
        )
    }

    #[test]
    fn test_mono_voice_duplicated_to_stereo() {
        let format = layout(&[1]);
        let mut out = [0i16; 2];
        mix_frame(&[1234i16], &format.voices, &mut out, 1.0);
        assert_eq!(out, [1234, 1234]);
    }

    #[test]
    fn test_stereo_voice_summed_to_mono() {
        let format = layout(&[2]);
        let mut out = [0i32; 1];
        mix_frame(&[100i32, 250], &format.voices, &mut out, 1.0);
        assert_eq!(out, [350]);
    }

    #[test]
    fn test_muted_voice_contributes_nothing() {
        let mut format = layout(&[2, 1]);
        format.apply_mute_mask(&[true, false]);
        let mut out = [0i16; 2];
        mix_frame(&[9000i16, 9000, 7], &format.voices, &mut out, 1.0);
        // Second voice is read after skipping the two muted channels
        assert_eq!(out, [7, 7]);

        format.apply_mute_mask(&[true, true]);
        mix_frame(&[9000i16, 9000, 7], &format.voices, &mut out, 1.0);
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn test_integer_output_saturates() {
        let format = layout(&[2]);
        let mut out = [0i16; 1];
        mix_frame(&[30000i16, 30000], &format.voices, &mut out, 1.0);
        assert_eq!(out, [i16::MAX]);

        mix_frame(&[-30000i16, -30000], &format.voices, &mut out, 1.0);
        assert_eq!(out, [i16::MIN]);
    }

    #[test]
    fn test_float_output_normalized_and_clipped() {
        let format = layout(&[1]);
        let mut out = [0f32; 1];
        mix_frame(&[i16::MAX], &format.voices, &mut out, 0.5);
        assert!((out[0] - 0.5).abs() < 1e-6);

        let format = layout(&[2]);
        mix_frame(&[0.8f32, 0.8], &format.voices, &mut out, 1.0);
        assert_eq!(out, [1.0]);
    }

    #[test]
    fn test_integer_output_rounds_to_nearest() {
        let format = layout(&[1]);
        let mut out = [0i16; 1];
        mix_frame(&[3i16], &format.voices, &mut out, 0.5);
        assert_eq!(out, [2]);
    }

    #[test]
    fn test_multi_channel_voice_wraps_into_fewer_outputs() {
        // Five channels onto stereo: even indices left, odd right
        let format = layout(&[5]);
        let mut out = [0i32; 2];
        mix_frame(&[1i32, 10, 100, 1000, 10000], &format.voices, &mut out, 1.0);
        assert_eq!(out, [10101, 1010]);
    }

    #[test]
    fn test_chunk_mixes_whole_frames() {
        let format = layout(&[1, 1]);
        let input = [1i16, 2, 3, 4, 5, 6, 7];
        let mut output = [0i16; 8];
        let frames = mix_chunk(&input, &format, &mut output, 2, 1.0).unwrap();
        assert_eq!(frames, 3);
        assert_eq!(&output[..6], &[3, 3, 7, 7, 11, 11]);
        assert_eq!(&output[6..], &[0, 0]);
    }

    #[test]
    fn test_chunk_rejects_bad_output_channels() {
        let format = layout(&[2]);
        let mut output = [0f32; 64];
        assert!(mix_chunk(&[0i16; 4], &format, &mut output, 0, 1.0).is_err());
        assert!(mix_chunk(&[0i16; 4], &format, &mut output, 33, 1.0).is_err());
    }

    #[test]
    fn test_mix_pcm_dispatches_on_input_type() {
        let format = SongFormat::simple(48000, SampleFormat::F32, 1);
        let input = [0.25f32, -0.25];
        let mut output = [0i16; 4];
        let frames = mix_pcm(PcmSlice::F32(&input), &format, &mut output, 2, 1.0).unwrap();
        assert_eq!(frames, 2);
        assert_eq!(output[0], (0.25 * i16::MAX as f64).round() as i16);
        assert_eq!(output[2], -(0.25 * i16::MAX as f64).round() as i16);
    }
}
