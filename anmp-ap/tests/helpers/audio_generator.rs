//! Deterministic test audio
//!
//! Ramps make it easy to tell which source frame ended up where in the
//! output: frame `n` of a ramp carries the value `n` (wrapped to i16).

use anmp_ap::audio::MemoryClip;
use anmp_ap::playback::Loop;
use hound::{WavSpec, WavWriter};
use std::path::Path;

/// Mono i16 ramp: frame `n` has value `n`
pub fn ramp_clip(label: &str, sample_rate: u32, frames: usize) -> MemoryClip {
    let samples = (0..frames).map(|n| n as i16).collect();
    MemoryClip::from_i16(label, sample_rate, 1, samples).unwrap()
}

/// Mono ramp with loop points
pub fn looped_ramp(label: &str, sample_rate: u32, frames: usize, loops: Vec<Loop>) -> MemoryClip {
    ramp_clip(label, sample_rate, frames).with_loops(loops)
}

/// Write a 16-bit ramp WAV with `channels` identical channels
pub fn write_ramp_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for n in 0..frames {
        for _ in 0..channels {
            writer.write_sample(n as i16)?;
        }
    }
    writer.finalize()
}

/// Read every sample of a 16-bit WAV file
pub fn read_wav_i16(path: &Path) -> (WavSpec, Vec<i16>) {
    let mut reader = hound::WavReader::open(path).unwrap();
    let spec = reader.spec();
    let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    (spec, samples)
}
