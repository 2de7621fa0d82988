//! Core audio data types
//!
//! Sample types, typed views over interleaved PCM, and the voice layout of a
//! source (`SongFormat`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Frame index / frame count (one frame = one sample for every channel)
pub type Frame = usize;

/// Largest output channel count the mixer accumulates into
pub const MAX_OUTPUT_CHANNELS: usize = 32;

/// Sample encoding of interleaved PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Not yet known (decoder not opened)
    #[default]
    Unknown,
    I16,
    I32,
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes (0 for Unknown)
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Unknown => 0,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32)
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleFormat::Unknown => "unknown",
            SampleFormat::I16 => "int16",
            SampleFormat::I32 => "int32",
            SampleFormat::F32 => "float32",
        };
        f.write_str(name)
    }
}

/// A PCM sample type the pipeline can store, mix and output.
pub trait Sample: bytemuck::Pod + Default + Send + Sync + 'static {
    /// Format tag for this type
    const FORMAT: SampleFormat;
    /// Largest positive value (full scale used for normalisation)
    const FULL_SCALE: f64;
    /// Lowest representable value as f64
    const MIN_VALUE: f64;
    /// Highest representable value as f64
    const MAX_VALUE: f64;

    fn to_f64(self) -> f64;

    /// Convert from the type's own scale, saturating (never wrapping).
    ///
    /// Integer types round to nearest; float types clip to [-1.0, 1.0].
    fn from_f64_saturating(value: f64) -> Self;
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;
    const FULL_SCALE: f64 = i16::MAX as f64;
    const MIN_VALUE: f64 = i16::MIN as f64;
    const MAX_VALUE: f64 = i16::MAX as f64;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64_saturating(value: f64) -> Self {
        value.round().clamp(Self::MIN_VALUE, Self::MAX_VALUE) as i16
    }
}

impl Sample for i32 {
    const FORMAT: SampleFormat = SampleFormat::I32;
    const FULL_SCALE: f64 = i32::MAX as f64;
    const MIN_VALUE: f64 = i32::MIN as f64;
    const MAX_VALUE: f64 = i32::MAX as f64;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64_saturating(value: f64) -> Self {
        value.round().clamp(Self::MIN_VALUE, Self::MAX_VALUE) as i32
    }
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
    const FULL_SCALE: f64 = 1.0;
    const MIN_VALUE: f64 = -1.0;
    const MAX_VALUE: f64 = 1.0;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64_saturating(value: f64) -> Self {
        value.clamp(Self::MIN_VALUE, Self::MAX_VALUE) as f32
    }
}

/// Borrowed, typed view of interleaved PCM
#[derive(Debug, Clone, Copy)]
pub enum PcmSlice<'a> {
    I16(&'a [i16]),
    I32(&'a [i32]),
    F32(&'a [f32]),
}

impl<'a> PcmSlice<'a> {
    /// Number of samples (items, not frames)
    pub fn len(&self) -> usize {
        match self {
            PcmSlice::I16(s) => s.len(),
            PcmSlice::I32(s) => s.len(),
            PcmSlice::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            PcmSlice::I16(_) => SampleFormat::I16,
            PcmSlice::I32(_) => SampleFormat::I32,
            PcmSlice::F32(_) => SampleFormat::F32,
        }
    }

    /// Sub-view of `len` items starting at item `start` (checked)
    pub fn slice(&self, start: usize, len: usize) -> Option<PcmSlice<'a>> {
        let end = start.checked_add(len)?;
        Some(match *self {
            PcmSlice::I16(s) => PcmSlice::I16(s.get(start..end)?),
            PcmSlice::I32(s) => PcmSlice::I32(s.get(start..end)?),
            PcmSlice::F32(s) => PcmSlice::F32(s.get(start..end)?),
        })
    }
}

/// Mutable, typed view of interleaved PCM
#[derive(Debug)]
pub enum PcmSliceMut<'a> {
    I16(&'a mut [i16]),
    I32(&'a mut [i32]),
    F32(&'a mut [f32]),
}

impl<'a> PcmSliceMut<'a> {
    pub fn len(&self) -> usize {
        match self {
            PcmSliceMut::I16(s) => s.len(),
            PcmSliceMut::I32(s) => s.len(),
            PcmSliceMut::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            PcmSliceMut::I16(_) => SampleFormat::I16,
            PcmSliceMut::I32(_) => SampleFormat::I32,
            PcmSliceMut::F32(_) => SampleFormat::F32,
        }
    }

    /// Reborrow `len` items starting at `start` (checked)
    pub fn slice_mut(&mut self, start: usize, len: usize) -> Option<PcmSliceMut<'_>> {
        let end = start.checked_add(len)?;
        Some(match self {
            PcmSliceMut::I16(s) => PcmSliceMut::I16(s.get_mut(start..end)?),
            PcmSliceMut::I32(s) => PcmSliceMut::I32(s.get_mut(start..end)?),
            PcmSliceMut::F32(s) => PcmSliceMut::F32(s.get_mut(start..end)?),
        })
    }

    /// Overwrite every sample with silence
    pub fn fill_silence(&mut self) {
        match self {
            PcmSliceMut::I16(s) => s.fill(0),
            PcmSliceMut::I32(s) => s.fill(0),
            PcmSliceMut::F32(s) => s.fill(0.0),
        }
    }

    pub fn as_slice(&self) -> PcmSlice<'_> {
        match self {
            PcmSliceMut::I16(s) => PcmSlice::I16(s),
            PcmSliceMut::I32(s) => PcmSlice::I32(s),
            PcmSliceMut::F32(s) => PcmSlice::F32(s),
        }
    }
}

/// One logical sub-stream of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub channels: u16,
    pub name: String,
    pub muted: bool,
}

impl Voice {
    pub fn new(name: impl Into<String>, channels: u16) -> Self {
        Self {
            channels,
            name: name.into(),
            muted: false,
        }
    }
}

/// Sample rate, sample encoding and voice layout of a source
///
/// The total channel count is always the sum of the voice channel counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SongFormat {
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub voices: Vec<Voice>,
}

impl SongFormat {
    /// Single voice carrying `channels` channels
    pub fn simple(sample_rate: u32, sample_format: SampleFormat, channels: u16) -> Self {
        Self {
            sample_rate,
            sample_format,
            voices: vec![Voice::new("Master", channels)],
        }
    }

    pub fn with_voices(sample_rate: u32, sample_format: SampleFormat, voices: Vec<Voice>) -> Self {
        Self {
            sample_rate,
            sample_format,
            voices,
        }
    }

    /// Total channel count across all voices
    pub fn channels(&self) -> u16 {
        self.voices.iter().map(|v| v.channels).sum()
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// True when the format can be played
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && self.channels() > 0
            && self.sample_format != SampleFormat::Unknown
            && self.voices.iter().all(|v| v.channels > 0)
    }

    /// Reject formats that cannot be played
    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::FormatMismatch(format!(
                "invalid format: {} Hz, {}, voices {:?}",
                self.sample_rate,
                self.sample_format,
                self.voices.iter().map(|v| v.channels).collect::<Vec<_>>()
            )))
        }
    }

    /// Mute flags, one per voice
    pub fn mute_mask(&self) -> Vec<bool> {
        self.voices.iter().map(|v| v.muted).collect()
    }

    /// Apply a mute mask; extra entries are ignored, missing ones leave voices unchanged
    pub fn apply_mute_mask(&mut self, mask: &[bool]) {
        for (voice, muted) in self.voices.iter_mut().zip(mask) {
            voice.muted = *muted;
        }
    }

    /// Same voice layout (channel counts) regardless of names or mute flags
    pub fn same_layout(&self, other: &SongFormat) -> bool {
        self.sample_rate == other.sample_rate
            && self.sample_format == other.sample_format
            && self.voices.len() == other.voices.len()
            && self
                .voices
                .iter()
                .zip(&other.voices)
                .all(|(a, b)| a.channels == b.channels)
    }
}
