//! Decoder contract
//!
//! Every source is read through [`Decoder`]: open it, learn its format and
//! length, then render frames from an internal cursor into caller memory.
//! The set of decoders is closed ([`SongDecoder`]).

use super::decode::SymphoniaDecoder;
use super::types::{Frame, PcmSlice, PcmSliceMut, SampleFormat, SongFormat, Voice};
use crate::error::{Error, Result};
use crate::playback::loop_tree::Loop;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Descriptive tags of a source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<String>,
    pub track: Option<u32>,
}

/// Uniform decode contract
pub trait Decoder: Send {
    /// Open the source and determine format and length. Idempotent.
    fn open(&mut self) -> Result<()>;

    /// Release decoder resources; `open` may be called again afterwards
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Format of the decoded PCM (valid once open)
    fn format(&self) -> &SongFormat;

    /// Total frame count (valid once open)
    fn frames(&self) -> Frame;

    /// Render up to `frames` frames at the cursor into `dest` and advance it.
    ///
    /// `dest` must hold at least `frames * channels` items of the decoder's
    /// sample format. Returns the frames written, fewer only at end of stream.
    fn render(&mut self, dest: PcmSliceMut<'_>, frames: Frame) -> Result<Frame>;

    /// Move the cursor to `frame`
    fn seek(&mut self, frame: Frame) -> Result<()>;

    /// Cursor position: frames rendered from the start or the last seek target
    fn frames_rendered(&self) -> Frame;

    /// Loop points reported by the source
    fn loop_points(&self) -> Vec<Loop>;

    fn metadata(&self) -> SongMetadata;

    /// Short human readable name for logs and events
    fn label(&self) -> String;
}

/// Every decoder the player can use
#[derive(Debug)]
pub enum SongDecoder {
    Symphonia(SymphoniaDecoder),
    Memory(MemoryDecoder),
}

impl SongDecoder {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        SongDecoder::Symphonia(SymphoniaDecoder::new(path))
    }

    pub fn from_clip(clip: Arc<MemoryClip>) -> Self {
        SongDecoder::Memory(MemoryDecoder::new(clip))
    }

    /// File backing this decoder, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            SongDecoder::Symphonia(d) => Some(d.path()),
            SongDecoder::Memory(_) => None,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $e:expr) => {
        match $self {
            SongDecoder::Symphonia($d) => $e,
            SongDecoder::Memory($d) => $e,
        }
    };
}

impl Decoder for SongDecoder {
    fn open(&mut self) -> Result<()> {
        dispatch!(self, d => d.open())
    }

    fn close(&mut self) {
        dispatch!(self, d => d.close())
    }

    fn is_open(&self) -> bool {
        dispatch!(self, d => d.is_open())
    }

    fn format(&self) -> &SongFormat {
        dispatch!(self, d => d.format())
    }

    fn frames(&self) -> Frame {
        dispatch!(self, d => d.frames())
    }

    fn render(&mut self, dest: PcmSliceMut<'_>, frames: Frame) -> Result<Frame> {
        dispatch!(self, d => d.render(dest, frames))
    }

    fn seek(&mut self, frame: Frame) -> Result<()> {
        dispatch!(self, d => d.seek(frame))
    }

    fn frames_rendered(&self) -> Frame {
        dispatch!(self, d => d.frames_rendered())
    }

    fn loop_points(&self) -> Vec<Loop> {
        dispatch!(self, d => d.loop_points())
    }

    fn metadata(&self) -> SongMetadata {
        dispatch!(self, d => d.metadata())
    }

    fn label(&self) -> String {
        dispatch!(self, d => d.label())
    }
}

/// Interleaved samples of a [`MemoryClip`]
#[derive(Debug, Clone)]
pub enum ClipSamples {
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl ClipSamples {
    fn as_pcm(&self) -> PcmSlice<'_> {
        match self {
            ClipSamples::I16(v) => PcmSlice::I16(v),
            ClipSamples::I32(v) => PcmSlice::I32(v),
            ClipSamples::F32(v) => PcmSlice::F32(v),
        }
    }

    fn format(&self) -> SampleFormat {
        self.as_pcm().format()
    }
}

/// PCM held in memory, playable like a file (generated audio, tests)
#[derive(Debug, Clone)]
pub struct MemoryClip {
    pub label: String,
    pub format: SongFormat,
    pub samples: ClipSamples,
    pub loops: Vec<Loop>,
    pub metadata: SongMetadata,
}

impl MemoryClip {
    /// Build a clip; the sample format is taken from `samples`
    pub fn new(label: impl Into<String>, sample_rate: u32, voices: Vec<Voice>, samples: ClipSamples) -> Result<Self> {
        let format = SongFormat::with_voices(sample_rate, samples.format(), voices);
        format.validate()?;
        let channels = format.channels() as usize;
        if samples.as_pcm().len() % channels != 0 {
            return Err(Error::FormatMismatch(format!(
                "{} samples do not divide into {}-channel frames",
                samples.as_pcm().len(),
                channels
            )));
        }
        Ok(Self {
            label: label.into(),
            format,
            samples,
            loops: Vec::new(),
            metadata: SongMetadata::default(),
        })
    }

    /// Single-voice 16-bit clip
    pub fn from_i16(label: impl Into<String>, sample_rate: u32, channels: u16, samples: Vec<i16>) -> Result<Self> {
        Self::new(label, sample_rate, vec![Voice::new("Master", channels)], ClipSamples::I16(samples))
    }

    /// Single-voice float clip
    pub fn from_f32(label: impl Into<String>, sample_rate: u32, channels: u16, samples: Vec<f32>) -> Result<Self> {
        Self::new(label, sample_rate, vec![Voice::new("Master", channels)], ClipSamples::F32(samples))
    }

    pub fn with_loops(mut self, loops: Vec<Loop>) -> Self {
        self.loops = loops;
        self
    }

    pub fn with_metadata(mut self, metadata: SongMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn frames(&self) -> Frame {
        self.samples.as_pcm().len() / self.format.channels() as usize
    }
}

/// Decoder over a shared [`MemoryClip`]
#[derive(Debug)]
pub struct MemoryDecoder {
    clip: Arc<MemoryClip>,
    open: bool,
    cursor: Frame,
}

impl MemoryDecoder {
    pub fn new(clip: Arc<MemoryClip>) -> Self {
        Self {
            clip,
            open: false,
            cursor: 0,
        }
    }
}

impl Decoder for MemoryDecoder {
    fn open(&mut self) -> Result<()> {
        if !self.open {
            self.clip.format.validate()?;
            self.open = true;
            self.cursor = 0;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.cursor = 0;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn format(&self) -> &SongFormat {
        &self.clip.format
    }

    fn frames(&self) -> Frame {
        self.clip.frames()
    }

    fn render(&mut self, mut dest: PcmSliceMut<'_>, frames: Frame) -> Result<Frame> {
        if !self.open {
            return Err(Error::InvalidState(format!("{} is not open", self.clip.label)));
        }
        let channels = self.clip.format.channels() as usize;
        let frames = frames.min(self.clip.frames().saturating_sub(self.cursor));
        let items = frames * channels;

        let source = self
            .clip
            .samples
            .as_pcm()
            .slice(self.cursor * channels, items)
            .ok_or_else(|| Error::Decode(format!("{}: cursor out of range", self.clip.label)))?;
        let dest = dest.slice_mut(0, items).ok_or_else(|| {
            Error::InvalidState(format!("destination too small for {} frames", frames))
        })?;
        copy_pcm(source, dest)?;

        self.cursor += frames;
        Ok(frames)
    }

    fn seek(&mut self, frame: Frame) -> Result<()> {
        self.cursor = frame.min(self.clip.frames());
        Ok(())
    }

    fn frames_rendered(&self) -> Frame {
        self.cursor
    }

    fn loop_points(&self) -> Vec<Loop> {
        self.clip.loops.clone()
    }

    fn metadata(&self) -> SongMetadata {
        self.clip.metadata.clone()
    }

    fn label(&self) -> String {
        self.clip.label.clone()
    }
}

/// Copy between views of the same sample format
pub fn copy_pcm(source: PcmSlice<'_>, dest: PcmSliceMut<'_>) -> Result<()> {
    match (source, dest) {
        (PcmSlice::I16(s), PcmSliceMut::I16(d)) if s.len() == d.len() => d.copy_from_slice(s),
        (PcmSlice::I32(s), PcmSliceMut::I32(d)) if s.len() == d.len() => d.copy_from_slice(s),
        (PcmSlice::F32(s), PcmSliceMut::F32(d)) if s.len() == d.len() => d.copy_from_slice(s),
        (s, d) => {
            return Err(Error::FormatMismatch(format!(
                "cannot copy {} {} samples into {} {} samples",
                s.len(),
                s.format(),
                d.len(),
                d.format()
            )))
        }
    }
    Ok(())
}
