//! A playable song
//!
//! Owns the decoder (through its render buffer), the format snapshot with
//! the user's mute flags, the loop tree and the loudness gain.

use super::loop_tree::{Loop, LoopTree};
use super::playlist::SongSource;
use super::render_buffer::{BufferMode, RenderBuffer};
use crate::audio::decoder::{Decoder, SongDecoder, SongMetadata};
use crate::audio::types::{Frame, PcmSlice, SongFormat};
use crate::config::RenderSettings;
use crate::error::{Error, Result};
use anmp_common::loudness::{self, UNITY_GAIN};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

pub struct Song {
    id: Uuid,
    source: SongSource,
    buffer: RenderBuffer<SongDecoder>,
    format: SongFormat,
    loop_tree: Option<LoopTree>,
    /// Loop points read at open, for rebuilding the tree
    loops: Vec<Loop>,
    gain: f32,
    metadata: SongMetadata,
}

impl Song {
    pub fn new(source: SongSource, settings: RenderSettings) -> Self {
        let buffer = RenderBuffer::new(source.decoder(), settings);
        Self {
            id: Uuid::new_v4(),
            source,
            buffer,
            format: SongFormat::default(),
            loop_tree: None,
            loops: Vec::new(),
            gain: UNITY_GAIN,
            metadata: SongMetadata::default(),
        }
    }

    /// Open the decoder, build the loop tree and read the loudness gain
    pub fn open(&mut self, normalize_loudness: bool) -> Result<()> {
        self.buffer.open()?;
        self.format = self.buffer.format().clone();

        let (loops, metadata) = match self.buffer.decoder() {
            Some(decoder) => (decoder.loop_points(), decoder.metadata()),
            None => return Err(Error::InvalidState("decoder busy while opening".to_string())),
        };
        self.metadata = metadata;
        self.loop_tree = Some(LoopTree::build(self.total_frames(), &loops, self.format.sample_rate));
        self.loops = loops;

        self.gain = match (normalize_loudness, self.source.path()) {
            (true, Some(path)) => loudness::read_gain(path),
            _ => UNITY_GAIN,
        };

        info!(
            "Opened {}: {} frames, {} Hz, {} channels in {} voices, gain {:.3}",
            self.label(),
            self.total_frames(),
            self.format.sample_rate,
            self.format.channels(),
            self.format.voice_count(),
            self.gain
        );
        Ok(())
    }

    pub fn fill_buffer(&mut self) -> Result<()> {
        self.buffer.fill_buffer()
    }

    pub fn release_buffer(&mut self) {
        self.buffer.release_buffer();
    }

    /// PCM from `position` on; see [`RenderBuffer::frames_at`]
    pub fn frames_at(&mut self, position: Frame) -> Result<PcmSlice<'_>> {
        self.buffer.frames_at(position)
    }

    pub fn frames_rendered(&self) -> Frame {
        self.buffer.frames_rendered()
    }

    /// Samples held by the active PCM buffer
    pub fn count(&self) -> usize {
        self.buffer.count()
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.buffer.mode()
    }

    pub fn total_frames(&self) -> Frame {
        self.buffer.total_frames()
    }

    /// Loop tree (a straight tree before the song is opened)
    pub fn loop_tree(&self) -> LoopTree {
        self.loop_tree
            .clone()
            .unwrap_or_else(|| LoopTree::straight(self.total_frames(), self.format.sample_rate))
    }

    /// Rebuild the loop tree when the decoder now reports another sample rate.
    ///
    /// Works while a render worker owns the decoder. Returns true if the tree
    /// was rebuilt; the song format then carries the new rate.
    pub fn rebuild_loop_tree_if_needed(&mut self) -> bool {
        self.rebuild_loop_tree_for(self.buffer.decoded_sample_rate())
    }

    fn rebuild_loop_tree_for(&mut self, rate: u32) -> bool {
        let built_for = self.loop_tree.as_ref().map(LoopTree::sample_rate);
        if built_for.is_none() || built_for == Some(rate) || rate == 0 {
            return false;
        }

        debug!("Sample rate of {} is now {} Hz, rebuilding loop tree", self.label(), rate);
        self.loop_tree = Some(LoopTree::build(self.total_frames(), &self.loops, rate));
        self.format.sample_rate = rate;
        true
    }

    /// Flip the mute flag of one voice; returns the new flag
    pub fn toggle_voice_mute(&mut self, voice: usize) -> Result<bool> {
        let count = self.format.voice_count();
        let v = self
            .format
            .voices
            .get_mut(voice)
            .ok_or_else(|| Error::FormatMismatch(format!("voice {} out of range ({} voices)", voice, count)))?;
        v.muted = !v.muted;
        Ok(v.muted)
    }

    /// Format including the current mute flags
    pub fn format(&self) -> &SongFormat {
        &self.format
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &SongSource {
        &self.source
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.path()
    }

    pub fn label(&self) -> String {
        self.source.label()
    }

    /// Linear loudness correction
    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn metadata(&self) -> &SongMetadata {
        &self.metadata
    }

    /// Release PCM and close the decoder
    pub fn close(&mut self) {
        self.buffer.close();
    }
}

impl std::fmt::Debug for Song {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Song")
            .field("id", &self.id)
            .field("source", &self.label())
            .field("format", &self.format)
            .field("mode", &self.buffer.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::{ClipSamples, MemoryClip};
    use crate::audio::types::Voice;
    use std::sync::Arc;

    fn song(clip: MemoryClip) -> Song {
        Song::new(SongSource::Memory(Arc::new(clip)), RenderSettings::default())
    }

    #[test]
    fn test_open_builds_loop_tree_from_decoder() {
        let clip = MemoryClip::from_i16("looped", 8000, 1, vec![0; 800])
            .unwrap()
            .with_loops(vec![Loop::forward(100, 200, 2)]);
        let mut song = song(clip);
        song.open(true).unwrap();

        let tree = song.loop_tree();
        assert_eq!(tree.total_frames(), 800);
        assert_eq!(tree.root().children.len(), 1);
        assert_eq!(song.gain(), UNITY_GAIN);
        assert!(!song.rebuild_loop_tree_if_needed());
    }

    #[test]
    fn test_toggle_voice_mute() {
        let clip = MemoryClip::new(
            "voices",
            44100,
            vec![Voice::new("lead", 2), Voice::new("bass", 1)],
            ClipSamples::F32(vec![0.0; 30]),
        )
        .unwrap();
        let mut song = song(clip);
        song.open(false).unwrap();

        assert!(song.toggle_voice_mute(1).unwrap());
        assert_eq!(song.format().mute_mask(), vec![false, true]);
        assert!(!song.toggle_voice_mute(1).unwrap());
        assert!(matches!(song.toggle_voice_mute(2), Err(Error::FormatMismatch(_))));
    }

    #[test]
    fn test_fill_and_release() {
        let clip = MemoryClip::from_i16("short", 44100, 2, vec![1; 2048]).unwrap();
        let mut song = song(clip);
        song.open(false).unwrap();
        song.fill_buffer().unwrap();
        assert_eq!(song.count(), 2048);
        song.release_buffer();
        song.release_buffer();
        assert_eq!(song.count(), 0);
    }

    #[test]
    fn test_rate_change_rebuilds_loop_tree() {
        let clip = MemoryClip::from_i16("stream", 44100, 1, vec![0; 1000])
            .unwrap()
            .with_loops(vec![Loop::forward(200, 400, 3)]);
        let mut song = song(clip);
        assert!(!song.rebuild_loop_tree_for(48000));

        song.open(false).unwrap();
        assert!(song.rebuild_loop_tree_for(48000));
        assert!(!song.rebuild_loop_tree_for(48000));

        let tree = song.loop_tree();
        assert_eq!(tree.sample_rate(), 48000);
        assert_eq!(tree.root().children.len(), 1);
        assert_eq!(tree.root().children[0].start(), 200);
        assert_eq!(song.format().sample_rate, 48000);
    }

    #[test]
    fn test_rate_tracked_while_rendering() {
        let clip = MemoryClip::from_i16("long", 22050, 2, vec![0; 200_000]).unwrap();
        let mut song = Song::new(
            SongSource::Memory(Arc::new(clip)),
            RenderSettings {
                whole_song_buffering: false,
                chunk_frames: 512,
                ..RenderSettings::default()
            },
        );
        song.open(false).unwrap();
        song.fill_buffer().unwrap();
        assert!(!song.rebuild_loop_tree_if_needed());
        assert_eq!(song.loop_tree().sample_rate(), 22050);
    }
}
