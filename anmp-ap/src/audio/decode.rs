//! File decoder using symphonia
//!
//! Streams packets from the first audio track and converts them to
//! interleaved `i16` (sources of 16 bits or fewer) or `f32`. Loop points come
//! from `LOOPSTART` plus `LOOPLENGTH` or `LOOPEND` tags.

use super::decoder::{Decoder, SongMetadata};
use super::types::{Frame, PcmSliceMut, SampleFormat, SongFormat};
use crate::error::{Error, Result};
use crate::playback::loop_tree::Loop;
use std::path::{Path, PathBuf};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Decoded samples not yet handed out
#[derive(Debug)]
enum Pending {
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl Pending {
    fn new(format: SampleFormat) -> Self {
        match format {
            SampleFormat::I16 => Pending::I16(Vec::new()),
            _ => Pending::F32(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Pending::I16(v) => v.len(),
            Pending::F32(v) => v.len(),
        }
    }

    fn clear(&mut self) {
        match self {
            Pending::I16(v) => v.clear(),
            Pending::F32(v) => v.clear(),
        }
    }

    fn append(&mut self, decoded: &AudioBufferRef<'_>) {
        match self {
            Pending::I16(v) => {
                let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, *decoded.spec());
                buf.copy_interleaved_ref(decoded.clone());
                v.extend_from_slice(buf.samples());
            }
            Pending::F32(v) => {
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                buf.copy_interleaved_ref(decoded.clone());
                v.extend_from_slice(buf.samples());
            }
        }
    }

    /// Drop `items` samples starting at `start`
    fn discard_range(&mut self, start: usize, items: usize) {
        match self {
            Pending::I16(v) => {
                let end = (start + items).min(v.len());
                v.drain(start.min(end)..end);
            }
            Pending::F32(v) => {
                let end = (start + items).min(v.len());
                v.drain(start.min(end)..end);
            }
        }
    }

    /// Move up to `dest.len()` samples into `dest`, returning the count
    fn take_into(&mut self, dest: &mut PcmSliceMut<'_>, offset: usize) -> Result<usize> {
        let n = self.len().min(dest.len().saturating_sub(offset));
        match (self, dest) {
            (Pending::I16(v), PcmSliceMut::I16(d)) => {
                d[offset..offset + n].copy_from_slice(&v[..n]);
                v.drain(..n);
            }
            (Pending::F32(v), PcmSliceMut::F32(d)) => {
                d[offset..offset + n].copy_from_slice(&v[..n]);
                v.drain(..n);
            }
            (_, d) => {
                return Err(Error::FormatMismatch(format!(
                    "decoder output does not match {} destination",
                    d.format()
                )))
            }
        }
        Ok(n)
    }
}

struct OpenStream {
    reader: Box<dyn FormatReader>,
    codec: Box<dyn CodecDecoder>,
    track_id: u32,
    pending: Pending,
    /// Frames still to drop after an inexact seek
    skip_frames: u64,
    exhausted: bool,
}

/// Decoder for files symphonia can probe
pub struct SymphoniaDecoder {
    path: PathBuf,
    stream: Option<OpenStream>,
    format: SongFormat,
    frames: Frame,
    cursor: Frame,
    loops: Vec<Loop>,
    metadata: SongMetadata,
}

impl std::fmt::Debug for SymphoniaDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymphoniaDecoder")
            .field("path", &self.path)
            .field("open", &self.stream.is_some())
            .field("format", &self.format)
            .field("frames", &self.frames)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl SymphoniaDecoder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            format: SongFormat::default(),
            frames: 0,
            cursor: 0,
            loops: Vec::new(),
            metadata: SongMetadata::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn channels(&self) -> usize {
        self.format.channels() as usize
    }

    fn open_stream(&mut self) -> Result<()> {
        debug!("Opening {}", self.path.display());

        let file = std::fs::File::open(&self.path)
            .map_err(|e| Error::Decode(format!("Failed to open file {}: {}", self.path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to probe {}: {}", self.path.display(), e)))?;

        let track = probed
            .format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode(format!("No audio track in {}", self.path.display())))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let frames = params
            .n_frames
            .ok_or_else(|| Error::Decode(format!("Unknown length of {}", self.path.display())))?;

        let sample_format = match params.bits_per_sample.or(params.bits_per_coded_sample) {
            Some(bits) if bits <= 16 => SampleFormat::I16,
            _ => SampleFormat::F32,
        };

        let codec = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        // Tags may sit in the container prelude or in the format reader
        let mut metadata = SongMetadata::default();
        let mut loop_tags = LoopTags::default();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current().cloned()) {
            collect_tags(&rev, &mut metadata, &mut loop_tags);
        }
        if let Some(rev) = probed.format.metadata().current() {
            collect_tags(rev, &mut metadata, &mut loop_tags);
        }

        let mut stream = OpenStream {
            reader: probed.format,
            codec,
            track_id,
            pending: Pending::new(sample_format),
            skip_frames: 0,
            exhausted: false,
        };

        let mut sample_rate = params.sample_rate.unwrap_or(0);
        let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);

        // Some containers only reveal rate or layout with the first packet
        if sample_rate == 0 || channels == 0 {
            match decode_packet(&mut stream)? {
                Some((rate, ch)) => {
                    debug!("Learned format from first packet: {} Hz, {} channels", rate, ch);
                    sample_rate = rate;
                    channels = ch;
                }
                None => return Err(Error::Decode(format!("{} holds no audio", self.path.display()))),
            }
        }

        self.format = SongFormat::simple(sample_rate, sample_format, channels);
        self.format
            .validate()
            .map_err(|e| Error::Decode(format!("{}: {}", self.path.display(), e)))?;
        self.frames = frames as Frame;
        self.cursor = 0;
        self.loops = loop_tags.into_loops(self.frames);
        self.metadata = metadata;
        self.stream = Some(stream);

        debug!(
            "Opened {}: {} frames, {} Hz, {} channels, {}",
            self.path.display(),
            self.frames,
            sample_rate,
            channels,
            sample_format
        );
        Ok(())
    }
}

/// Decode the next packet of the selected track into `pending`.
///
/// Returns the packet's rate and channel count, or `None` at end of stream.
fn decode_packet(stream: &mut OpenStream) -> Result<Option<(u32, u16)>> {
    loop {
        let packet = match stream.reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                stream.exhausted = true;
                return Ok(None);
            }
            Err(e) => {
                warn!("Error reading packet: {}", e);
                stream.exhausted = true;
                return Ok(None);
            }
        };

        if packet.track_id() != stream.track_id {
            continue;
        }

        match stream.codec.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let channels = spec.channels.count();
                let frames = decoded.frames() as u64;

                // Drop whatever lies before an inexact seek target
                let skip = stream.skip_frames.min(frames);
                stream.skip_frames -= skip;
                let before = stream.pending.len();
                stream.pending.append(&decoded);
                stream.pending.discard_range(before, skip as usize * channels);
                return Ok(Some((spec.rate, channels as u16)));
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Decode error: {}", e);
                continue;
            }
            Err(e) => return Err(Error::Decode(format!("Decoder failed: {}", e))),
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.open_stream()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
        self.cursor = 0;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn format(&self) -> &SongFormat {
        &self.format
    }

    fn frames(&self) -> Frame {
        self.frames
    }

    fn render(&mut self, mut dest: PcmSliceMut<'_>, frames: Frame) -> Result<Frame> {
        let channels = self.channels();
        let frames = frames.min(self.frames.saturating_sub(self.cursor));
        let items = frames * channels;
        if dest.len() < items {
            return Err(Error::InvalidState(format!(
                "destination holds {} samples, {} needed",
                dest.len(),
                items
            )));
        }

        let path = self.path.display().to_string();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not open", path)))?;

        let mut written = 0;
        let mut region = dest
            .slice_mut(0, items)
            .ok_or_else(|| Error::InvalidState("destination too small".to_string()))?;
        while written < items {
            if stream.pending.len() == 0 {
                if stream.exhausted {
                    break;
                }
                match decode_packet(stream)? {
                    Some((_, ch)) if ch as usize != channels => {
                        return Err(Error::Decode(format!(
                            "{}: channel count changed from {} to {}",
                            path, channels, ch
                        )));
                    }
                    Some(_) => {}
                    None => break,
                }
                continue;
            }
            written += stream.pending.take_into(&mut region, written)?;
        }

        if written < items {
            debug!(
                "{} ended {} frames early, padding with silence",
                path,
                (items - written) / channels.max(1)
            );
            if let Some(mut rest) = region.slice_mut(written, items - written) {
                rest.fill_silence();
            }
        }

        self.cursor += frames;
        Ok(frames)
    }

    fn seek(&mut self, frame: Frame) -> Result<()> {
        let frame = frame.min(self.frames);
        let path = self.path.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not open", path.display())))?;

        stream.pending.clear();
        stream.exhausted = false;
        let seeked = stream.reader.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame as u64,
                track_id: stream.track_id,
            },
        );

        match seeked {
            Ok(seeked) => {
                stream.codec.reset();
                stream.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
            }
            Err(e) => {
                // Unseekable stream: decode from the start and skip
                debug!("Seek in {} failed ({}), decoding from start", path.display(), e);
                self.stream = None;
                self.open_stream()?;
                if let Some(stream) = self.stream.as_mut() {
                    stream.skip_frames = frame as u64;
                }
            }
        }

        self.cursor = frame;
        Ok(())
    }

    fn frames_rendered(&self) -> Frame {
        self.cursor
    }

    fn loop_points(&self) -> Vec<Loop> {
        self.loops.clone()
    }

    fn metadata(&self) -> SongMetadata {
        self.metadata.clone()
    }

    fn label(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[derive(Default)]
struct LoopTags {
    start: Option<u64>,
    length: Option<u64>,
    end: Option<u64>,
}

impl LoopTags {
    fn into_loops(self, total_frames: Frame) -> Vec<Loop> {
        let Some(start) = self.start else {
            return Vec::new();
        };
        let stop = match (self.length, self.end) {
            (Some(len), _) => start + len,
            (None, Some(end)) => end,
            (None, None) => total_frames as u64,
        };
        // Tagged loops repeat until overridden or stopped
        vec![Loop::forward(start as Frame, stop as Frame, 0)]
    }
}

fn collect_tags(rev: &MetadataRevision, metadata: &mut SongMetadata, loops: &mut LoopTags) {
    for tag in rev.tags() {
        let value = tag.value.to_string();
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => metadata.title = Some(value),
            Some(StandardTagKey::Artist) => metadata.artist = Some(value),
            Some(StandardTagKey::Album) => metadata.album = Some(value),
            Some(StandardTagKey::Genre) => metadata.genre = Some(value),
            Some(StandardTagKey::Date) => metadata.year = Some(value),
            Some(StandardTagKey::TrackNumber) => {
                // "3/12" style numbering
                metadata.track = value.split('/').next().and_then(|n| n.trim().parse().ok());
            }
            _ => {
                let parsed = value.trim().parse::<u64>().ok();
                match tag.key.to_ascii_uppercase().as_str() {
                    "LOOPSTART" => loops.start = parsed,
                    "LOOPLENGTH" => loops.length = parsed,
                    "LOOPEND" => loops.end = parsed,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, frames: usize, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            writer.write_sample((i % 1000) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_open_reports_format_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 5000, 2);

        let mut decoder = SymphoniaDecoder::new(&path);
        decoder.open().unwrap();
        assert_eq!(decoder.frames(), 5000);
        assert_eq!(decoder.format().sample_rate, 22050);
        assert_eq!(decoder.format().channels(), 2);
        assert_eq!(decoder.format().sample_format, SampleFormat::I16);
        assert!(decoder.loop_points().is_empty());
    }

    #[test]
    fn test_render_whole_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        write_wav(&path, 3000, 1);

        let mut decoder = SymphoniaDecoder::new(&path);
        decoder.open().unwrap();

        let mut all = Vec::new();
        let mut chunk = vec![0i16; 1024];
        loop {
            let n = decoder.render(PcmSliceMut::I16(&mut chunk), 1024).unwrap();
            if n == 0 {
                break;
            }
            all.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(all.len(), 3000);
        assert_eq!(all[1234], 234);
        assert_eq!(decoder.frames_rendered(), 3000);
    }

    #[test]
    fn test_seek_lands_on_exact_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seek.wav");
        write_wav(&path, 4000, 1);

        let mut decoder = SymphoniaDecoder::new(&path);
        decoder.open().unwrap();
        decoder.seek(2500).unwrap();

        let mut chunk = vec![0i16; 4];
        decoder.render(PcmSliceMut::I16(&mut chunk), 4).unwrap();
        assert_eq!(chunk, vec![500, 501, 502, 503]);
        assert_eq!(decoder.frames_rendered(), 2504);
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let mut decoder = SymphoniaDecoder::new("/nonexistent/file.flac");
        assert!(matches!(decoder.open(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_garbage_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();
        let mut decoder = SymphoniaDecoder::new(&path);
        assert!(matches!(decoder.open(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_loop_tags_to_loop() {
        let tags = LoopTags {
            start: Some(100),
            length: Some(50),
            end: None,
        };
        let loops = tags.into_loops(1000);
        assert_eq!(loops.len(), 1);
        assert_eq!((loops[0].start, loops[0].stop, loops[0].count), (100, 150, 0));

        let tags = LoopTags {
            start: Some(10),
            length: None,
            end: Some(900),
        };
        assert_eq!(tags.into_loops(1000)[0].stop, 900);
    }
}
