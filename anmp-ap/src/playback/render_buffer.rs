//! Render buffer manager
//!
//! Keeps decoded PCM for one source ahead of the consumer.
//!
//! # Strategies
//!
//! - **Whole song**: one buffer for every frame of the song. A short window
//!   is rendered synchronously, the remainder by a background worker that
//!   publishes chunk after chunk. The consumer only ever reads the
//!   published prefix.
//! - **Double buffering**: two chunk-sized buffers. The consumer reads the
//!   front chunk while a worker renders the following chunk into the back
//!   buffer; the two are swapped by `fill_buffer` once the back render has
//!   been joined.
//!
//! The decoder moves into whichever worker renders and comes back with the
//! join, so it is never touched by two threads. Cancellation is a flag the
//! workers check between chunks. The sample rate the decoder reports after
//! each chunk is published through an atomic so it can be read while a
//! worker owns the decoder.

use crate::audio::decoder::Decoder;
use crate::audio::pcm::{AllocationStrategy, PcmBuffer, PcmWriter, SharedPcm};
use crate::audio::types::{Frame, PcmSlice, SongFormat};
use crate::config::RenderSettings;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Progress of a background whole-song fill
#[derive(Debug, Default)]
struct FillState {
    finished: bool,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct FillProgress {
    state: Mutex<FillState>,
    cond: Condvar,
}

impl FillProgress {
    fn notify(&self) {
        let _guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    fn finish(&self, error: Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.finished = true;
        state.error = error;
        self.cond.notify_all();
    }

    /// Block until `items` samples are published or the fill has ended
    fn wait_for(&self, pcm: &SharedPcm, items: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while pcm.published() < items && !state.finished {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if pcm.published() >= items {
            return Ok(());
        }
        Err(Error::Decode(
            state
                .error
                .clone()
                .unwrap_or_else(|| "background render ended early".to_string()),
        ))
    }
}

/// Result of a double-buffer back render
struct BackRender<D> {
    decoder: D,
    buffer: PcmBuffer,
    start: Frame,
    frames: Frame,
    result: Result<()>,
}

enum BackSlot<D> {
    /// Back buffer holding `frames` frames from `start` (0 frames: unused)
    Idle { buffer: PcmBuffer, start: Frame, frames: Frame },
    Rendering(JoinHandle<BackRender<D>>),
    /// Transient while ownership moves between states
    Taken,
}

enum BufferState<D> {
    Empty,
    WholeSong {
        pcm: Arc<SharedPcm>,
        progress: Arc<FillProgress>,
        worker: Option<JoinHandle<D>>,
    },
    DoubleBuffered {
        front: PcmBuffer,
        front_start: Frame,
        front_frames: Frame,
        back: BackSlot<D>,
    },
}

/// Which strategy a filled buffer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Empty,
    WholeSong,
    DoubleBuffered,
}

/// PCM render manager for one decoder
pub struct RenderBuffer<D: Decoder + 'static> {
    settings: RenderSettings,
    /// None while a worker owns the decoder
    decoder: Option<D>,
    format: SongFormat,
    total_frames: Frame,
    state: BufferState<D>,
    cancel: Arc<AtomicBool>,
    /// Sample rate reported by the decoder after its latest render
    decoded_rate: Arc<AtomicU32>,
}

impl<D: Decoder + 'static> RenderBuffer<D> {
    pub fn new(decoder: D, settings: RenderSettings) -> Self {
        Self {
            settings,
            decoder: Some(decoder),
            format: SongFormat::default(),
            total_frames: 0,
            state: BufferState::Empty,
            cancel: Arc::new(AtomicBool::new(false)),
            decoded_rate: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Open the decoder (if needed) and snapshot its format and length
    pub fn open(&mut self) -> Result<()> {
        let decoder = self.decoder_mut()?;
        decoder.open()?;
        let format = decoder.format().clone();
        let total_frames = decoder.frames();

        format
            .validate()
            .map_err(|e| Error::FormatMismatch(format!("{}: {}", decoder.label(), e)))?;
        if total_frames == 0 {
            return Err(Error::Decode(format!("{} has no frames", decoder.label())));
        }

        self.decoded_rate.store(format.sample_rate, Ordering::Release);
        self.format = format;
        self.total_frames = total_frames;
        Ok(())
    }

    fn decoder_mut(&mut self) -> Result<&mut D> {
        self.decoder
            .as_mut()
            .ok_or_else(|| Error::InvalidState("decoder is owned by a render worker".to_string()))
    }

    /// Decoder access, only while no render is in flight
    pub fn decoder(&self) -> Option<&D> {
        self.decoder.as_ref()
    }

    pub fn format(&self) -> &SongFormat {
        &self.format
    }

    /// Sample rate the decoder reported after its most recent render.
    ///
    /// Readable while a render worker owns the decoder; 0 before `open`.
    pub fn decoded_sample_rate(&self) -> u32 {
        self.decoded_rate.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> Frame {
        self.total_frames
    }

    fn channels(&self) -> usize {
        self.format.channels() as usize
    }

    pub fn mode(&self) -> BufferMode {
        match self.state {
            BufferState::Empty => BufferMode::Empty,
            BufferState::WholeSong { .. } => BufferMode::WholeSong,
            BufferState::DoubleBuffered { .. } => BufferMode::DoubleBuffered,
        }
    }

    /// Samples (items) held by the active buffer
    pub fn count(&self) -> usize {
        match &self.state {
            BufferState::Empty => 0,
            BufferState::WholeSong { pcm, .. } => pcm.len(),
            BufferState::DoubleBuffered { front, .. } => front.len(),
        }
    }

    /// Frames rendered so far.
    ///
    /// Whole song: published frames. Double buffered: end of the furthest
    /// chunk whose render has been joined.
    pub fn frames_rendered(&self) -> Frame {
        let channels = self.channels().max(1);
        match &self.state {
            BufferState::Empty => 0,
            BufferState::WholeSong { pcm, .. } => pcm.published() / channels,
            BufferState::DoubleBuffered {
                front_start,
                front_frames,
                back,
                ..
            } => {
                let front_end = front_start + front_frames;
                match back {
                    BackSlot::Idle { start, frames, .. } if *frames > 0 => front_end.max(start + frames),
                    _ => front_end,
                }
            }
        }
    }

    /// True once every frame of the song has been rendered (whole song only)
    pub fn is_fully_rendered(&self) -> bool {
        match &self.state {
            BufferState::WholeSong { pcm, .. } => pcm.is_complete(),
            _ => false,
        }
    }

    /// Make PCM available ahead of the consumer.
    ///
    /// The first call picks a strategy and renders the first window
    /// synchronously. Later calls are no-ops for whole-song buffers and
    /// advance double buffers by one chunk.
    pub fn fill_buffer(&mut self) -> Result<()> {
        if matches!(self.state, BufferState::Empty) {
            if self.total_frames == 0 {
                self.open()?;
            }
            return self.first_fill();
        }
        match self.state {
            BufferState::WholeSong { .. } => Ok(()),
            BufferState::DoubleBuffered { .. } => self.swap_chunks(),
            BufferState::Empty => Ok(()),
        }
    }

    fn first_fill(&mut self) -> Result<()> {
        self.cancel.store(false, Ordering::Release);
        let items = self
            .total_frames
            .checked_mul(self.channels())
            .ok_or_else(|| Error::Allocation("song size overflows".to_string()))?;
        let bytes = items.saturating_mul(self.format.sample_format.bytes_per_sample());

        if self.settings.whole_song_buffering {
            if bytes > self.settings.whole_song_limit_bytes() {
                info!(
                    "Song needs {} MiB, above whole-song limit; double buffering",
                    bytes / (1024 * 1024)
                );
            } else {
                match PcmBuffer::allocate(self.format.sample_format, items, AllocationStrategy::WHOLE_SONG) {
                    Ok(buffer) => return self.start_whole_song(buffer),
                    Err(e) => warn!("Whole-song allocation failed ({}), double buffering", e),
                }
            }
        }

        self.start_double_buffer()
    }

    fn start_whole_song(&mut self, buffer: PcmBuffer) -> Result<()> {
        debug!(
            "Whole-song buffer: {} frames via {:?}",
            self.total_frames,
            buffer.strategy()
        );
        let channels = self.channels();
        let (pcm, mut writer) = SharedPcm::new(buffer);
        let progress = Arc::new(FillProgress::default());

        let mut decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::InvalidState("decoder is owned by a render worker".to_string()))?;

        // Synchronous pre-render so playback can start at once
        let pre_frames = self.settings.pre_render_frames.min(self.total_frames);
        let pre = decoder
            .seek(0)
            .and_then(|_| render_into_writer(&mut decoder, &mut writer, pre_frames, channels, &self.decoded_rate));
        if let Err(e) = pre {
            self.decoder = Some(decoder);
            return Err(e);
        }

        if writer.remaining() == 0 {
            progress.finish(None);
            self.decoder = Some(decoder);
            self.state = BufferState::WholeSong {
                pcm,
                progress,
                worker: None,
            };
            return Ok(());
        }

        let chunk_frames = self.settings.chunk_frames;
        let cancel = Arc::clone(&self.cancel);
        let rate = Arc::clone(&self.decoded_rate);
        let worker_progress = Arc::clone(&progress);
        let worker = thread::Builder::new()
            .name("anmp-render".to_string())
            .spawn(move || {
                let mut error = None;
                while writer.remaining() > 0 {
                    // Bulk fills stop between chunks when cancelled
                    if cancel.load(Ordering::Acquire) {
                        break;
                    }
                    let frames = chunk_frames.min(writer.remaining() / channels);
                    if let Err(e) = render_into_writer(&mut decoder, &mut writer, frames, channels, &rate) {
                        error = Some(e.to_string());
                        break;
                    }
                    worker_progress.notify();
                }
                worker_progress.finish(error);
                decoder
            })?;

        self.state = BufferState::WholeSong {
            pcm,
            progress,
            worker: Some(worker),
        };
        Ok(())
    }

    fn start_double_buffer(&mut self) -> Result<()> {
        let items = self.settings.chunk_frames * self.channels();
        let allocate = || {
            PcmBuffer::allocate(self.format.sample_format, items, AllocationStrategy::DOUBLE_BUFFER)
                .map_err(|e| Error::Allocation(format!("double buffer of {} samples: {}", items, e)))
        };
        let mut front = allocate()?;
        let back = allocate()?;
        debug!(
            "Double buffer: 2 x {} frames via {:?}",
            self.settings.chunk_frames,
            front.strategy()
        );

        let chunk_frames = self.settings.chunk_frames;
        let rate = Arc::clone(&self.decoded_rate);
        let decoder = self.decoder_mut()?;
        decoder.seek(0)?;
        let front_frames = render_chunk(decoder, &mut front, chunk_frames, 0, &rate)?;

        self.state = BufferState::DoubleBuffered {
            front,
            front_start: 0,
            front_frames,
            back: BackSlot::Idle {
                buffer: back,
                start: 0,
                frames: 0,
            },
        };
        self.start_back_render()
    }

    /// Begin rendering the chunk after the front chunk into the back buffer
    fn start_back_render(&mut self) -> Result<()> {
        let total = self.total_frames;
        let chunk_frames = self.settings.chunk_frames;
        let rate = Arc::clone(&self.decoded_rate);
        let BufferState::DoubleBuffered {
            front_start,
            front_frames,
            back,
            ..
        } = &mut self.state
        else {
            return Ok(());
        };

        let next = *front_start + *front_frames;
        if next >= total {
            return Ok(());
        }
        let BackSlot::Idle { .. } = back else {
            return Ok(());
        };

        let BackSlot::Idle { buffer: mut back_buffer, .. } = std::mem::replace(back, BackSlot::Taken) else {
            return Ok(());
        };

        let Some(mut decoder) = self.decoder.take() else {
            *back = BackSlot::Idle {
                buffer: back_buffer,
                start: 0,
                frames: 0,
            };
            return Err(Error::InvalidState("decoder is owned by a render worker".to_string()));
        };

        let worker = thread::Builder::new()
            .name("anmp-render".to_string())
            .spawn(move || {
                let result = if decoder.frames_rendered() != next {
                    decoder.seek(next)
                } else {
                    Ok(())
                };
                let (frames, result) = match result
                    .and_then(|_| render_chunk(&mut decoder, &mut back_buffer, chunk_frames, next, &rate))
                {
                    Ok(frames) => (frames, Ok(())),
                    Err(e) => (0, Err(e)),
                };
                BackRender {
                    decoder,
                    buffer: back_buffer,
                    start: next,
                    frames,
                    result,
                }
            })?;

        *back = BackSlot::Rendering(worker);
        Ok(())
    }

    /// Wait for the back render to finish and take the decoder back
    fn join_back(&mut self) -> Result<()> {
        let BufferState::DoubleBuffered { back, .. } = &mut self.state else {
            return Ok(());
        };
        if !matches!(back, BackSlot::Rendering(_)) {
            return Ok(());
        }
        let BackSlot::Rendering(handle) = std::mem::replace(back, BackSlot::Taken) else {
            return Ok(());
        };

        let rendered = handle
            .join()
            .map_err(|_| Error::Decode("render worker panicked".to_string()))?;
        self.decoder = Some(rendered.decoder);
        *back = BackSlot::Idle {
            buffer: rendered.buffer,
            start: rendered.start,
            frames: rendered.frames,
        };
        rendered.result
    }

    /// Hand the finished back chunk to the consumer and start the next one
    fn swap_chunks(&mut self) -> Result<()> {
        self.join_back()?;
        let total = self.total_frames;
        let BufferState::DoubleBuffered {
            front,
            front_start,
            front_frames,
            back,
        } = &mut self.state
        else {
            return Ok(());
        };

        let BackSlot::Idle { buffer, start, frames } = back else {
            return Ok(());
        };
        if *frames == 0 {
            // Nothing rendered behind the front chunk: end of song
            if *front_start + *front_frames >= total {
                return Ok(());
            }
            return Err(Error::InvalidState("no chunk ready to swap in".to_string()));
        }

        std::mem::swap(front, buffer);
        *front_start = *start;
        *front_frames = *frames;
        *frames = 0;

        self.start_back_render()
    }

    /// Throw away both chunks and render synchronously from `position`
    fn rerender_at(&mut self, position: Frame) -> Result<()> {
        self.join_back()?;
        let chunk_frames = self.settings.chunk_frames;
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(Error::InvalidState("decoder is owned by a render worker".to_string()));
        };
        let BufferState::DoubleBuffered {
            front,
            front_start,
            front_frames,
            back,
        } = &mut self.state
        else {
            return Ok(());
        };

        debug!("Re-rendering from frame {}", position);
        decoder.seek(position)?;
        *front_frames = render_chunk(decoder, front, chunk_frames, position, &self.decoded_rate)?;
        *front_start = position;
        if let BackSlot::Idle { frames, .. } = back {
            *frames = 0;
        }
        self.start_back_render()
    }

    /// PCM starting at frame `position`, up to the end of what is available.
    ///
    /// Blocks while the needed frames are still being rendered. Returns an
    /// empty view at or after the end of the song.
    pub fn frames_at(&mut self, position: Frame) -> Result<PcmSlice<'_>> {
        let channels = self.channels();
        if position >= self.total_frames {
            return Ok(empty_view(&self.format));
        }

        if matches!(self.state, BufferState::Empty) {
            self.fill_buffer()?;
        }

        if self.mode() == BufferMode::WholeSong {
            let BufferState::WholeSong { pcm, progress, .. } = &self.state else {
                return Ok(empty_view(&self.format));
            };
            progress.wait_for(pcm, (position + 1) * channels)?;
            let view = pcm.rendered();
            let start = position * channels;
            return view
                .slice(start, view.len() - start)
                .ok_or_else(|| Error::InvalidState(format!("frame {} outside buffer", position)));
        }

        let (front_start, front_frames) = match &self.state {
            BufferState::DoubleBuffered {
                front_start,
                front_frames,
                ..
            } => (*front_start, *front_frames),
            _ => return Ok(empty_view(&self.format)),
        };
        let front_end = front_start + front_frames;

        if position == front_end {
            self.swap_chunks()?;
        }
        let in_front = |state: &BufferState<D>| match state {
            BufferState::DoubleBuffered {
                front_start,
                front_frames,
                ..
            } => position >= *front_start && position < front_start + front_frames,
            _ => false,
        };
        if !in_front(&self.state) {
            self.rerender_at(position)?;
        }

        match &self.state {
            BufferState::DoubleBuffered {
                front,
                front_start,
                front_frames,
                ..
            } => {
                let start = (position - front_start) * channels;
                let len = front_frames * channels - start;
                front
                    .as_pcm()
                    .slice(start, len)
                    .ok_or_else(|| Error::InvalidState(format!("frame {} outside chunk", position)))
            }
            _ => Ok(empty_view(&self.format)),
        }
    }

    /// Stop background rendering and free all PCM. Safe to call repeatedly.
    pub fn release_buffer(&mut self) {
        self.cancel.store(true, Ordering::Release);

        match std::mem::replace(&mut self.state, BufferState::Empty) {
            BufferState::Empty => {}
            BufferState::WholeSong { worker, .. } => {
                if let Some(handle) = worker {
                    match handle.join() {
                        Ok(decoder) => self.decoder = Some(decoder),
                        Err(_) => warn!("Render worker panicked during release"),
                    }
                }
            }
            BufferState::DoubleBuffered { back, .. } => {
                if let BackSlot::Rendering(handle) = back {
                    match handle.join() {
                        Ok(rendered) => self.decoder = Some(rendered.decoder),
                        Err(_) => warn!("Render worker panicked during release"),
                    }
                }
            }
        }

        self.cancel.store(false, Ordering::Release);
    }

    /// Release buffers and close the decoder
    pub fn close(&mut self) {
        self.release_buffer();
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.close();
        }
        self.total_frames = 0;
    }
}

impl<D: Decoder + 'static> Drop for RenderBuffer<D> {
    fn drop(&mut self) {
        self.release_buffer();
    }
}

fn empty_view(format: &SongFormat) -> PcmSlice<'static> {
    match format.sample_format {
        crate::audio::types::SampleFormat::I16 => PcmSlice::I16(&[]),
        crate::audio::types::SampleFormat::I32 => PcmSlice::I32(&[]),
        _ => PcmSlice::F32(&[]),
    }
}

/// Render `frames` frames at the decoder cursor into the writer and publish them
fn render_into_writer<D: Decoder>(
    decoder: &mut D,
    writer: &mut PcmWriter,
    frames: Frame,
    channels: usize,
    rate: &AtomicU32,
) -> Result<()> {
    let items = frames * channels;
    let mut region = writer.next_region(items);
    let written = decoder.render(region.slice_mut(0, items).ok_or_else(|| {
        Error::InvalidState(format!("{} frames do not fit the whole-song buffer", frames))
    })?, frames)?;
    if written < frames {
        if let Some(mut rest) = region.slice_mut(written * channels, (frames - written) * channels) {
            rest.fill_silence();
        }
    }
    rate.store(decoder.format().sample_rate, Ordering::Release);
    writer.publish(items);
    Ok(())
}

/// Render one chunk into `buffer`, padding a short render with silence.
///
/// Returns the number of valid frames (less than a full chunk at song end).
fn render_chunk<D: Decoder>(
    decoder: &mut D,
    buffer: &mut PcmBuffer,
    chunk_frames: Frame,
    start: Frame,
    rate: &AtomicU32,
) -> Result<Frame> {
    let total = decoder.frames();
    let channels = decoder.format().channels() as usize;
    let frames = chunk_frames.min(total.saturating_sub(start));

    let mut view = buffer.as_pcm_mut();
    let written = match view.slice_mut(0, frames * channels) {
        Some(region) => decoder.render(region, frames)?,
        None => return Err(Error::InvalidState("chunk larger than buffer".to_string())),
    };
    if written < frames {
        if let Some(mut rest) = view.slice_mut(written * channels, (frames - written) * channels) {
            rest.fill_silence();
        }
    }
    rate.store(decoder.format().sample_rate, Ordering::Release);
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::{MemoryClip, MemoryDecoder, SongMetadata};
    use crate::audio::types::PcmSliceMut;
    use crate::playback::loop_tree::Loop;

    /// Reports 44.1 kHz until its first render, then `later_rate`
    struct RateSwitchingDecoder {
        inner: MemoryDecoder,
        format: SongFormat,
        later_rate: u32,
    }

    impl RateSwitchingDecoder {
        fn new(clip: Arc<MemoryClip>, later_rate: u32) -> Self {
            Self {
                format: clip.format.clone(),
                inner: MemoryDecoder::new(clip),
                later_rate,
            }
        }
    }

    impl Decoder for RateSwitchingDecoder {
        fn open(&mut self) -> Result<()> {
            self.inner.open()
        }

        fn close(&mut self) {
            self.inner.close()
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn format(&self) -> &SongFormat {
            &self.format
        }

        fn frames(&self) -> Frame {
            self.inner.frames()
        }

        fn render(&mut self, dest: PcmSliceMut<'_>, frames: Frame) -> Result<Frame> {
            let written = self.inner.render(dest, frames)?;
            self.format.sample_rate = self.later_rate;
            Ok(written)
        }

        fn seek(&mut self, frame: Frame) -> Result<()> {
            self.inner.seek(frame)
        }

        fn frames_rendered(&self) -> Frame {
            self.inner.frames_rendered()
        }

        fn loop_points(&self) -> Vec<Loop> {
            self.inner.loop_points()
        }

        fn metadata(&self) -> SongMetadata {
            self.inner.metadata()
        }

        fn label(&self) -> String {
            self.inner.label()
        }
    }

    fn clip(frames: usize, channels: u16) -> Arc<MemoryClip> {
        let samples = (0..frames * channels as usize).map(|i| (i % 30000) as i16).collect();
        Arc::new(MemoryClip::from_i16("clip", 44100, channels, samples).unwrap())
    }

    fn settings(whole_song: bool, chunk_frames: usize) -> RenderSettings {
        RenderSettings {
            whole_song_buffering: whole_song,
            chunk_frames,
            pre_render_frames: 100,
            whole_song_limit_mb: 1024,
        }
    }

    fn first_sample(view: PcmSlice<'_>) -> i16 {
        match view {
            PcmSlice::I16(s) => s[0],
            _ => panic!("expected i16"),
        }
    }

    #[test]
    fn test_whole_song_fill_reports_full_count() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(1024, 2)), settings(true, 256));
        buffer.fill_buffer().unwrap();
        assert_eq!(buffer.mode(), BufferMode::WholeSong);
        assert_eq!(buffer.count(), 1024 * 2);

        while buffer.frames_rendered() < 1024 {
            std::thread::yield_now();
        }
        assert_eq!(buffer.frames_rendered(), 1024);
        assert!(buffer.is_fully_rendered());
    }

    #[test]
    fn test_whole_song_frames_at_waits_for_data() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(5000, 1)), settings(true, 64));
        buffer.fill_buffer().unwrap();
        let view = buffer.frames_at(4000).unwrap();
        assert_eq!(first_sample(view), 4000);
        assert!(view.len() >= 1);
    }

    #[test]
    fn test_limit_forces_double_buffering() {
        let mut s = settings(true, 128);
        s.whole_song_limit_mb = 0;
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(1000, 2)), s);
        buffer.fill_buffer().unwrap();
        assert_eq!(buffer.mode(), BufferMode::DoubleBuffered);
        assert_eq!(buffer.count(), 128 * 2);
    }

    #[test]
    fn test_double_buffer_serves_sequential_chunks() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(1000, 1)), settings(false, 300));
        buffer.fill_buffer().unwrap();

        let mut position = 0;
        while position < 1000 {
            let view = buffer.frames_at(position).unwrap();
            assert_eq!(first_sample(view), position as i16);
            position += view.len();
        }
        assert_eq!(position, 1000);
        assert_eq!(buffer.frames_at(1000).unwrap().len(), 0);
    }

    #[test]
    fn test_swapped_chunk_is_fully_rendered() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(4000, 1)), settings(false, 100));
        buffer.fill_buffer().unwrap();
        for k in 1..10 {
            buffer.fill_buffer().unwrap();
            let view = buffer.frames_at(k * 100).unwrap();
            match view {
                PcmSlice::I16(s) => {
                    assert_eq!(s.len(), 100);
                    let expected: Vec<i16> = (k * 100..(k + 1) * 100).map(|i| i as i16).collect();
                    assert_eq!(s, expected.as_slice());
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_double_buffer_seek_rerenders() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(1000, 2)), settings(false, 100));
        buffer.fill_buffer().unwrap();

        let view = buffer.frames_at(777).unwrap();
        assert_eq!(first_sample(view), (777 * 2) as i16);
        assert_eq!(view.len(), 100 * 2);

        let view = buffer.frames_at(3).unwrap();
        assert_eq!(first_sample(view), 6);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(1024, 2)), settings(true, 64));
        buffer.fill_buffer().unwrap();
        buffer.release_buffer();
        assert_eq!(buffer.count(), 0);
        buffer.release_buffer();
        assert_eq!(buffer.count(), 0);

        // Usable again after release
        buffer.fill_buffer().unwrap();
        assert_eq!(buffer.count(), 2048);
    }

    #[test]
    fn test_release_without_fill() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(10, 1)), settings(false, 4));
        buffer.release_buffer();
        buffer.release_buffer();
        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.mode(), BufferMode::Empty);
    }

    #[test]
    fn test_release_during_double_buffer_render() {
        let mut buffer = RenderBuffer::new(MemoryDecoder::new(clip(100_000, 2)), settings(false, 8192));
        buffer.fill_buffer().unwrap();
        buffer.release_buffer();
        assert!(buffer.decoder().is_some());
    }

    #[test]
    fn test_decoded_rate_follows_double_buffer_worker() {
        let decoder = RateSwitchingDecoder::new(clip(100_000, 2), 48000);
        let mut buffer = RenderBuffer::new(decoder, settings(false, 256));
        buffer.open().unwrap();
        assert_eq!(buffer.decoded_sample_rate(), 44100);

        buffer.fill_buffer().unwrap();
        // The back render owns the decoder now
        assert!(buffer.decoder().is_none());
        assert_eq!(buffer.decoded_sample_rate(), 48000);
        assert_eq!(buffer.format().sample_rate, 44100);
    }

    #[test]
    fn test_decoded_rate_after_whole_song_pre_render() {
        let decoder = RateSwitchingDecoder::new(clip(50_000, 1), 32000);
        let mut buffer = RenderBuffer::new(decoder, settings(true, 64));
        buffer.fill_buffer().unwrap();
        assert_eq!(buffer.mode(), BufferMode::WholeSong);
        assert_eq!(buffer.decoded_sample_rate(), 32000);

        buffer.release_buffer();
        assert_eq!(buffer.decoded_sample_rate(), 32000);
    }
}
