//! Playback session
//!
//! One session is one run of the playback thread, from `play` until the
//! playlist ends, `stop` is called, or the output device fails. The thread
//! owns the current [`Song`] and the [`OutputBackend`]; the [`Player`]
//! talks to it only through [`PlayerShared`].
//!
//! [`Player`]: super::player::Player

use super::player::SongInfo;
use super::playlist::{Playlist, SongSource};
use super::scheduler::{LoopScheduler, LoopSettings, Transport};
use super::song::Song;
use crate::audio::types::Frame;
use crate::config::PlayerConfig;
use crate::error::{Error, Result};
use crate::output::{AudioOutput, OutputBackend, StreamState};
use anmp_common::events::{EventBus, PlayerEvent};
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Most frames handed to the output per write
pub const WRITE_FRAMES: Frame = 4096;

/// Back-off when the output is full
const OUTPUT_FULL_BACKOFF: Duration = Duration::from_millis(2);

/// Song change requested while a song plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SkipRequest {
    None = 0,
    Next = 1,
    Previous = 2,
}

impl SkipRequest {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SkipRequest::Next,
            2 => SkipRequest::Previous,
            _ => SkipRequest::None,
        }
    }
}

/// State shared between the player handle and the playback thread
pub struct PlayerShared {
    /// Current frame; recursive because the loop scheduler re-enters playback
    playhead: ReentrantMutex<Cell<Frame>>,
    /// Bumped by every user seek
    seek_generation: AtomicU64,

    stop: AtomicBool,
    skip: AtomicU8,
    paused: Mutex<bool>,
    resume: Condvar,

    running: Mutex<bool>,
    finished: Condvar,

    /// Master volume as f32 bits
    volume: AtomicU32,
    volume_dirty: AtomicBool,

    /// Mute flags of the current song's voices
    mute_mask: Mutex<Vec<bool>>,
    mute_dirty: AtomicBool,

    pub loop_settings: LoopSettings,
    current: Mutex<Option<SongInfo>>,
    frames_played: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PlayerShared {
    pub fn new(volume: f32, loop_count_override: Option<u32>) -> Self {
        Self {
            playhead: ReentrantMutex::new(Cell::new(0)),
            seek_generation: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            skip: AtomicU8::new(SkipRequest::None as u8),
            paused: Mutex::new(false),
            resume: Condvar::new(),
            running: Mutex::new(false),
            finished: Condvar::new(),
            volume: AtomicU32::new(volume.to_bits()),
            volume_dirty: AtomicBool::new(false),
            mute_mask: Mutex::new(Vec::new()),
            mute_dirty: AtomicBool::new(false),
            loop_settings: LoopSettings::new(loop_count_override),
            current: Mutex::new(None),
            frames_played: AtomicU64::new(0),
        }
    }

    pub fn playhead(&self) -> Frame {
        self.playhead.lock().get()
    }

    /// Move the playhead on behalf of the user
    pub fn user_seek(&self, frame: Frame) {
        let guard = self.playhead.lock();
        guard.set(frame);
        self.seek_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn set_playhead(&self, frame: Frame) {
        self.playhead.lock().set(frame);
    }

    /// Advance unless a user seek happened since `generation` was read
    fn advance_playhead(&self, generation: u64, frame: Frame) -> bool {
        let guard = self.playhead.lock();
        if self.seek_generation.load(Ordering::Acquire) != generation {
            return false;
        }
        guard.set(frame);
        true
    }

    fn generation(&self) -> u64 {
        self.seek_generation.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _paused = lock(&self.paused);
        self.resume.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_skip(&self, skip: SkipRequest) {
        self.skip.store(skip as u8, Ordering::Release);
        let _paused = lock(&self.paused);
        self.resume.notify_all();
    }

    fn take_skip(&self) -> SkipRequest {
        SkipRequest::from_u8(self.skip.swap(SkipRequest::None as u8, Ordering::AcqRel))
    }

    fn interrupted(&self) -> bool {
        self.stop_requested() || self.skip.load(Ordering::Acquire) != SkipRequest::None as u8
    }

    pub fn set_paused(&self, paused: bool) {
        let mut flag = lock(&self.paused);
        *flag = paused;
        self.resume.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.paused)
    }

    /// Mark a session as started; false if one is already running
    pub fn begin_session(&self) -> bool {
        let mut running = lock(&self.running);
        if *running {
            return false;
        }
        *running = true;
        self.stop.store(false, Ordering::Release);
        self.skip.store(SkipRequest::None as u8, Ordering::Release);
        true
    }

    fn end_session(&self) {
        let mut running = lock(&self.running);
        *running = false;
        self.finished.notify_all();
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    /// Wait for the running session to end; false on timeout
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let running = lock(&self.running);
        let (running, _) = self
            .finished
            .wait_timeout_while(running, timeout, |running| *running)
            .unwrap_or_else(PoisonError::into_inner);
        !*running
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Release);
        self.volume_dirty.store(true, Ordering::Release);
    }

    /// Flip one voice of the current song; returns the new flag
    pub fn toggle_mute(&self, voice: usize) -> Result<bool> {
        let mut mask = lock(&self.mute_mask);
        if mask.is_empty() {
            return Err(Error::InvalidState("no song is playing".to_string()));
        }
        let count = mask.len();
        let flag = mask
            .get_mut(voice)
            .ok_or_else(|| Error::FormatMismatch(format!("voice {} out of range ({} voices)", voice, count)))?;
        *flag = !*flag;
        self.mute_dirty.store(true, Ordering::Release);
        Ok(*flag)
    }

    pub fn current(&self) -> Option<SongInfo> {
        lock(&self.current).clone()
    }

    fn set_current(&self, info: Option<SongInfo>) {
        *lock(&self.current) = info;
    }

    /// Frames accepted by outputs since the player was created
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }
}

/// Connects the loop scheduler to one song and the output
struct SessionTransport<'a> {
    song: &'a mut Song,
    output: &'a mut OutputBackend,
    shared: &'a PlayerShared,
    events: &'a EventBus,
    /// Whether the output was initialized for a real-time callback
    realtime: bool,
}

impl SessionTransport<'_> {
    fn apply_pending_changes(&mut self) {
        if self.shared.volume_dirty.swap(false, Ordering::AcqRel) {
            self.output.set_volume(self.shared.volume());
        }
        if self.shared.mute_dirty.swap(false, Ordering::AcqRel) {
            let mask = lock(&self.shared.mute_mask).clone();
            for (voice, muted) in mask.iter().enumerate() {
                let current = self.song.format().voices.get(voice).map(|v| v.muted);
                if current.is_some_and(|m| m != *muted) {
                    if let Err(e) = self.song.toggle_voice_mute(voice) {
                        warn!("{}", e);
                    }
                }
            }
            self.output.set_mute_mask(&self.song.format().mute_mask());
        }
    }

    /// Reinitialize the output when the decoder switched sample rate
    fn follow_sample_rate(&mut self) -> Result<()> {
        if !self.song.rebuild_loop_tree_if_needed() {
            return Ok(());
        }
        info!(
            "{} now decodes at {} Hz, reinitializing output",
            self.song.label(),
            self.song.format().sample_rate
        );
        let started = self.output.stream_state() == StreamState::Started;
        if started {
            self.output.drain()?;
            self.output.stop()?;
        }
        self.output.init(self.song.format(), self.realtime)?;
        self.output.set_voice_config(self.song.format());
        if started {
            self.output.start()?;
        }
        Ok(())
    }

    /// Block while paused; the output is stopped for the duration
    fn wait_while_paused(&mut self) -> Result<()> {
        if !self.shared.is_paused() {
            return Ok(());
        }
        self.output.stop()?;
        self.events.emit(PlayerEvent::IsPlayingChanged {
            playing: false,
            error: None,
            timestamp: chrono::Utc::now(),
        });
        debug!("Playback paused at frame {}", self.shared.playhead());

        {
            let mut paused = lock(&self.shared.paused);
            while *paused && !self.shared.interrupted() {
                paused = self
                    .shared
                    .resume
                    .wait(paused)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        if self.shared.interrupted() {
            return Ok(());
        }

        self.output.start()?;
        self.events.emit(PlayerEvent::IsPlayingChanged {
            playing: true,
            error: None,
            timestamp: chrono::Utc::now(),
        });
        debug!("Playback resumed at frame {}", self.shared.playhead());
        Ok(())
    }
}

impl Transport for SessionTransport<'_> {
    fn playhead(&self) -> Frame {
        self.shared.playhead()
    }

    fn seek_to(&mut self, frame: Frame) {
        self.shared.set_playhead(frame);
    }

    fn play_frames(&mut self, stop: Frame) -> Result<()> {
        self.follow_sample_rate()?;
        let generation = self.shared.generation();
        let channels = self.song.format().channels() as usize;

        loop {
            if self.is_stopped() {
                return Ok(());
            }
            self.wait_while_paused()?;
            if self.is_stopped() {
                return Ok(());
            }
            if self.shared.generation() != generation {
                // User seek: drop queued audio and let the scheduler decide again
                self.output.discard();
                return Ok(());
            }

            let position = self.shared.playhead();
            if position >= stop {
                return Ok(());
            }
            self.apply_pending_changes();

            let pcm = self.song.frames_at(position)?;
            if pcm.is_empty() || channels == 0 {
                // Nothing rendered past the end of the source
                self.shared.advance_playhead(generation, stop);
                return Ok(());
            }
            let frames = (stop - position).min(pcm.len() / channels).min(WRITE_FRAMES);

            let written = self.output.write(pcm, frames, 0)?;
            if written == 0 {
                std::thread::sleep(OUTPUT_FULL_BACKOFF);
                continue;
            }

            self.shared.frames_played.fetch_add(written as u64, Ordering::Relaxed);
            if self.shared.advance_playhead(generation, position + written) {
                self.events.emit(PlayerEvent::PlayheadChanged {
                    frame: (position + written) as u64,
                    timestamp: chrono::Utc::now(),
                });
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.shared.interrupted()
    }
}

/// Everything the playback thread needs
pub struct Session {
    pub config: PlayerConfig,
    pub shared: Arc<PlayerShared>,
    pub playlist: Arc<Mutex<Playlist>>,
    pub events: EventBus,
}

impl Session {
    /// Body of the playback thread
    pub fn run(self) {
        info!("Playback session started");
        let error = self.play_playlist().err();
        if let Some(e) = &error {
            error!("Playback session ended: {}", e);
        }

        self.shared.set_current(None);
        self.shared.set_playhead(0);
        self.shared.end_session();
        self.events.emit(PlayerEvent::IsPlayingChanged {
            playing: false,
            error: error.map(|e| e.to_string()),
            timestamp: chrono::Utc::now(),
        });
        info!("Playback session finished");
    }

    fn play_playlist(&self) -> Result<()> {
        let mut output = OutputBackend::from_settings(&self.config.output)?;
        output.open()?;

        let result = self.play_sources(&mut output);

        if result.is_ok() && !self.shared.stop_requested() {
            if let Err(e) = output.drain() {
                warn!("Failed to drain output: {}", e);
            }
        }
        let underruns = output.underruns();
        output.close();
        self.events.emit(PlayerEvent::Diagnostics {
            underruns,
            timestamp: chrono::Utc::now(),
        });
        if underruns > 0 {
            info!("Output reported {} underruns", underruns);
        }
        result
    }

    fn play_sources(&self, output: &mut OutputBackend) -> Result<()> {
        let mut source = lock(&self.playlist).current_or_first().cloned();

        while let Some(current) = source {
            if self.shared.stop_requested() {
                return Ok(());
            }

            match self.play_song(current, output) {
                Ok(()) => {}
                Err(e) if e.is_source_local() => {
                    let mut playlist = lock(&self.playlist);
                    let path = playlist.current().and_then(|s| s.path().map(|p| p.to_path_buf()));
                    playlist.mark_unplayable(&e.to_string());
                    self.events.emit(PlayerEvent::SongUnplayable {
                        path,
                        reason: e.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                    source = playlist.current().cloned();
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self.shared.stop_requested() {
                return Ok(());
            }
            let mut playlist = lock(&self.playlist);
            source = match self.shared.take_skip() {
                SkipRequest::Previous => playlist.previous().cloned(),
                SkipRequest::Next | SkipRequest::None => playlist.next().cloned(),
            };
        }

        info!("End of playlist");
        Ok(())
    }

    fn play_song(&self, source: SongSource, output: &mut OutputBackend) -> Result<()> {
        let mut song = Song::new(source, self.config.render.clone());
        song.open(self.config.playback.normalize_loudness)?;
        song.fill_buffer()?;
        song.rebuild_loop_tree_if_needed();

        let info = SongInfo::from_song(&song);
        self.shared.set_current(Some(info.clone()));
        *lock(&self.shared.mute_mask) = song.format().mute_mask();
        self.shared.mute_dirty.store(false, Ordering::Release);
        self.events.emit(PlayerEvent::CurrentSongChanged {
            song_id: info.id,
            path: info.path.clone(),
            total_frames: info.total_frames as u64,
            sample_rate: info.sample_rate,
            timestamp: chrono::Utc::now(),
        });

        // Finish the previous song before reconfiguring
        if output.stream_state() == StreamState::Started {
            output.drain()?;
            output.stop()?;
        }
        output.init(song.format(), self.config.output.realtime)?;
        output.set_voice_config(song.format());
        output.set_volume(self.shared.volume());
        output.set_gain(song.gain());
        self.shared.volume_dirty.store(false, Ordering::Release);
        output.start()?;

        let tree = song.loop_tree();
        self.shared.set_playhead(tree.root().start());
        let result = {
            let mut transport = SessionTransport {
                song: &mut song,
                output: &mut *output,
                shared: &self.shared,
                events: &self.events,
                realtime: self.config.output.realtime,
            };
            LoopScheduler::new(&mut transport, &self.shared.loop_settings).play_tree(&tree)
        };

        if self.shared.interrupted() {
            output.stop()?;
        }
        song.close();
        *lock(&self.shared.mute_mask) = Vec::new();
        debug!("Finished {} at frame {}", info.label, self.shared.playhead());
        result
    }
}
