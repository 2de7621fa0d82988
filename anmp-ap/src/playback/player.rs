//! Player handle
//!
//! Control surface used by the binary and by GUI collaborators. Every call
//! returns promptly; the work happens on the playback thread started by
//! [`Player::play`]. Notifications go out through the [`EventBus`] given to
//! [`Player::new`].

use super::playlist::{Playlist, SongSource};
use super::render_buffer::BufferMode;
use super::session::{PlayerShared, Session, SkipRequest};
use super::song::Song;
use crate::audio::decoder::SongMetadata;
use crate::audio::types::{Frame, Voice};
use crate::config::PlayerConfig;
use crate::error::{Error, Result};
use anmp_common::events::{EventBus, PlayerEvent};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Snapshot of the song being played
#[derive(Debug, Clone, PartialEq)]
pub struct SongInfo {
    pub id: Uuid,
    pub label: String,
    pub path: Option<PathBuf>,
    pub total_frames: Frame,
    pub sample_rate: u32,
    pub channels: u16,
    pub voices: Vec<Voice>,
    pub gain: f32,
    pub metadata: SongMetadata,
    pub buffer_mode: BufferMode,
}

impl SongInfo {
    pub(crate) fn from_song(song: &Song) -> Self {
        Self {
            id: song.id(),
            label: song.label(),
            path: song.path().map(PathBuf::from),
            total_frames: song.total_frames(),
            sample_rate: song.format().sample_rate,
            channels: song.format().channels(),
            voices: song.format().voices.clone(),
            gain: song.gain(),
            metadata: song.metadata().clone(),
            buffer_mode: song.buffer_mode(),
        }
    }
}

pub struct Player {
    config: Mutex<PlayerConfig>,
    events: EventBus,
    shared: Arc<PlayerShared>,
    playlist: Arc<Mutex<Playlist>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Player {
    pub fn new(config: PlayerConfig, events: EventBus) -> Self {
        let shared = Arc::new(PlayerShared::new(
            config.output.volume,
            config.playback.loop_count_override,
        ));
        Self {
            config: Mutex::new(config),
            events,
            shared,
            playlist: Arc::new(Mutex::new(Playlist::new())),
            worker: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared playlist; the playback thread reads it between songs
    pub fn playlist(&self) -> Arc<Mutex<Playlist>> {
        Arc::clone(&self.playlist)
    }

    pub fn enqueue(&self, source: impl Into<SongSource>) {
        lock(&self.playlist).push(source);
    }

    /// Start the playback thread, or resume if paused
    pub fn play(&self) -> Result<()> {
        if self.shared.is_running() {
            if self.shared.is_paused() {
                self.shared.set_paused(false);
            }
            return Ok(());
        }
        if lock(&self.playlist).is_empty() {
            return Err(Error::InvalidState("playlist is empty".to_string()));
        }

        let mut worker = lock(&self.worker);
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }
        if !self.shared.begin_session() {
            return Ok(());
        }
        self.shared.set_paused(false);

        let session = Session {
            config: lock(&self.config).clone(),
            shared: Arc::clone(&self.shared),
            playlist: Arc::clone(&self.playlist),
            events: self.events.clone(),
        };
        self.events.emit(PlayerEvent::IsPlayingChanged {
            playing: true,
            error: None,
            timestamp: chrono::Utc::now(),
        });

        let spawned = thread::Builder::new()
            .name("anmp-playback".to_string())
            .spawn(move || session.run());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.request_stop();
                Err(Error::Io(e))
            }
        }
    }

    /// Pause without leaving the current song
    pub fn pause(&self) {
        if self.shared.is_running() {
            self.shared.set_paused(true);
        }
    }

    /// End the session; the playlist keeps its position
    pub fn stop(&self) {
        self.shared.request_stop();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                tracing::error!("Playback thread panicked");
            }
        }
        self.shared.set_paused(false);
        self.shared.user_seek(0);
        debug!("Player stopped");
    }

    pub fn next(&self) {
        if self.shared.is_running() {
            self.shared.request_skip(SkipRequest::Next);
        } else {
            lock(&self.playlist).next();
        }
    }

    pub fn previous(&self) {
        if self.shared.is_running() {
            self.shared.request_skip(SkipRequest::Previous);
        } else {
            lock(&self.playlist).previous();
        }
    }

    /// Move the playhead of the current song
    pub fn seek_to(&self, frame: Frame) {
        self.shared.user_seek(frame);
        self.events.emit(PlayerEvent::PlayheadChanged {
            frame: frame as u64,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn position(&self) -> Frame {
        self.shared.playhead()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.is_running() && !self.shared.is_paused()
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::Config(format!("volume must be within 0.0-1.0, got {}", volume)));
        }
        self.shared.set_volume(volume);
        self.events.emit(PlayerEvent::VolumeChanged {
            volume,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Change the mixdown target; only while no session runs
    pub fn set_output_channels(&self, channels: Option<u16>) -> Result<()> {
        if self.shared.is_running() {
            return Err(Error::InvalidState(
                "output channels cannot change during playback".to_string(),
            ));
        }
        let mut config = lock(&self.config);
        let mut candidate = config.clone();
        candidate.output.channels = channels;
        candidate.validate()?;
        *config = candidate;
        info!("Output channels set to {:?}", channels);
        Ok(())
    }

    /// Flip the mute flag of one voice of the current song
    pub fn toggle_voice_mute(&self, voice: usize) -> Result<bool> {
        self.shared.toggle_mute(voice)
    }

    /// Replace the repeat count of nested loops; None restores the songs' counts
    pub fn set_loop_count_override(&self, count: Option<u32>) {
        self.shared.loop_settings.set_count_override(count);
    }

    pub fn loop_count_override(&self) -> Option<u32> {
        self.shared.loop_settings.count_override()
    }

    pub fn current_song(&self) -> Option<SongInfo> {
        self.shared.current()
    }

    /// Frames accepted by the output since the player was created
    pub fn frames_played(&self) -> u64 {
        self.shared.frames_played()
    }

    /// Wait for the session to end by itself; false on timeout
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        if !self.shared.wait_finished(timeout) {
            return false;
        }
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}
