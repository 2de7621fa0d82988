//! Test helpers for anmp-ap integration tests
//!
//! - Audio generation (ramps in memory and as WAV files)
//! - Player construction with headless backends
//! - Event recording

#![allow(dead_code)]

pub mod audio_generator;

pub use audio_generator::{looped_ramp, ramp_clip, read_wav_i16, write_ramp_wav};

use anmp_ap::config::{BackendKind, PlayerConfig, WavSampleFormat};
use anmp_ap::Player;
use anmp_common::events::{EventBus, PlayerEvent, Subscription};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Generous bound for a headless playback session
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(20);

/// Config for the null backend with small chunks
pub fn null_config() -> PlayerConfig {
    let mut config = PlayerConfig::default();
    config.output.backend = BackendKind::Null;
    config.render.chunk_frames = 256;
    config.render.pre_render_frames = 128;
    config.playback.normalize_loudness = false;
    config
}

/// Config writing 16-bit mono audio to `path`
pub fn wav_config(path: &Path) -> PlayerConfig {
    let mut config = null_config();
    config.output.backend = BackendKind::Wav;
    config.output.wav_path = path.to_path_buf();
    config.output.wav_sample_format = WavSampleFormat::I16;
    config.output.channels = Some(1);
    config
}

/// Records events emitted on a bus; playhead events are only counted
pub struct EventLog {
    events: Arc<Mutex<Vec<PlayerEvent>>>,
    playhead_events: Arc<AtomicU64>,
    _subscription: Subscription,
}

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let playhead_events = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&events);
        let playheads = Arc::clone(&playhead_events);
        let subscription = bus.listen(move |event| match event {
            PlayerEvent::PlayheadChanged { .. } => {
                playheads.fetch_add(1, Ordering::Relaxed);
            }
            other => sink.lock().unwrap().push(other.clone()),
        });
        Self {
            events,
            playhead_events,
            _subscription: subscription,
        }
    }

    pub fn playhead_events(&self) -> u64 {
        self.playhead_events.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events().iter().filter(|e| e.event_type() == event_type).count()
    }

    /// Wait until a recorded event matches `predicate`
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&PlayerEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.events().iter().any(&predicate) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// Player plus a log of its events
pub fn player_with_log(config: PlayerConfig) -> (Player, EventLog) {
    let bus = EventBus::default();
    let log = EventLog::attach(&bus);
    (Player::new(config, bus), log)
}

/// Poll `condition` until it holds; false on timeout
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}
