//! Event types and the EventBus for ANMP
//!
//! Player notifications (playhead, current song, play state) are fired from
//! the control and playback threads. Consumers either:
//! - `subscribe()` for an async `broadcast::Receiver` (GUI/event loops), or
//! - `listen()` a closure and keep the returned [`Subscription`] alive.
//!
//! Dropping a `Subscription` unregisters its listener. No raw context
//! pointers are involved in the registration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Player notification events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Playhead moved (frame index into the current song)
    PlayheadChanged {
        frame: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A different song became current
    CurrentSongChanged {
        song_id: Uuid,
        path: Option<PathBuf>,
        total_frames: u64,
        sample_rate: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback started or stopped; `error` is set when a failure ended playback
    IsPlayingChanged {
        playing: bool,
        error: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A playlist entry could not be played and was skipped
    SongUnplayable {
        path: Option<PathBuf>,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Out-of-band diagnostics collected from the output backend
    Diagnostics {
        underruns: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Output volume changed
    VolumeChanged {
        volume: f32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PlayerEvent {
    /// Event type name (matches the serialized `type` tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::PlayheadChanged { .. } => "PlayheadChanged",
            PlayerEvent::CurrentSongChanged { .. } => "CurrentSongChanged",
            PlayerEvent::IsPlayingChanged { .. } => "IsPlayingChanged",
            PlayerEvent::SongUnplayable { .. } => "SongUnplayable",
            PlayerEvent::Diagnostics { .. } => "Diagnostics",
            PlayerEvent::VolumeChanged { .. } => "VolumeChanged",
        }
    }
}

type Listener = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl ListenerRegistry {
    fn remove(&self, id: u64) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Listener> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Handle for a listener registered with [`EventBus::listen`]
///
/// The listener stays registered for as long as this handle lives.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    /// Unregister the listener now
    pub fn unsubscribe(self) {
        // Drop does the work
    }

    /// Listener id (unique per bus)
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Central event distribution bus
///
/// Uses `tokio::broadcast` for async subscribers plus a list of owned
/// closures for synchronous observers. Publishing never blocks: slow
/// broadcast receivers lag instead of stalling the emitter.
///
/// # Examples
///
/// ```
/// use anmp_common::events::{EventBus, PlayerEvent};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let bus = EventBus::new(16);
/// let seen = Arc::new(AtomicUsize::new(0));
/// let seen_clone = Arc::clone(&seen);
/// let subscription = bus.listen(move |_event| {
///     seen_clone.fetch_add(1, Ordering::SeqCst);
/// });
///
/// bus.emit(PlayerEvent::VolumeChanged { volume: 0.5, timestamp: chrono::Utc::now() });
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
///
/// drop(subscription);
/// bus.emit(PlayerEvent::VolumeChanged { volume: 0.7, timestamp: chrono::Utc::now() });
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    listeners: Arc<ListenerRegistry>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per receiver
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            listeners: Arc::new(ListenerRegistry::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Subscribe to all future events (async receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Register a synchronous listener
    ///
    /// The closure runs on the emitting thread; keep it short and hand work
    /// off to another thread (e.g. the GUI thread) if it needs to do more.
    pub fn listen<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = match self.listeners.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push((id, Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Emit an event to every listener and broadcast subscriber
    ///
    /// Returns the number of broadcast receivers that got the event.
    pub fn emit(&self, event: PlayerEvent) -> usize {
        for listener in self.listeners.snapshot() {
            listener(&event);
        }
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of registered synchronous listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.snapshot().len()
    }

    /// Number of active broadcast receivers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured broadcast capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
