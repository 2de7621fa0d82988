//! Hand-off of mixed audio to a real-time callback
//!
//! One staging block, sized to the device's callback block, moves between a
//! writer thread and the real-time callback:
//!
//! - The writer waits on the condvar until the block is free, fills it,
//!   sets `ready` and notifies.
//! - The callback only ever calls `try_lock`. If the lock is contended or
//!   the block is not ready, it zero-fills its output, counts an underrun
//!   and returns. A block whose size does not match the callback block is
//!   discarded and counted as a mismatch. The callback never waits,
//!   allocates or logs.
//!
//! Underrun and mismatch counters are read out of band by the player.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Staging {
    ready: bool,
    /// Frames in the staged block
    frames: usize,
    channels: usize,
    /// Interleaved samples, `frames * channels` long
    data: Vec<f32>,
}

/// Outcome of offering a block to the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The block is staged
    Accepted,
    /// The previous block was not consumed in time
    TimedOut,
    /// The hand-off was shut down
    Closed,
}

/// Staging block shared between a writer thread and a real-time callback
#[derive(Debug)]
pub struct RealtimeHandoff {
    staging: Mutex<Staging>,
    consumed: Condvar,
    /// Callback block size as last reported by the device
    device_frames: AtomicUsize,
    /// Whether the callback should expect audio (false while stopped)
    active: AtomicBool,
    closed: AtomicBool,
    underruns: AtomicU64,
    mismatches: AtomicU64,
}

impl RealtimeHandoff {
    pub fn new(block_frames: usize, channels: usize) -> Self {
        Self {
            staging: Mutex::new(Staging {
                ready: false,
                frames: block_frames,
                channels,
                data: vec![0.0; block_frames * channels],
            }),
            consumed: Condvar::new(),
            device_frames: AtomicUsize::new(block_frames),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            mismatches: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames the writer must put in each block
    pub fn block_frames(&self) -> usize {
        self.device_frames.load(Ordering::Acquire)
    }

    /// Record a new callback block size (device reconfiguration)
    pub fn set_block_frames(&self, frames: usize) {
        self.device_frames.store(frames, Ordering::Release);
    }

    /// Change channel count; drops any staged block
    pub fn set_channels(&self, channels: usize) {
        let mut staging = self.lock();
        staging.channels = channels;
        staging.ready = false;
        self.consumed.notify_all();
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Offer one interleaved block, waiting up to `timeout` for the previous
    /// one to be consumed.
    pub fn publish(&self, block: &[f32], timeout: Duration) -> Publish {
        let deadline = Instant::now() + timeout;
        let mut staging = self.lock();

        while staging.ready {
            if self.closed.load(Ordering::Acquire) {
                return Publish::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Publish::TimedOut;
            }
            staging = self
                .consumed
                .wait_timeout(staging, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        if self.closed.load(Ordering::Acquire) {
            return Publish::Closed;
        }

        let channels = staging.channels.max(1);
        staging.frames = block.len() / channels;
        staging.data.clear();
        staging.data.extend_from_slice(block);
        staging.ready = true;
        Publish::Accepted
    }

    /// Wait until the staged block has been taken; false on timeout or close
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut staging = self.lock();
        while staging.ready {
            let now = Instant::now();
            if now >= deadline || self.closed.load(Ordering::Acquire) {
                return false;
            }
            staging = self
                .consumed
                .wait_timeout(staging, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    /// Drop a staged block without playing it
    pub fn clear(&self) {
        let mut staging = self.lock();
        staging.ready = false;
        self.consumed.notify_all();
    }

    /// Wake and refuse all writers
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.active.store(false, Ordering::Release);
        self.clear();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Real-time side: take the staged block if it is ready and `frames` long.
    ///
    /// Never blocks. On `None` the caller must output silence; the miss has
    /// already been counted (unless the hand-off is inactive).
    pub fn try_take(&self, frames: usize) -> Option<ReadyBlock<'_>> {
        let mut guard = match self.staging.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.count_miss();
                return None;
            }
        };

        if !guard.ready {
            self.count_miss();
            return None;
        }
        if guard.frames != frames {
            // Sized for the old callback block: discard it so the writer can
            // publish at the new size
            self.mismatches.fetch_add(1, Ordering::Relaxed);
            guard.ready = false;
            self.consumed.notify_one();
            return None;
        }

        Some(ReadyBlock { guard, handoff: self })
    }

    fn count_miss(&self) {
        if self.active.load(Ordering::Relaxed) {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Callbacks that found no ready block while active
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Callbacks whose block size differed from the staged block
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }
}

/// A ready block held by the real-time callback; released on drop
pub struct ReadyBlock<'a> {
    guard: MutexGuard<'a, Staging>,
    handoff: &'a RealtimeHandoff,
}

impl ReadyBlock<'_> {
    pub fn frames(&self) -> usize {
        self.guard.frames
    }

    pub fn channels(&self) -> usize {
        self.guard.channels
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.guard.data
    }

    /// De-interleave one channel into a device buffer; missing channels are silent
    pub fn copy_channel(&self, channel: usize, out: &mut [f32]) {
        let channels = self.guard.channels;
        if channel >= channels {
            out.fill(0.0);
            return;
        }
        for (dest, frame) in out.iter_mut().zip(self.guard.data.chunks_exact(channels)) {
            *dest = frame[channel];
        }
    }
}

impl Drop for ReadyBlock<'_> {
    fn drop(&mut self) {
        self.guard.ready = false;
        self.handoff.consumed.notify_one();
    }
}
