//! Loop scheduler
//!
//! Walks a [`LoopTree`] and turns it into a linear frame stream by driving a
//! [`Transport`]. The scheduler holds no state besides the tree and the
//! transport's playhead, so a seek by the user at any time is picked up at
//! the next decision point: seeking past a loop skips it, seeking back into
//! an exited loop enters it again.
//!
//! Backward and alternating loops are played forward.

use super::loop_tree::{Loop, LoopNode, LoopTree};
use crate::audio::types::Frame;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

const NO_OVERRIDE: u64 = u64::MAX;

/// Settings that may change while a song plays.
///
/// Read at the start of every repetition cycle.
#[derive(Debug)]
pub struct LoopSettings {
    count_override: AtomicU64,
}

impl LoopSettings {
    pub fn new(count_override: Option<u32>) -> Self {
        Self {
            count_override: AtomicU64::new(count_override.map_or(NO_OVERRIDE, u64::from)),
        }
    }

    /// Replace the repeat count of every nested loop (None restores the song's counts)
    pub fn set_count_override(&self, count: Option<u32>) {
        self.count_override
            .store(count.map_or(NO_OVERRIDE, u64::from), Ordering::Relaxed);
    }

    pub fn count_override(&self) -> Option<u32> {
        match self.count_override.load(Ordering::Relaxed) {
            NO_OVERRIDE => None,
            n => Some(n as u32),
        }
    }

    /// Repeat count to use for a nested loop right now
    pub fn effective_count(&self, range: &Loop) -> u32 {
        self.count_override().unwrap_or(range.count)
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::new(None)
    }
}

/// What the scheduler needs from the player
pub trait Transport {
    /// Current playhead
    fn playhead(&self) -> Frame;

    /// Move the playhead
    fn seek_to(&mut self, frame: Frame);

    /// Play from the playhead towards `stop`, advancing the playhead.
    ///
    /// Returns early when playback is stopped or the playhead is moved by
    /// someone else.
    fn play_frames(&mut self, stop: Frame) -> Result<()>;

    /// True once playback has been asked to end
    fn is_stopped(&self) -> bool;
}

/// Drives one song's loop tree through a transport
pub struct LoopScheduler<'a, T: Transport> {
    transport: &'a mut T,
    settings: &'a LoopSettings,
}

impl<'a, T: Transport> LoopScheduler<'a, T> {
    pub fn new(transport: &'a mut T, settings: &'a LoopSettings) -> Self {
        Self { transport, settings }
    }

    /// Play the whole tree, repeating the root as often as its count says
    pub fn play_tree(&mut self, tree: &LoopTree) -> Result<()> {
        let root = tree.root();
        let mut repetitions = 0u32;
        loop {
            if self.transport.is_stopped() {
                return Ok(());
            }
            self.play_node(root)?;
            if self.transport.is_stopped() {
                return Ok(());
            }

            repetitions += 1;
            if !root.range.is_infinite() && repetitions >= root.range.count {
                return Ok(());
            }
            trace!("Repeating song, pass {}", repetitions + 1);
            self.transport.seek_to(root.start());
        }
    }

    /// Play the part of `node` that lies at or after the playhead
    pub fn play_node(&mut self, node: &LoopNode) -> Result<()> {
        // True while the playhead sits where it was put (entry or seek); only
        // then may a child starting exactly there be entered
        let mut placed = true;
        loop {
            if self.transport.is_stopped() {
                return Ok(());
            }
            let playhead = self.transport.playhead();
            // Entirely behind (or before) the playhead after a seek
            if playhead > node.stop() || playhead < node.start() {
                return Ok(());
            }

            let next = if placed {
                node.child_starting_at(playhead)
                    .or_else(|| node.next_segment(playhead))
            } else {
                node.next_segment(playhead)
            };
            placed = false;

            match next {
                None => {
                    self.transport.play_frames(node.stop())?;
                    if self.transport.is_stopped() || self.transport.playhead() == node.stop() {
                        return Ok(());
                    }
                    // Moved by a seek: decide again from the new position
                    placed = true;
                }
                Some(child) => {
                    self.transport.play_frames(child.start())?;
                    if self.transport.is_stopped() {
                        return Ok(());
                    }
                    if self.transport.playhead() != child.start() {
                        placed = true;
                        continue;
                    }
                    self.repeat(child)?;
                    // A sibling may start where this child stopped, or where a
                    // seek left the playhead
                    placed = true;
                }
            }
        }
    }

    fn repeat(&mut self, child: &LoopNode) -> Result<()> {
        let mut done = 0u32;
        loop {
            let count = self.settings.effective_count(&child.range);
            if count != 0 && done >= count {
                return Ok(());
            }
            if self.transport.is_stopped() {
                return Ok(());
            }

            trace!(
                "Loop [{}, {}) repetition {}/{}",
                child.start(),
                child.stop(),
                done + 1,
                if count == 0 { "inf".to_string() } else { count.to_string() }
            );
            self.transport.seek_to(child.start());
            self.play_node(child)?;

            if self.transport.is_stopped() || self.transport.playhead() != child.stop() {
                // Stopped, or the user seeked out of the loop
                return Ok(());
            }
            done += 1;
        }
    }
}
