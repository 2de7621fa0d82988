//! Output that discards audio
//!
//! Accepts every write immediately and counts the frames. Used for headless
//! runs and as the default backend.

use super::{AudioOutput, OutputState};
use crate::audio::types::{Frame, PcmSlice, SongFormat};
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct NullOutput {
    state: OutputState,
    frames_written: Arc<AtomicU64>,
}

impl NullOutput {
    pub fn new(out_channels: Option<u16>, volume: f32) -> Self {
        Self {
            state: OutputState::new(out_channels, volume),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of accepted frames
    pub fn frame_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames_written)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }
}

impl AudioOutput for NullOutput {
    fn open(&mut self) -> Result<()> {
        self.state.mark_opened();
        Ok(())
    }

    fn init(&mut self, format: &SongFormat, _realtime: bool) -> Result<()> {
        self.state.mark_initialized(format)?;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.mark_started()
    }

    fn stop(&mut self) -> Result<()> {
        self.state.mark_stopped();
        Ok(())
    }

    fn close(&mut self) {
        debug!("Null output closed after {} frames", self.frames_written());
        self.state.mark_closed();
    }

    fn write(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<Frame> {
        let (accepted, _) = self.state.mix(pcm, frames, offset)?;
        self.frames_written.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn discard(&mut self) {}

    fn output_state(&self) -> &OutputState {
        &self.state
    }

    fn output_state_mut(&mut self) -> &mut OutputState {
        &mut self.state
    }
}
