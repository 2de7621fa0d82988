//! JACK output
//!
//! ```text
//! ┌──────────────────┐  mix + resample  ┌───────────────┐  try_lock  ┌──────────────┐
//! │ playback thread  │ ───────────────► │ staging block │ ◄───────── │ JACK process │
//! │ (write)          │  wait on condvar │ (handoff)     │  never     │ callback     │
//! └──────────────────┘                  └───────────────┘  blocks    └──────────────┘
//! ```
//!
//! The client is activated at `init` with one output port per mixdown
//! channel. While stopped the callback outputs silence without counting
//! underruns. Resampler output that does not fill a whole JACK block is
//! carried over to the next `write`.

use super::realtime::{Publish, RealtimeHandoff};
use super::{AudioOutput, OutputState};
use crate::audio::resampler::StreamingResampler;
use crate::audio::types::{Frame, PcmSlice, SongFormat};
use crate::error::{Error, Result};
use jack::{AsyncClient, AudioOut, Client, ClientOptions, Control, Port, PortFlags, ProcessScope};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest wait for the callback to take a block
const MIN_PUBLISH_WAIT: Duration = Duration::from_millis(50);

struct Processor {
    ports: Vec<Port<AudioOut>>,
    handoff: Arc<RealtimeHandoff>,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let n_frames = ps.n_frames() as usize;

        match self.handoff.try_take(n_frames) {
            Some(block) => {
                for (channel, port) in self.ports.iter_mut().enumerate() {
                    block.copy_channel(channel, port.as_mut_slice(ps));
                }
            }
            None => {
                for port in self.ports.iter_mut() {
                    port.as_mut_slice(ps).fill(0.0);
                }
            }
        }

        Control::Continue
    }

    fn buffer_size(&mut self, _client: &Client, size: jack::Frames) -> Control {
        self.handoff.set_block_frames(size as usize);
        Control::Continue
    }
}

struct Notifications {
    xruns: Arc<AtomicU64>,
    sample_rate: Arc<AtomicU32>,
}

impl jack::NotificationHandler for Notifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        self.sample_rate.store(srate, Ordering::Release);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        self.xruns.fetch_add(1, Ordering::Relaxed);
        Control::Continue
    }
}

type ActiveClient = AsyncClient<Notifications, Processor>;

/// Output through a JACK client
pub struct JackOutput {
    state: OutputState,
    client_name: String,
    /// Open but inactive client
    client: Option<Client>,
    active: Option<ActiveClient>,
    port_count: usize,
    handoff: Arc<RealtimeHandoff>,
    xruns: Arc<AtomicU64>,
    sample_rate: Arc<AtomicU32>,
    resampler: Option<StreamingResampler>,
    /// Resampled, interleaved audio not yet handed to the callback
    pending: Vec<f32>,
}

impl JackOutput {
    pub fn new(client_name: &str, out_channels: Option<u16>, volume: f32) -> Self {
        Self {
            state: OutputState::new(out_channels, volume),
            client_name: client_name.to_string(),
            client: None,
            active: None,
            port_count: 0,
            handoff: Arc::new(RealtimeHandoff::new(0, 0)),
            xruns: Arc::new(AtomicU64::new(0)),
            sample_rate: Arc::new(AtomicU32::new(0)),
            resampler: None,
            pending: Vec::new(),
        }
    }

    /// Server sample rate
    pub fn device_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    fn publish_wait(&self) -> Duration {
        let rate = self.device_rate().max(1) as u64;
        let block = self.handoff.block_frames() as u64;
        Duration::from_millis(block * 4000 / rate).max(MIN_PUBLISH_WAIT)
    }

    /// Deactivate and get the plain client back, dropping our ports
    fn deactivate(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        self.handoff.set_active(false);
        let (client, _notifications, processor) = active
            .deactivate()
            .map_err(|e| Error::Device(format!("Failed to deactivate JACK client: {}", e)))?;
        for port in processor.ports {
            if let Err(e) = client.unregister_port(port) {
                warn!("Failed to unregister JACK port: {}", e);
            }
        }
        self.port_count = 0;
        self.client = Some(client);
        Ok(())
    }

    /// Register `channels` ports, activate and connect to physical playback ports
    fn activate(&mut self, channels: usize) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| Error::Device("JACK client is not open".to_string()))?;

        let mut ports = Vec::with_capacity(channels);
        let mut names = Vec::with_capacity(channels);
        for i in 0..channels {
            let port = client
                .register_port(&format!("out_{}", i + 1), AudioOut::default())
                .map_err(|e| Error::Device(format!("Failed to register JACK port: {}", e)))?;
            names.push(port.name().unwrap_or_default());
            ports.push(port);
        }

        let processor = Processor {
            ports,
            handoff: Arc::clone(&self.handoff),
        };
        let notifications = Notifications {
            xruns: Arc::clone(&self.xruns),
            sample_rate: Arc::clone(&self.sample_rate),
        };
        let active = client
            .activate_async(notifications, processor)
            .map_err(|e| Error::Device(format!("Failed to activate JACK client: {}", e)))?;

        let physical = active
            .as_client()
            .ports(None, None, PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL);
        for (ours, target) in names.iter().zip(&physical) {
            if let Err(e) = active.as_client().connect_ports_by_name(ours, target) {
                warn!("Failed to connect {} -> {}: {}", ours, target, e);
            }
        }

        debug!("JACK client active with {} ports", channels);
        self.port_count = channels;
        self.active = Some(active);
        Ok(())
    }

    /// Hand full blocks from `pending` to the callback.
    ///
    /// Returns false if the callback did not take a block in time.
    fn flush_blocks(&mut self) -> Result<bool> {
        let block = self.handoff.block_frames() * self.port_count;
        if block == 0 {
            self.pending.clear();
            return Ok(true);
        }
        let wait = self.publish_wait();

        let mut consumed = 0;
        let mut complete = true;
        while self.pending.len() - consumed >= block {
            match self.handoff.publish(&self.pending[consumed..consumed + block], wait) {
                Publish::Accepted => consumed += block,
                Publish::TimedOut => {
                    complete = false;
                    break;
                }
                Publish::Closed => return Err(Error::Device("JACK output closed".to_string())),
            }
        }
        self.pending.drain(..consumed);
        Ok(complete)
    }
}

impl AudioOutput for JackOutput {
    fn open(&mut self) -> Result<()> {
        if self.client.is_some() || self.active.is_some() {
            return Ok(());
        }
        let (client, _status) = Client::new(&self.client_name, ClientOptions::NO_START_SERVER)
            .map_err(|e| Error::Device(format!("Failed to create JACK client: {}", e)))?;

        let sample_rate = client.sample_rate() as u32;
        let buffer_size = client.buffer_size() as usize;
        info!(
            "JACK client '{}': {} Hz, {} frames per block",
            client.name(),
            sample_rate,
            buffer_size
        );

        self.sample_rate.store(sample_rate, Ordering::Release);
        self.handoff = Arc::new(RealtimeHandoff::new(buffer_size, 0));
        self.client = Some(client);
        self.state.mark_opened();
        Ok(())
    }

    fn init(&mut self, format: &SongFormat, realtime: bool) -> Result<()> {
        let changed = self.state.mark_initialized(format)?;
        let channels = self.state.out_channels().map_or(0, usize::from);

        if channels != self.port_count || self.active.is_none() {
            self.deactivate()?;
            self.handoff.set_channels(channels);
            if channels > 0 {
                self.activate(channels)?;
            }
        }
        self.handoff.set_active(false);
        self.handoff.clear();
        self.pending.clear();

        if !realtime {
            debug!("JACK process thread scheduling is set by the server");
        }

        let device_rate = self.device_rate();
        let stale = self.resampler.as_ref().map_or(true, |r| {
            r.source_rate() != format.sample_rate || r.device_rate() != device_rate || r.channels() != channels
        });
        if channels > 0 && (changed || stale) {
            self.resampler = Some(StreamingResampler::new(format.sample_rate, device_rate, channels as u16)?);
        } else if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.mark_started()?;
        self.handoff.reopen();
        self.handoff.set_active(true);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.mark_stopped();
        self.handoff.set_active(false);
        self.discard();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.handoff.close();
        if let Err(e) = self.deactivate() {
            warn!("{}", e);
        }
        self.client = None;
        self.resampler = None;
        self.pending.clear();
        self.state.mark_closed();
        info!("JACK client closed ({} xruns)", self.xruns.load(Ordering::Relaxed));
    }

    fn write(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<Frame> {
        if !self.flush_blocks()? {
            return Ok(0);
        }

        let (accepted, mixed) = self.state.mix(pcm, frames, offset)?;
        if mixed.is_empty() {
            return Ok(accepted);
        }
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| Error::InvalidState("JACK output not initialized".to_string()))?;
        resampler.process(mixed, &mut self.pending)?;

        // Input is consumed even if the callback falls behind; the rest waits in `pending`
        self.flush_blocks()?;
        Ok(accepted)
    }

    fn drain(&mut self) -> Result<()> {
        let block = self.handoff.block_frames() * self.port_count;
        if block > 0 && !self.pending.is_empty() {
            let padded = self.pending.len().div_ceil(block) * block;
            self.pending.resize(padded, 0.0);
        }
        while !self.pending.is_empty() {
            if !self.flush_blocks()? && !self.handoff.is_active() {
                break;
            }
        }
        let wait = self.publish_wait();
        self.handoff.wait_idle(wait);
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.handoff.clear();
    }

    fn underruns(&self) -> u64 {
        self.handoff.underruns() + self.xruns.load(Ordering::Relaxed)
    }

    fn output_state(&self) -> &OutputState {
        &self.state
    }

    fn output_state_mut(&mut self) -> &mut OutputState {
        &mut self.state
    }
}

impl Drop for JackOutput {
    fn drop(&mut self) {
        if self.client.is_some() || self.active.is_some() {
            self.close();
        }
    }
}
