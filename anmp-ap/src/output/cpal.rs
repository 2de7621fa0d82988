//! Audio device output using cpal
//!
//! The playback thread mixes and resamples to the device rate and pushes
//! interleaved f32 into a lock-free SPSC ring. The cpal callback pops from
//! the ring, converts to the device sample type, and fills any shortfall
//! with silence (counted as an underrun).
//!
//! `stop` drops the stream together with its ring, so buffered audio is
//! discarded immediately; `start` builds a fresh stream.

use super::{AudioOutput, OutputState};
use crate::audio::resampler::StreamingResampler;
use crate::audio::types::{Frame, PcmSlice, SongFormat};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample as CpalSample, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ring capacity in milliseconds of device audio
const RING_MS: u32 = 250;

pub struct CpalOutput {
    state: OutputState,
    device: Option<Device>,
    device_rate: u32,
    device_format: cpal::SampleFormat,
    stream: Option<Stream>,
    producer: Option<HeapProd<f32>>,
    resampler: Option<StreamingResampler>,
    /// Resampled audio that did not fit into the ring
    pending: Vec<f32>,
    underruns: Arc<AtomicU64>,
    error_flag: Arc<AtomicBool>,
}

impl CpalOutput {
    pub fn new(out_channels: Option<u16>, volume: f32) -> Self {
        Self {
            state: OutputState::new(out_channels, volume),
            device: None,
            device_rate: 0,
            device_format: cpal::SampleFormat::F32,
            stream: None,
            producer: None,
            resampler: None,
            pending: Vec::new(),
            underruns: Arc::new(AtomicU64::new(0)),
            error_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Names of the host's output devices
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    fn build_stream(&mut self, channels: u16) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::Device("audio device is not open".to_string()))?;
        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = (self.device_rate * RING_MS / 1000) as usize * channels as usize;
        let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();

        let underruns = Arc::clone(&self.underruns);
        let error_flag = Arc::clone(&self.error_flag);
        let stream = match self.device_format {
            cpal::SampleFormat::F32 => stream_for::<f32>(device, &config, consumer, underruns, error_flag),
            cpal::SampleFormat::I16 => stream_for::<i16>(device, &config, consumer, underruns, error_flag),
            cpal::SampleFormat::I32 => stream_for::<i32>(device, &config, consumer, underruns, error_flag),
            cpal::SampleFormat::U16 => stream_for::<u16>(device, &config, consumer, underruns, error_flag),
            other => Err(Error::Device(format!("Unsupported sample format: {:?}", other))),
        }?;

        self.stream = Some(stream);
        self.producer = Some(producer);
        Ok(())
    }

    /// Push carried-over audio; true once nothing is left over
    fn push_pending(&mut self) -> bool {
        let Some(producer) = self.producer.as_mut() else {
            self.pending.clear();
            return true;
        };
        let channels = self.state.out_channels().map_or(1, usize::from);
        let room = producer.vacant_len() - producer.vacant_len() % channels;
        let pushed = producer.push_slice(&self.pending[..room.min(self.pending.len())]);
        self.pending.drain(..pushed);
        self.pending.is_empty()
    }
}

fn stream_for<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    underruns: Arc<AtomicU64>,
    error_flag: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut missed = false;
                for sample in data.iter_mut() {
                    *sample = match consumer.try_pop() {
                        Some(value) => <T as CpalSample>::from_sample(value),
                        None => {
                            missed = true;
                            T::EQUILIBRIUM
                        }
                    };
                }
                if missed {
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
                error_flag.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::Device(format!("Failed to build stream: {}", e)))
}

impl AudioOutput for CpalOutput {
    fn open(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Device("No default output device found".to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| Error::Device(format!("Failed to get default config: {}", e)))?;

        self.device_rate = config.sample_rate().0;
        self.device_format = config.sample_format();
        info!(
            "Using audio device {}: {} Hz, {:?}",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            self.device_rate,
            self.device_format
        );
        self.device = Some(device);
        self.state.mark_opened();
        Ok(())
    }

    fn init(&mut self, format: &SongFormat, realtime: bool) -> Result<()> {
        let changed = self.state.mark_initialized(format)?;
        self.stream = None;
        self.producer = None;
        self.pending.clear();

        if realtime {
            debug!("cpal schedules its callback thread itself");
        }
        let Some(channels) = self.state.out_channels() else {
            self.resampler = None;
            return Ok(());
        };
        let stale = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.source_rate() != format.sample_rate || r.channels() != channels as usize);
        if changed || stale {
            self.resampler = Some(StreamingResampler::new(format.sample_rate, self.device_rate, channels)?);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.mark_started()?;
        if self.stream.is_some() {
            return Ok(());
        }
        let Some(channels) = self.state.out_channels() else {
            return Ok(());
        };
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.error_flag.store(false, Ordering::SeqCst);
        self.build_stream(channels)?;
        if let Some(stream) = self.stream.as_ref() {
            stream
                .play()
                .map_err(|e| Error::Device(format!("Failed to start stream: {}", e)))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.mark_stopped();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause stream: {}", e);
            }
        }
        self.producer = None;
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.producer = None;
        self.resampler = None;
        self.pending.clear();
        self.device = None;
        self.state.mark_closed();
    }

    fn write(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<Frame> {
        if self.error_flag.load(Ordering::SeqCst) {
            return Err(Error::Device("audio stream failed".to_string()));
        }
        if !self.push_pending() {
            return Ok(0);
        }

        let (accepted, mixed) = self.state.mix(pcm, frames, offset)?;
        if mixed.is_empty() {
            return Ok(accepted);
        }
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| Error::InvalidState("cpal output not initialized".to_string()))?;
        resampler.process(mixed, &mut self.pending)?;
        self.push_pending();
        Ok(accepted)
    }

    fn drain(&mut self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(RING_MS as u64 * 4);
        while Instant::now() < deadline {
            let pending_done = self.push_pending();
            let ring_empty = self.producer.as_ref().map_or(true, |p| p.is_empty());
            if pending_done && ring_empty {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        warn!("Timed out draining audio device");
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }

    fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn output_state(&self) -> &OutputState {
        &self.state
    }

    fn output_state_mut(&mut self) -> &mut OutputState {
        &mut self.state
    }
}
