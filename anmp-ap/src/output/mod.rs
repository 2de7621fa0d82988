//! Output backends
//!
//! Every backend implements [`AudioOutput`] and walks the same stream state
//! machine:
//!
//! ```text
//! Closed -> Opened -> Stopped (initialized) <-> Started -> Closed
//! ```
//!
//! The backends form a closed set, [`OutputBackend`], built from
//! [`OutputSettings`]. Fields every backend needs (format, mixdown target,
//! volume, stream state, mixer scratch) live in [`OutputState`].

pub mod null;
pub mod realtime;
pub mod wav;

#[cfg(all(feature = "jack-backend", target_os = "linux"))]
pub mod jack;

#[cfg(feature = "cpal-backend")]
pub mod cpal;

pub use null::NullOutput;
pub use realtime::{Publish, ReadyBlock, RealtimeHandoff};
pub use wav::WavOutput;

#[cfg(all(feature = "jack-backend", target_os = "linux"))]
pub use self::jack::JackOutput;

#[cfg(feature = "cpal-backend")]
pub use self::cpal::CpalOutput;

use crate::audio::mixer::mix_pcm;
use crate::audio::types::{Frame, PcmSlice, SongFormat, MAX_OUTPUT_CHANNELS};
use crate::config::{BackendKind, OutputSettings};
use crate::error::{Error, Result};
use tracing::debug;

/// Stream state of an output backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Closed,
    /// Device handle acquired, no format yet
    Opened,
    /// Initialized for a format, not consuming audio
    Stopped,
    Started,
}

/// Output contract shared by all backends
pub trait AudioOutput {
    /// Acquire the device or server handle; no-op when already open
    fn open(&mut self) -> Result<()>;

    /// Configure for `format`; leaves the stream stopped.
    ///
    /// Calling it again with an unchanged format does nothing.
    fn init(&mut self, format: &SongFormat, realtime: bool) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Stop consuming audio and drop anything buffered
    fn stop(&mut self) -> Result<()>;

    fn close(&mut self);

    /// Push `frames` frames of source-format PCM starting `offset` samples
    /// into `pcm`.
    ///
    /// Returns the frames accepted. Zero means the backend is full and the
    /// caller should retry shortly.
    fn write(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<Frame>;

    /// Block until buffered audio has been played
    fn drain(&mut self) -> Result<()>;

    /// Drop buffered audio without stopping
    fn discard(&mut self);

    /// Underruns observed by the device side since the backend was created
    fn underruns(&self) -> u64 {
        0
    }

    fn output_state(&self) -> &OutputState;

    fn output_state_mut(&mut self) -> &mut OutputState;

    fn stream_state(&self) -> StreamState {
        self.output_state().stream()
    }

    fn set_volume(&mut self, volume: f32) {
        self.output_state_mut().set_volume(volume);
    }

    fn volume(&self) -> f32 {
        self.output_state().volume()
    }

    /// Per-song loudness correction, applied on top of the volume
    fn set_gain(&mut self, gain: f32) {
        self.output_state_mut().set_gain(gain);
    }

    /// Change the mixdown target; rejected while started
    fn set_output_channels(&mut self, channels: Option<u16>) -> Result<()> {
        self.output_state_mut().set_output_channels(channels)
    }

    fn set_voice_config(&mut self, format: &SongFormat) {
        self.output_state_mut().set_voice_config(format);
    }

    fn set_mute_mask(&mut self, mask: &[bool]) {
        self.output_state_mut().set_mute_mask(mask);
    }
}

/// State common to every backend
#[derive(Debug, Clone)]
pub struct OutputState {
    format: SongFormat,
    out_channels: Option<u16>,
    /// User volume in [0, 1]
    volume: f32,
    /// Loudness gain; may exceed 1, the mixer clips
    gain: f32,
    stream: StreamState,
    scratch: Vec<f32>,
}

impl OutputState {
    pub fn new(out_channels: Option<u16>, volume: f32) -> Self {
        Self {
            format: SongFormat::default(),
            out_channels,
            volume: volume.clamp(0.0, 1.0),
            gain: 1.0,
            stream: StreamState::Closed,
            scratch: Vec::new(),
        }
    }

    pub fn format(&self) -> &SongFormat {
        &self.format
    }

    pub fn out_channels(&self) -> Option<u16> {
        self.out_channels
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn stream(&self) -> StreamState {
        self.stream
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Non-finite or negative gains fall back to unity
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = if gain.is_finite() && gain >= 0.0 { gain } else { 1.0 };
    }

    pub fn set_output_channels(&mut self, channels: Option<u16>) -> Result<()> {
        if self.stream == StreamState::Started {
            return Err(Error::InvalidState(
                "output channels cannot change while the stream is started".to_string(),
            ));
        }
        if let Some(n) = channels {
            if n == 0 || n as usize > MAX_OUTPUT_CHANNELS {
                return Err(Error::FormatMismatch(format!(
                    "cannot mix to {} output channels (1..={} supported)",
                    n, MAX_OUTPUT_CHANNELS
                )));
            }
        }
        self.out_channels = channels;
        Ok(())
    }

    /// Take the voice layout (and mute flags) of `format`
    pub fn set_voice_config(&mut self, format: &SongFormat) {
        self.format.voices = format.voices.clone();
    }

    pub fn set_mute_mask(&mut self, mask: &[bool]) {
        self.format.apply_mute_mask(mask);
    }

    pub fn mark_opened(&mut self) {
        if self.stream == StreamState::Closed {
            self.stream = StreamState::Opened;
        }
    }

    pub fn require_open(&self) -> Result<()> {
        if self.stream == StreamState::Closed {
            return Err(Error::Device("output is not open".to_string()));
        }
        Ok(())
    }

    /// Record the format of an init; returns whether the layout or rate changed
    pub fn mark_initialized(&mut self, format: &SongFormat) -> Result<bool> {
        self.require_open()?;
        format.validate()?;
        let changed = !self.format.same_layout(format);
        if changed {
            debug!(
                "Output format: {} Hz, {} channels, {}",
                format.sample_rate,
                format.channels(),
                format.sample_format
            );
        }
        self.format = format.clone();
        self.stream = StreamState::Stopped;
        Ok(changed)
    }

    pub fn mark_started(&mut self) -> Result<()> {
        match self.stream {
            StreamState::Stopped | StreamState::Started => {
                self.stream = StreamState::Started;
                Ok(())
            }
            other => Err(Error::InvalidState(format!("cannot start output in state {:?}", other))),
        }
    }

    pub fn mark_stopped(&mut self) {
        if self.stream == StreamState::Started {
            self.stream = StreamState::Stopped;
        }
    }

    pub fn mark_closed(&mut self) {
        self.stream = StreamState::Closed;
        self.format = SongFormat::default();
    }

    /// Mix `frames` frames starting `offset` samples into `pcm` to
    /// interleaved f32 scaled by volume and gain.
    ///
    /// Returns the frames consumed and the mixed samples; the samples are
    /// empty when no output channels are configured.
    pub fn mix(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<(Frame, &[f32])> {
        if self.stream != StreamState::Started {
            return Err(Error::InvalidState(format!("write in state {:?}", self.stream)));
        }
        let in_channels = self.format.channels() as usize;
        let input = pcm.slice(offset, frames * in_channels).ok_or_else(|| {
            Error::FormatMismatch(format!(
                "write of {} frames at sample {} exceeds a buffer of {} samples",
                frames,
                offset,
                pcm.len()
            ))
        })?;
        if input.format() != self.format.sample_format {
            return Err(Error::FormatMismatch(format!(
                "write of {} samples to an output initialized for {}",
                input.format(),
                self.format.sample_format
            )));
        }

        let Some(out_channels) = self.out_channels else {
            return Ok((frames, &[]));
        };
        self.scratch.clear();
        self.scratch.resize(frames * out_channels as usize, 0.0);
        let mixed = mix_pcm(input, &self.format, &mut self.scratch, out_channels, self.volume * self.gain)?;
        Ok((mixed, &self.scratch[..mixed * out_channels as usize]))
    }
}

/// The closed set of output backends
pub enum OutputBackend {
    Null(NullOutput),
    Wav(WavOutput),
    #[cfg(all(feature = "jack-backend", target_os = "linux"))]
    Jack(JackOutput),
    #[cfg(feature = "cpal-backend")]
    Cpal(CpalOutput),
}

impl OutputBackend {
    /// Build the configured backend (closed until `open`)
    pub fn from_settings(settings: &OutputSettings) -> Result<Self> {
        match settings.backend {
            BackendKind::Null => Ok(OutputBackend::Null(NullOutput::new(settings.channels, settings.volume))),
            BackendKind::Wav => Ok(OutputBackend::Wav(WavOutput::new(
                &settings.wav_path,
                settings.wav_sample_format,
                settings.channels,
                settings.volume,
            ))),
            #[cfg(all(feature = "jack-backend", target_os = "linux"))]
            BackendKind::Jack => Ok(OutputBackend::Jack(JackOutput::new(
                &settings.jack_client_name,
                settings.channels,
                settings.volume,
            ))),
            #[cfg(feature = "cpal-backend")]
            BackendKind::Cpal => Ok(OutputBackend::Cpal(CpalOutput::new(settings.channels, settings.volume))),
            #[allow(unreachable_patterns)]
            other => Err(Error::Config(format!(
                "output backend '{}' is not available in this build",
                other
            ))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            OutputBackend::Null(_) => BackendKind::Null,
            OutputBackend::Wav(_) => BackendKind::Wav,
            #[cfg(all(feature = "jack-backend", target_os = "linux"))]
            OutputBackend::Jack(_) => BackendKind::Jack,
            #[cfg(feature = "cpal-backend")]
            OutputBackend::Cpal(_) => BackendKind::Cpal,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $o:ident => $e:expr) => {
        match $self {
            OutputBackend::Null($o) => $e,
            OutputBackend::Wav($o) => $e,
            #[cfg(all(feature = "jack-backend", target_os = "linux"))]
            OutputBackend::Jack($o) => $e,
            #[cfg(feature = "cpal-backend")]
            OutputBackend::Cpal($o) => $e,
        }
    };
}

impl AudioOutput for OutputBackend {
    fn open(&mut self) -> Result<()> {
        dispatch!(self, o => o.open())
    }

    fn init(&mut self, format: &SongFormat, realtime: bool) -> Result<()> {
        dispatch!(self, o => o.init(format, realtime))
    }

    fn start(&mut self) -> Result<()> {
        dispatch!(self, o => o.start())
    }

    fn stop(&mut self) -> Result<()> {
        dispatch!(self, o => o.stop())
    }

    fn close(&mut self) {
        dispatch!(self, o => o.close())
    }

    fn write(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<Frame> {
        dispatch!(self, o => o.write(pcm, frames, offset))
    }

    fn drain(&mut self) -> Result<()> {
        dispatch!(self, o => o.drain())
    }

    fn discard(&mut self) {
        dispatch!(self, o => o.discard())
    }

    fn underruns(&self) -> u64 {
        dispatch!(self, o => o.underruns())
    }

    fn output_state(&self) -> &OutputState {
        dispatch!(self, o => o.output_state())
    }

    fn output_state_mut(&mut self) -> &mut OutputState {
        dispatch!(self, o => o.output_state_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::{SampleFormat, Voice};

    fn started(out_channels: Option<u16>, format: &SongFormat) -> OutputState {
        let mut state = OutputState::new(out_channels, 1.0);
        state.mark_opened();
        state.mark_initialized(format).unwrap();
        state.mark_started().unwrap();
        state
    }

    #[test]
    fn test_state_machine() {
        let mut state = OutputState::new(Some(2), 1.0);
        assert_eq!(state.stream(), StreamState::Closed);
        assert!(state.mark_started().is_err());
        assert!(state.mark_initialized(&SongFormat::simple(44100, SampleFormat::I16, 2)).is_err());

        state.mark_opened();
        let format = SongFormat::simple(44100, SampleFormat::I16, 2);
        assert!(state.mark_initialized(&format).unwrap());
        assert!(!state.mark_initialized(&format).unwrap());
        assert_eq!(state.stream(), StreamState::Stopped);

        state.mark_started().unwrap();
        state.mark_started().unwrap();
        assert!(state.set_output_channels(Some(1)).is_err());
        state.mark_stopped();
        state.mark_stopped();
        assert_eq!(state.stream(), StreamState::Stopped);
        state.set_output_channels(Some(1)).unwrap();

        state.mark_closed();
        assert_eq!(state.stream(), StreamState::Closed);
    }

    #[test]
    fn test_output_channel_bounds() {
        let mut state = OutputState::new(Some(2), 1.0);
        assert!(state.set_output_channels(Some(0)).is_err());
        assert!(state.set_output_channels(Some(33)).is_err());
        state.set_output_channels(None).unwrap();
        assert_eq!(state.out_channels(), None);
    }

    #[test]
    fn test_mix_at_offset() {
        let format = SongFormat::simple(8000, SampleFormat::F32, 1);
        let mut state = started(Some(2), &format);
        let pcm = [0.1f32, 0.2, 0.3, 0.4];
        let (frames, mixed) = state.mix(PcmSlice::F32(&pcm), 2, 1).unwrap();
        assert_eq!(frames, 2);
        assert_eq!(mixed, &[0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn test_mix_without_output_channels_consumes() {
        let format = SongFormat::simple(8000, SampleFormat::F32, 1);
        let mut state = started(None, &format);
        let pcm = [0.5f32; 8];
        let (frames, mixed) = state.mix(PcmSlice::F32(&pcm), 8, 0).unwrap();
        assert_eq!(frames, 8);
        assert!(mixed.is_empty());
    }

    #[test]
    fn test_mix_rejects_overrun_and_wrong_type() {
        let format = SongFormat::simple(8000, SampleFormat::I16, 2);
        let mut state = started(Some(2), &format);
        let pcm = [0i16; 4];
        assert!(matches!(state.mix(PcmSlice::I16(&pcm), 3, 0), Err(Error::FormatMismatch(_))));
        assert!(matches!(state.mix(PcmSlice::F32(&[0.0; 4]), 2, 0), Err(Error::FormatMismatch(_))));
    }

    #[test]
    fn test_gain_applies_above_full_volume() {
        let format = SongFormat::simple(8000, SampleFormat::F32, 1);
        let mut state = started(Some(1), &format);
        state.set_volume(1.0);
        state.set_gain(2.0);
        assert_eq!(state.volume(), 1.0);

        let (_, mixed) = state.mix(PcmSlice::F32(&[0.25, 0.75]), 2, 0).unwrap();
        assert_eq!(mixed, &[0.5, 1.0]);

        state.set_volume(0.5);
        let (_, mixed) = state.mix(PcmSlice::F32(&[0.25]), 1, 0).unwrap();
        assert_eq!(mixed, &[0.25]);

        state.set_gain(f32::NAN);
        assert_eq!(state.gain(), 1.0);
    }

    #[test]
    fn test_mute_mask_applies_to_mix() {
        let format = SongFormat::with_voices(
            8000,
            SampleFormat::F32,
            vec![Voice::new("a", 1), Voice::new("b", 1)],
        );
        let mut state = started(Some(1), &format);
        state.set_mute_mask(&[true, false]);
        let pcm = [0.25f32, 0.5];
        let (_, mixed) = state.mix(PcmSlice::F32(&pcm), 1, 0).unwrap();
        assert_eq!(mixed, &[0.5]);
    }

    #[test]
    fn test_unavailable_backend() {
        let settings = OutputSettings {
            backend: BackendKind::Null,
            ..OutputSettings::default()
        };
        assert_eq!(OutputBackend::from_settings(&settings).unwrap().kind(), BackendKind::Null);

        #[cfg(not(feature = "cpal-backend"))]
        {
            let settings = OutputSettings {
                backend: BackendKind::Cpal,
                ..OutputSettings::default()
            };
            assert!(matches!(OutputBackend::from_settings(&settings), Err(Error::Config(_))));
        }
    }
}
