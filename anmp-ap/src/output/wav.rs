//! Output to a WAV file
//!
//! The file is created on the first `init` with that song's sample rate and
//! the configured mixdown channel count. Later songs with another rate are
//! resampled to the file's rate. The header is finalized on `close`.

use super::{AudioOutput, OutputState};
use crate::audio::resampler::StreamingResampler;
use crate::audio::types::{Frame, PcmSlice, Sample, SongFormat};
use crate::config::WavSampleFormat;
use crate::error::{Error, Result};
use hound::{WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct WavOutput {
    state: OutputState,
    path: PathBuf,
    sample_format: WavSampleFormat,
    writer: Option<WavWriter<BufWriter<File>>>,
    spec: Option<WavSpec>,
    resampler: Option<StreamingResampler>,
    resampled: Vec<f32>,
    frames_written: u64,
}

impl WavOutput {
    pub fn new(path: &Path, sample_format: WavSampleFormat, out_channels: Option<u16>, volume: f32) -> Self {
        Self {
            state: OutputState::new(out_channels, volume),
            path: path.to_path_buf(),
            sample_format,
            writer: None,
            spec: None,
            resampler: None,
            resampled: Vec::new(),
            frames_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames written to the file so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn create_writer(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        let spec = match self.sample_format {
            WavSampleFormat::I16 => WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            WavSampleFormat::F32 => WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            },
        };
        let writer = WavWriter::create(&self.path, spec)
            .map_err(|e| Error::Device(format!("Failed to create {}: {}", self.path.display(), e)))?;
        info!(
            "Writing {} ({} Hz, {} channels, {:?})",
            self.path.display(),
            sample_rate,
            channels,
            self.sample_format
        );
        self.writer = Some(writer);
        self.spec = Some(spec);
        Ok(())
    }

    fn write_samples(&mut self, samples: &[f32]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let result = match self.sample_format {
            WavSampleFormat::I16 => samples.iter().try_for_each(|s| {
                writer.write_sample(i16::from_f64_saturating(*s as f64 * i16::FULL_SCALE))
            }),
            WavSampleFormat::F32 => samples.iter().try_for_each(|s| writer.write_sample(*s)),
        };
        result.map_err(|e| Error::Device(format!("WAV write failed: {}", e)))
    }
}

impl AudioOutput for WavOutput {
    fn open(&mut self) -> Result<()> {
        self.state.mark_opened();
        Ok(())
    }

    fn init(&mut self, format: &SongFormat, _realtime: bool) -> Result<()> {
        let changed = self.state.mark_initialized(format)?;
        let Some(channels) = self.state.out_channels() else {
            self.resampler = None;
            return Ok(());
        };

        let spec = match self.spec {
            Some(spec) => spec,
            None => {
                self.create_writer(format.sample_rate, channels)?;
                self.spec.ok_or_else(|| Error::Device("WAV writer missing".to_string()))?
            }
        };
        if spec.channels != channels {
            return Err(Error::Device(format!(
                "{} was created with {} channels, output is now {}",
                self.path.display(),
                spec.channels,
                channels
            )));
        }

        let stale = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.source_rate() != format.sample_rate || r.channels() != channels as usize);
        if changed || stale {
            if format.sample_rate != spec.sample_rate {
                debug!(
                    "Resampling {} Hz to the file rate of {} Hz",
                    format.sample_rate, spec.sample_rate
                );
            }
            self.resampler = Some(StreamingResampler::new(format.sample_rate, spec.sample_rate, channels)?);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.mark_started()
    }

    fn stop(&mut self) -> Result<()> {
        self.state.mark_stopped();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => info!("Wrote {} frames to {}", self.frames_written, self.path.display()),
                Err(e) => warn!("Failed to finalize {}: {}", self.path.display(), e),
            }
        }
        self.spec = None;
        self.resampler = None;
        self.state.mark_closed();
    }

    fn write(&mut self, pcm: PcmSlice<'_>, frames: Frame, offset: usize) -> Result<Frame> {
        let (accepted, mixed) = self.state.mix(pcm, frames, offset)?;
        if mixed.is_empty() {
            return Ok(accepted);
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(accepted);
        };
        self.resampled.clear();
        let produced = resampler.process(mixed, &mut self.resampled)?;

        let samples = std::mem::take(&mut self.resampled);
        let result = self.write_samples(&samples);
        self.resampled = samples;
        result?;

        self.frames_written += produced as u64;
        Ok(accepted)
    }

    /// Write the resampler's queued tail, then flush the file
    fn drain(&mut self) -> Result<()> {
        if let Some(resampler) = self.resampler.as_mut() {
            self.resampled.clear();
            let produced = resampler.flush(&mut self.resampled)?;
            let samples = std::mem::take(&mut self.resampled);
            let result = self.write_samples(&samples);
            self.resampled = samples;
            result?;
            self.frames_written += produced as u64;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| Error::Device(format!("WAV flush failed: {}", e)))?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn output_state(&self) -> &OutputState {
        &self.state
    }

    fn output_state_mut(&mut self) -> &mut OutputState {
        &mut self.state
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::SampleFormat;
    use tempfile::tempdir;

    #[test]
    fn test_writes_mixed_i16() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut output = WavOutput::new(&path, WavSampleFormat::I16, Some(2), 0.5);
        output.open().unwrap();
        output.init(&SongFormat::simple(8000, SampleFormat::I16, 1), false).unwrap();
        output.start().unwrap();

        let pcm: Vec<i16> = vec![1000, -2000, 3000];
        assert_eq!(output.write(PcmSlice::I16(&pcm), 3, 0).unwrap(), 3);
        output.close();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![500, 500, -1000, -1000, 1500, 1500]);
    }

    #[test]
    fn test_file_rate_fixed_at_first_init() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate.wav");
        let mut output = WavOutput::new(&path, WavSampleFormat::F32, Some(1), 1.0);
        output.open().unwrap();
        output.init(&SongFormat::simple(8000, SampleFormat::F32, 1), false).unwrap();
        output.start().unwrap();
        output.write(PcmSlice::F32(&[0.25; 800]), 800, 0).unwrap();
        output.stop().unwrap();

        output.init(&SongFormat::simple(16000, SampleFormat::F32, 1), false).unwrap();
        output.start().unwrap();
        output.write(PcmSlice::F32(&[0.25; 16000]), 16000, 0).unwrap();
        output.close();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        // One second at 16 kHz becomes roughly one second at 8 kHz, minus resampler latency
        let frames = reader.duration() as i64;
        assert!(frames > 800 + 6000 && frames <= 800 + 8000, "got {} frames", frames);
    }

    #[test]
    fn test_drain_writes_resampler_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tail.wav");
        let mut output = WavOutput::new(&path, WavSampleFormat::F32, Some(1), 1.0);
        output.open().unwrap();
        output.init(&SongFormat::simple(8000, SampleFormat::F32, 1), false).unwrap();
        output.stop().unwrap();

        output.init(&SongFormat::simple(16000, SampleFormat::F32, 1), false).unwrap();
        output.start().unwrap();
        // Less than one resampler chunk: held back until drained
        output.write(PcmSlice::F32(&[0.25; 100]), 100, 0).unwrap();
        assert_eq!(output.frames_written(), 0);

        output.drain().unwrap();
        let written = output.frames_written();
        assert!(written > 0 && written <= 50, "wrote {} frames", written);
        output.close();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.duration() as u64, written);
    }

    #[test]
    fn test_no_output_channels_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silent.wav");
        let mut output = WavOutput::new(&path, WavSampleFormat::I16, None, 1.0);
        output.open().unwrap();
        output.init(&SongFormat::simple(8000, SampleFormat::I16, 2), false).unwrap();
        output.start().unwrap();
        assert_eq!(output.write(PcmSlice::I16(&[0; 8]), 4, 0).unwrap(), 4);
        output.close();
        assert!(!path.exists());
    }
}
