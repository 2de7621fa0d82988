//! Streaming sample rate conversion using rubato
//!
//! Converts the mixed output stream from the source rate to the device rate
//! block by block. Filter state persists across calls so consecutive blocks
//! join without clicks; [`StreamingResampler::reset`] is only called when a
//! stream (re)starts or the source changes.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames handed to rubato per processing step
pub const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Stateful resampler for interleaved f32 audio
pub struct StreamingResampler {
    source_rate: u32,
    device_rate: u32,
    channels: usize,
    /// None when both rates are equal
    inner: Option<FastFixedIn<f32>>,
    /// Planar input not yet consumed by rubato
    fifo: Vec<Vec<f32>>,
    scratch: Vec<Vec<f32>>,
}

impl StreamingResampler {
    pub fn new(source_rate: u32, device_rate: u32, channels: u16) -> Result<Self> {
        if source_rate == 0 || device_rate == 0 || channels == 0 {
            return Err(Error::FormatMismatch(format!(
                "cannot resample {} Hz -> {} Hz with {} channels",
                source_rate, device_rate, channels
            )));
        }
        let channels = channels as usize;

        let (inner, scratch) = if source_rate == device_rate {
            (None, Vec::new())
        } else {
            let resampler = FastFixedIn::<f32>::new(
                device_rate as f64 / source_rate as f64,
                1.0,
                PolynomialDegree::Septic,
                RESAMPLER_CHUNK_FRAMES,
                channels,
            )
            .map_err(|e| Error::Device(format!("Failed to create resampler: {}", e)))?;
            let scratch = resampler.output_buffer_allocate(true);
            (Some(resampler), scratch)
        };

        debug!(
            "Resampler {} Hz -> {} Hz, {} channels{}",
            source_rate,
            device_rate,
            channels,
            if inner.is_none() { " (pass-through)" } else { "" }
        );

        Ok(Self {
            source_rate,
            device_rate,
            channels,
            inner,
            fifo: vec![Vec::with_capacity(RESAMPLER_CHUNK_FRAMES * 2); channels],
            scratch,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Device frames per source frame
    pub fn ratio(&self) -> f64 {
        self.device_rate as f64 / self.source_rate as f64
    }

    /// Feed interleaved frames and append all output available so far.
    ///
    /// Input that does not fill a whole rubato chunk stays queued for the
    /// next call. Returns the number of frames appended to `out`.
    pub fn process(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<usize> {
        let channels = self.channels;
        let Some(inner) = self.inner.as_mut() else {
            let whole = interleaved.len() - interleaved.len() % channels;
            out.extend_from_slice(&interleaved[..whole]);
            return Ok(whole / channels);
        };

        for frame in interleaved.chunks_exact(channels) {
            for (queue, sample) in self.fifo.iter_mut().zip(frame) {
                queue.push(*sample);
            }
        }

        let mut produced = 0;
        loop {
            let needed = inner.input_frames_next();
            if self.fifo[0].len() < needed {
                break;
            }
            let input: Vec<&[f32]> = self.fifo.iter().map(|q| &q[..needed]).collect();
            let (consumed, written) = inner
                .process_into_buffer(&input, &mut self.scratch, None)
                .map_err(|e| Error::Device(format!("Resampling failed: {}", e)))?;

            for queue in self.fifo.iter_mut() {
                queue.drain(..consumed);
            }
            out.reserve(written * channels);
            for i in 0..written {
                for ch in 0..channels {
                    out.push(self.scratch[ch][i]);
                }
            }
            produced += written;
        }

        Ok(produced)
    }

    /// Convert whatever input is still queued, padding the last rubato chunk
    /// with silence, and append it to `out`.
    ///
    /// Only the output that corresponds to real input is kept. Filter history
    /// is cleared afterwards, ready for a new stream.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<usize> {
        let channels = self.channels;
        let queued = self.queued_frames();
        let ratio = self.ratio();
        let Some(inner) = self.inner.as_mut() else {
            return Ok(0);
        };
        if queued == 0 {
            inner.reset();
            return Ok(0);
        }

        let input: Vec<&[f32]> = self.fifo.iter().map(Vec::as_slice).collect();
        let (_, written) = inner
            .process_partial_into_buffer(Some(input.as_slice()), &mut self.scratch, None)
            .map_err(|e| Error::Device(format!("Resampling failed: {}", e)))?;
        let keep = written.min((queued as f64 * ratio).round() as usize);

        out.reserve(keep * channels);
        for i in 0..keep {
            for ch in 0..channels {
                out.push(self.scratch[ch][i]);
            }
        }
        self.reset();
        Ok(keep)
    }

    /// Forget queued input and filter history
    pub fn reset(&mut self) {
        for queue in self.fifo.iter_mut() {
            queue.clear();
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }

    /// Frames queued but not yet converted
    pub fn queued_frames(&self) -> usize {
        self.fifo.first().map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for StreamingResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResampler")
            .field("source_rate", &self.source_rate)
            .field("device_rate", &self.device_rate)
            .field("channels", &self.channels)
            .field("queued_frames", &self.queued_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_rates_pass_through() {
        let mut resampler = StreamingResampler::new(48000, 48000, 2).unwrap();
        assert!(resampler.is_passthrough());

        let mut out = Vec::new();
        let frames = resampler.process(&[0.1, 0.2, 0.3, 0.4, 0.5], &mut out).unwrap();
        assert_eq!(frames, 2);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_partial_chunks_are_carried_over() {
        let mut resampler = StreamingResampler::new(44100, 48000, 1).unwrap();
        let mut out = Vec::new();

        // Less than one rubato chunk: nothing comes out yet
        assert_eq!(resampler.process(&vec![0.0; 100], &mut out).unwrap(), 0);
        assert_eq!(resampler.queued_frames(), 100);

        // Enough for several chunks
        let produced = resampler.process(&vec![0.0; 10 * RESAMPLER_CHUNK_FRAMES], &mut out).unwrap();
        assert!(produced > 0);
        assert_eq!(out.len(), produced);
        assert!(resampler.queued_frames() < RESAMPLER_CHUNK_FRAMES + 100);
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let mut resampler = StreamingResampler::new(24000, 48000, 2).unwrap();
        let input = vec![0.25f32; 2 * 24000];
        let mut out = Vec::new();
        let produced = resampler.process(&input, &mut out).unwrap();

        let expected = (24000 - resampler.queued_frames()) as f64 * resampler.ratio();
        assert!((produced as f64 - expected).abs() < 2.0 * RESAMPLER_CHUNK_FRAMES as f64);
    }

    #[test]
    fn test_flush_converts_queued_tail() {
        let mut resampler = StreamingResampler::new(16000, 8000, 2).unwrap();
        let mut out = Vec::new();
        assert_eq!(resampler.process(&vec![0.5; 2 * 300], &mut out).unwrap(), 0);

        let flushed = resampler.flush(&mut out).unwrap();
        assert!(flushed > 0 && flushed <= 150, "flushed {} frames", flushed);
        assert_eq!(out.len(), flushed * 2);
        assert_eq!(resampler.queued_frames(), 0);
        assert_eq!(resampler.flush(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_reset_clears_queue() {
        let mut resampler = StreamingResampler::new(32000, 48000, 2).unwrap();
        let mut out = Vec::new();
        resampler.process(&vec![0.0; 20], &mut out).unwrap();
        assert_eq!(resampler.queued_frames(), 10);
        resampler.reset();
        assert_eq!(resampler.queued_frames(), 0);
    }

    #[test]
    fn test_invalid_rates_rejected() {
        assert!(StreamingResampler::new(0, 48000, 2).is_err());
        assert!(StreamingResampler::new(44100, 48000, 0).is_err());
    }
}
