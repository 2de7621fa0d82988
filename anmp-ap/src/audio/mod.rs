//! Audio processing modules
//!
//! Sample types, PCM storage, decoding, resampling and voice mixing.

pub mod decode;
pub mod decoder;
pub mod mixer;
pub mod pcm;
pub mod resampler;
pub mod types;

pub use decode::SymphoniaDecoder;
pub use decoder::{Decoder, MemoryClip, MemoryDecoder, SongDecoder, SongMetadata};
pub use mixer::{mix_chunk, mix_frame, mix_pcm};
pub use pcm::{AllocationStrategy, PcmBuffer, PcmWriter, SharedPcm};
pub use resampler::StreamingResampler;
pub use types::{Frame, PcmSlice, PcmSliceMut, Sample, SampleFormat, SongFormat, Voice};
