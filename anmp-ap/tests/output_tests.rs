//! Output backends driven through the `AudioOutput` trait
//!
//! Config-loading tests touch ANMP_CONFIG and run #[serial].

mod helpers;

use anmp_ap::audio::{PcmSlice, SampleFormat, SongFormat, Voice};
use anmp_ap::config::{BackendKind, OutputSettings, WavSampleFormat};
use anmp_ap::output::{AudioOutput, OutputBackend, StreamState};
use anmp_ap::{Error, PlayerConfig};
use anmp_common::config::CONFIG_ENV_VAR;
use helpers::read_wav_i16;
use serial_test::serial;
use std::io::Write;
use tempfile::tempdir;

fn wav_settings(path: &std::path::Path, channels: Option<u16>) -> OutputSettings {
    OutputSettings {
        backend: BackendKind::Wav,
        channels,
        wav_path: path.to_path_buf(),
        wav_sample_format: WavSampleFormat::I16,
        ..OutputSettings::default()
    }
}

#[test]
fn test_wav_backend_lifecycle_and_muted_voice() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("voices.wav");
    let mut output = OutputBackend::from_settings(&wav_settings(&path, Some(1))).unwrap();
    assert_eq!(output.kind(), BackendKind::Wav);
    assert_eq!(output.stream_state(), StreamState::Closed);

    let format = SongFormat::with_voices(
        8000,
        SampleFormat::I16,
        vec![Voice::new("lead", 1), Voice::new("bass", 1)],
    );
    output.open().unwrap();
    output.init(&format, false).unwrap();
    output.set_voice_config(&format);
    output.set_mute_mask(&[false, true]);
    output.start().unwrap();
    assert_eq!(output.stream_state(), StreamState::Started);

    // lead, bass interleaved
    let pcm: Vec<i16> = vec![100, 7, 200, 7, 300, 7, 400, 7];
    assert_eq!(output.write(PcmSlice::I16(&pcm), 2, 4).unwrap(), 2);
    assert_eq!(output.write(PcmSlice::I16(&pcm), 2, 0).unwrap(), 2);

    output.set_mute_mask(&[false, false]);
    assert_eq!(output.write(PcmSlice::I16(&pcm), 1, 0).unwrap(), 1);

    output.drain().unwrap();
    output.stop().unwrap();
    output.close();
    assert_eq!(output.stream_state(), StreamState::Closed);

    let (spec, samples) = read_wav_i16(&path);
    assert_eq!(spec.channels, 1);
    assert_eq!(samples, vec![300, 400, 100, 200, 107]);
}

#[test]
fn test_write_requires_started_stream() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idle.wav");
    let mut output = OutputBackend::from_settings(&wav_settings(&path, Some(2))).unwrap();
    let format = SongFormat::simple(8000, SampleFormat::I16, 2);

    output.open().unwrap();
    output.init(&format, false).unwrap();
    let pcm = [0i16; 4];
    assert!(matches!(
        output.write(PcmSlice::I16(&pcm), 2, 0),
        Err(Error::InvalidState(_))
    ));

    output.start().unwrap();
    assert!(matches!(
        output.set_output_channels(Some(1)),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        output.write(PcmSlice::F32(&[0.0; 4]), 2, 0),
        Err(Error::FormatMismatch(_))
    ));
}

#[test]
fn test_null_backend_counts_frames() {
    let settings = OutputSettings::default();
    let mut output = OutputBackend::from_settings(&settings).unwrap();
    let format = SongFormat::simple(44100, SampleFormat::F32, 2);

    output.open().unwrap();
    output.init(&format, true).unwrap();
    output.start().unwrap();
    let pcm = vec![0.25f32; 2 * 512];
    assert_eq!(output.write(PcmSlice::F32(&pcm), 512, 0).unwrap(), 512);
    assert_eq!(output.underruns(), 0);
    output.close();
}

#[test]
#[serial]
fn test_player_config_from_env_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "[output]\nbackend = \"wav\"\nchannels = 1\n\n[playback]\nloop_count_override = 3\n"
    )
    .unwrap();
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    let config = PlayerConfig::load(None).unwrap();
    assert_eq!(config.output.backend, BackendKind::Wav);
    assert_eq!(config.output.channels, Some(1));
    assert_eq!(config.playback.loop_count_override, Some(3));

    std::env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_invalid_config_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[output]\nvolume = 2.0\n").unwrap();
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    assert!(matches!(PlayerConfig::load(None), Err(Error::Config(_))));

    std::env::remove_var(CONFIG_ENV_VAR);
}
