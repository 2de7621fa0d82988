//! Loudness-correction sidecar files
//!
//! A loudness analysis stores its result beside the audio file as a hidden
//! file named `.<file name>.ebur128`. The file holds a single little-endian
//! IEEE-754 `f32`: the linear gain factor to apply during playback.
//! A missing or unusable sidecar means "no correction" (gain 1.0).

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extension appended to the hidden sidecar file name
pub const SIDECAR_EXTENSION: &str = "ebur128";

/// Gain used when no correction is available
pub const UNITY_GAIN: f32 = 1.0;

/// Path of the sidecar file for `audio_path`
pub fn sidecar_path(audio_path: &Path) -> Result<PathBuf> {
    let file_name = audio_path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("No file name in {}", audio_path.display())))?;

    let mut hidden = std::ffi::OsString::from(".");
    hidden.push(file_name);
    hidden.push(".");
    hidden.push(SIDECAR_EXTENSION);

    Ok(audio_path.with_file_name(hidden))
}

/// Read the stored gain factor, or [`UNITY_GAIN`] if there is none
pub fn read_gain(audio_path: &Path) -> f32 {
    let sidecar = match sidecar_path(audio_path) {
        Ok(p) => p,
        Err(_) => return UNITY_GAIN,
    };

    let bytes = match std::fs::read(&sidecar) {
        Ok(b) => b,
        Err(_) => return UNITY_GAIN,
    };

    let Some(raw) = bytes.get(..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) else {
        warn!("Loudness sidecar {} is truncated, ignoring", sidecar.display());
        return UNITY_GAIN;
    };

    let gain = f32::from_le_bytes(raw);
    if !gain.is_finite() || gain <= 0.0 {
        warn!("Loudness sidecar {} holds invalid gain {}, ignoring", sidecar.display(), gain);
        return UNITY_GAIN;
    }

    debug!("Loudness gain {:.4} from {}", gain, sidecar.display());
    gain
}

/// Store a gain factor for `audio_path`
pub fn write_gain(audio_path: &Path, gain: f32) -> Result<PathBuf> {
    if !gain.is_finite() || gain <= 0.0 {
        return Err(Error::InvalidInput(format!("Gain must be positive and finite, got {gain}")));
    }

    let sidecar = sidecar_path(audio_path)?;
    std::fs::write(&sidecar, gain.to_le_bytes())?;
    Ok(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_is_hidden_beside_source() {
        let path = sidecar_path(Path::new("/music/album/01 - Intro.flac")).unwrap();
        assert_eq!(path, PathBuf::from("/music/album/.01 - Intro.flac.ebur128"));
    }

    #[test]
    fn test_missing_sidecar_is_unity() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_gain(&dir.path().join("song.ogg")), UNITY_GAIN);
    }

    #[test]
    fn test_write_then_read_gain() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("song.ogg");

        let sidecar = write_gain(&audio, 0.5).unwrap();
        assert!(sidecar.file_name().unwrap().to_string_lossy().starts_with('.'));
        assert_eq!(read_gain(&audio), 0.5);
    }

    #[test]
    fn test_invalid_contents_fall_back_to_unity() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("song.ogg");
        let sidecar = sidecar_path(&audio).unwrap();

        std::fs::write(&sidecar, [1u8, 2]).unwrap();
        assert_eq!(read_gain(&audio), UNITY_GAIN);

        std::fs::write(&sidecar, f32::NAN.to_le_bytes()).unwrap();
        assert_eq!(read_gain(&audio), UNITY_GAIN);

        std::fs::write(&sidecar, (-2.0f32).to_le_bytes()).unwrap();
        assert_eq!(read_gain(&audio), UNITY_GAIN);
    }

    #[test]
    fn test_write_rejects_non_positive_gain() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_gain(&dir.path().join("a.wav"), 0.0).is_err());
    }
}
