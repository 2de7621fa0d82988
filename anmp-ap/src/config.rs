//! Configuration for the anmp-ap player
//!
//! One explicit struct, loaded once from TOML and passed by reference into
//! the render buffers, the outputs and the player. Every key has a built-in
//! default, so an empty or missing file is valid.
//!
//! File discovery follows `anmp_common::config`: `--config`, then
//! `ANMP_CONFIG`, then the platform config directory.

use crate::error::{Error, Result};
use anmp_common::config::{load_or_default, CONFIG_ENV_VAR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Complete player configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub render: RenderSettings,
    pub playback: PlaybackSettings,
    pub output: OutputSettings,
    pub logging: LoggingConfig,
}

/// PCM rendering strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Try to hold the whole song in memory before falling back to double buffering
    pub whole_song_buffering: bool,

    /// Frames per double-buffer chunk
    pub chunk_frames: usize,

    /// Frames rendered synchronously before a whole-song fill goes to the background
    pub pre_render_frames: usize,

    /// Songs whose PCM would exceed this many MiB go straight to double buffering
    pub whole_song_limit_mb: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            whole_song_buffering: true,
            chunk_frames: 8192,
            pre_render_frames: 16384,
            whole_song_limit_mb: 1024,
        }
    }
}

impl RenderSettings {
    pub fn whole_song_limit_bytes(&self) -> usize {
        self.whole_song_limit_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Replaces the repeat count of every nested loop
    pub loop_count_override: Option<u32>,

    /// Apply the gain stored in the loudness sidecar file
    pub normalize_loudness: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            loop_count_override: None,
            normalize_loudness: true,
        }
    }
}

/// Output backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Null,
    Wav,
    Jack,
    Cpal,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "null" => Ok(BackendKind::Null),
            "wav" => Ok(BackendKind::Wav),
            "jack" => Ok(BackendKind::Jack),
            "cpal" => Ok(BackendKind::Cpal),
            other => Err(Error::Config(format!("Unknown output backend: {}", other))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Null => "null",
            BackendKind::Wav => "wav",
            BackendKind::Jack => "jack",
            BackendKind::Cpal => "cpal",
        };
        f.write_str(name)
    }
}

/// Sample type written to WAV files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WavSampleFormat {
    #[default]
    I16,
    F32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub backend: BackendKind,

    /// Mixdown target; absent means nothing is rendered
    pub channels: Option<u16>,

    /// Master volume 0.0-1.0
    pub volume: f32,

    pub wav_path: PathBuf,
    pub wav_sample_format: WavSampleFormat,

    pub jack_client_name: String,

    /// Ask backends for real-time scheduling where they support it
    pub realtime: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Null,
            channels: Some(2),
            volume: 1.0,
            wav_path: PathBuf::from("anmp-out.wav"),
            wav_sample_format: WavSampleFormat::I16,
            jack_client_name: "anmp".to_string(),
            realtime: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PlayerConfig {
    /// Resolve and load the configuration, falling back to defaults
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let config: PlayerConfig = load_or_default(cli_path, CONFIG_ENV_VAR)?;
        config.validate()?;
        info!(
            "Configuration: backend={}, channels={:?}, whole_song={}, chunk_frames={}",
            config.output.backend,
            config.output.channels,
            config.render.whole_song_buffering,
            config.render.chunk_frames
        );
        Ok(config)
    }

    /// Parse from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: PlayerConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.render.chunk_frames == 0 {
            return Err(Error::Config("render.chunk_frames must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.output.volume) {
            return Err(Error::Config(format!(
                "output.volume must be within 0.0-1.0, got {}",
                self.output.volume
            )));
        }
        if self.output.channels == Some(0) {
            return Err(Error::Config("output.channels must be positive".to_string()));
        }
        Ok(())
    }
}
