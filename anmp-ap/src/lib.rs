//! # ANMP Audio Player Library (anmp-ap)
//!
//! Playback core of the player.
//!
//! **Purpose:** Decode sources into PCM ahead of real time, mix voices down to
//! the output channel count, walk nested loop ranges, and feed output
//! backends, including callback-driven real-time devices.
//!
//! **Architecture:** decoder → render buffer (whole song or double buffered)
//! → loop scheduler → output backend (mixer + resampler + device hand-off),
//! driven by the [`playback::Player`] on a dedicated playback thread.

pub mod audio;
pub mod config;
pub mod error;
pub mod output;
pub mod playback;

pub use config::PlayerConfig;
pub use error::{Error, Result};
pub use playback::Player;
