//! # ANMP Common Library
//!
//! Shared code for the ANMP player crates:
//! - Event types (`PlayerEvent`) and the `EventBus`
//! - Configuration file discovery and TOML loading
//! - Loudness-correction sidecar files

pub mod config;
pub mod error;
pub mod events;
pub mod loudness;

pub use error::{Error, Result};
pub use events::{EventBus, PlayerEvent, Subscription};
