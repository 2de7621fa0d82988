//! Playback orchestration
//!
//! - [`render_buffer`]: decoder output into whole-song or double-buffered PCM
//! - [`loop_tree`] and [`scheduler`]: nested loop ranges and their traversal
//! - [`song`] and [`playlist`]: what is played, in which order
//! - [`player`] and `session`: the control handle and the playback thread

pub mod loop_tree;
pub mod player;
pub mod playlist;
pub mod render_buffer;
pub mod scheduler;
mod session;
pub mod song;

pub use loop_tree::{Loop, LoopKind, LoopNode, LoopTree};
pub use player::{Player, SongInfo};
pub use playlist::{Playlist, SongSource};
pub use render_buffer::{BufferMode, RenderBuffer};
pub use scheduler::{LoopScheduler, LoopSettings, Transport};
pub use session::WRITE_FRAMES;
pub use song::Song;
