//! Playlist of sources
//!
//! Ordered entries with a cursor. Navigation does not wrap: `next` past the
//! last entry ends the playlist, `previous` on the first entry stays there.

use crate::audio::decoder::{MemoryClip, SongDecoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a song's PCM comes from
#[derive(Debug, Clone)]
pub enum SongSource {
    File(PathBuf),
    Memory(Arc<MemoryClip>),
}

impl SongSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            SongSource::File(path) => Some(path),
            SongSource::Memory(_) => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            SongSource::File(path) => path.display().to_string(),
            SongSource::Memory(clip) => clip.label.clone(),
        }
    }

    /// A fresh decoder for this source
    pub fn decoder(&self) -> SongDecoder {
        match self {
            SongSource::File(path) => SongDecoder::from_path(path.clone()),
            SongSource::Memory(clip) => SongDecoder::from_clip(Arc::clone(clip)),
        }
    }
}

impl From<PathBuf> for SongSource {
    fn from(path: PathBuf) -> Self {
        SongSource::File(path)
    }
}

impl From<MemoryClip> for SongSource {
    fn from(clip: MemoryClip) -> Self {
        SongSource::Memory(Arc::new(clip))
    }
}

#[derive(Debug, Default)]
pub struct Playlist {
    entries: Vec<SongSource>,
    current: Option<usize>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: impl Into<SongSource>) {
        self.entries.push(source.into());
    }

    pub fn extend<I, S>(&mut self, sources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<SongSource>,
    {
        self.entries.extend(sources.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SongSource] {
        &self.entries
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&SongSource> {
        self.current.and_then(|i| self.entries.get(i))
    }

    /// Current entry, starting at the first one if nothing is selected
    pub fn current_or_first(&mut self) -> Option<&SongSource> {
        if self.current.is_none() && !self.entries.is_empty() {
            self.current = Some(0);
        }
        self.current()
    }

    pub fn select(&mut self, index: usize) -> Option<&SongSource> {
        if index < self.entries.len() {
            self.current = Some(index);
        }
        self.current()
    }

    /// Advance; `None` (and no selection) after the last entry
    pub fn next(&mut self) -> Option<&SongSource> {
        self.current = match self.current {
            Some(i) if i + 1 < self.entries.len() => Some(i + 1),
            Some(_) => None,
            None if !self.entries.is_empty() => Some(0),
            None => None,
        };
        self.current()
    }

    /// Step back; stays on the first entry
    pub fn previous(&mut self) -> Option<&SongSource> {
        self.current = match self.current {
            Some(i) => Some(i.saturating_sub(1)),
            None if !self.entries.is_empty() => Some(self.entries.len() - 1),
            None => None,
        };
        self.current()
    }

    /// Remove the current entry; the cursor moves to the entry that followed it
    pub fn remove_current(&mut self) -> Option<SongSource> {
        let index = self.current?;
        if index >= self.entries.len() {
            self.current = None;
            return None;
        }
        let removed = self.entries.remove(index);
        if index >= self.entries.len() {
            self.current = None;
        }
        debug!("Removed playlist entry {}", removed.label());
        Some(removed)
    }

    /// Drop a source that cannot be played
    pub fn mark_unplayable(&mut self, reason: &str) -> Option<SongSource> {
        let removed = self.remove_current()?;
        warn!("Unplayable: {} ({})", removed.label(), reason);
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(names: &[&str]) -> Playlist {
        let mut playlist = Playlist::new();
        playlist.extend(names.iter().map(PathBuf::from));
        playlist
    }

    fn name(source: Option<&SongSource>) -> Option<String> {
        source.map(SongSource::label)
    }

    #[test]
    fn test_next_does_not_wrap() {
        let mut list = playlist(&["a", "b"]);
        assert_eq!(name(list.current_or_first()), Some("a".into()));
        assert_eq!(name(list.next()), Some("b".into()));
        assert_eq!(name(list.next()), None);
        assert_eq!(list.current_index(), None);
    }

    #[test]
    fn test_previous_stays_on_first() {
        let mut list = playlist(&["a", "b"]);
        list.select(1);
        assert_eq!(name(list.previous()), Some("a".into()));
        assert_eq!(name(list.previous()), Some("a".into()));
    }

    #[test]
    fn test_mark_unplayable_moves_to_following_entry() {
        let mut list = playlist(&["a", "bad", "c"]);
        list.select(1);
        let removed = list.mark_unplayable("corrupt");
        assert_eq!(name(removed.as_ref()), Some("bad".into()));
        assert_eq!(list.len(), 2);
        assert_eq!(name(list.current()), Some("c".into()));

        let removed = list.mark_unplayable("corrupt");
        assert!(removed.is_some());
        assert!(list.current().is_none());
    }

    #[test]
    fn test_empty_playlist() {
        let mut list = Playlist::new();
        assert!(list.current_or_first().is_none());
        assert!(list.next().is_none());
        assert!(list.previous().is_none());
        assert!(list.remove_current().is_none());
    }
}
