//! Loop tree
//!
//! Nested repeat ranges of a source. The root spans the whole song with a
//! count of 1; every child lies strictly inside its parent and siblings do
//! not overlap. Loops that would break these rules are dropped when the
//! tree is built.

use crate::audio::types::Frame;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Direction of a loop repetition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LoopKind {
    #[default]
    Forward,
    Backward,
    Alternating,
}

/// A repeat range. `stop` is the frame at which a repetition ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub start: Frame,
    pub stop: Frame,
    /// Repetitions; 0 repeats until playback is stopped
    pub count: u32,
    pub kind: LoopKind,
}

impl Loop {
    pub fn forward(start: Frame, stop: Frame, count: u32) -> Self {
        Self {
            start,
            stop,
            count,
            kind: LoopKind::Forward,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.stop
    }

    pub fn is_infinite(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> Frame {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    /// True if `other` lies inside this loop's range
    pub fn contains(&self, other: &Loop) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    pub fn overlaps(&self, other: &Loop) -> bool {
        self.start < other.stop && other.start < self.stop
    }
}

/// A loop together with the loops nested inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNode {
    pub range: Loop,
    /// Sorted by start, non-overlapping
    pub children: Vec<LoopNode>,
}

impl LoopNode {
    fn leaf(range: Loop) -> Self {
        Self {
            range,
            children: Vec::new(),
        }
    }

    pub fn start(&self) -> Frame {
        self.range.start
    }

    pub fn stop(&self) -> Frame {
        self.range.stop
    }

    /// The nearest not yet entered child: smallest start strictly after
    /// `playhead`, or `None` to play straight to this node's stop
    pub fn next_segment(&self, playhead: Frame) -> Option<&LoopNode> {
        self.children
            .iter()
            .filter(|child| child.start() > playhead)
            .min_by_key(|child| child.start())
    }

    /// Child that begins exactly at `frame`
    pub fn child_starting_at(&self, frame: Frame) -> Option<&LoopNode> {
        self.children.iter().find(|child| child.start() == frame)
    }

    /// Insert a loop at the deepest node that contains it.
    ///
    /// Returns false (and leaves the tree unchanged) if it would overlap a
    /// sibling partially.
    fn insert(&mut self, range: Loop) -> bool {
        if let Some(child) = self.children.iter_mut().find(|c| c.range.contains(&range) && c.range != range) {
            return child.insert(range);
        }
        if self.children.iter().any(|c| c.range == range) {
            return false;
        }

        // The new loop may swallow existing siblings
        let (inner, outer): (Vec<LoopNode>, Vec<LoopNode>) =
            self.children.drain(..).partition(|c| range.contains(&c.range));
        if outer.iter().any(|c| c.range.overlaps(&range)) {
            self.children = outer.into_iter().chain(inner).collect();
            self.children.sort_by_key(LoopNode::start);
            return false;
        }

        let mut node = LoopNode::leaf(range);
        node.children = inner;
        self.children = outer;
        self.children.push(node);
        self.children.sort_by_key(LoopNode::start);
        true
    }

    /// Number of nodes in this subtree
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(LoopNode::node_count).sum::<usize>()
    }

    /// Deepest node whose range contains `frame`
    pub fn node_at(&self, frame: Frame) -> &LoopNode {
        self.children
            .iter()
            .find(|c| c.start() <= frame && frame < c.stop())
            .map_or(self, |c| c.node_at(frame))
    }
}

/// Loop tree of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopTree {
    root: LoopNode,
    /// Sample rate the loop points were valid for when the tree was built
    sample_rate: u32,
}

impl LoopTree {
    /// Build the tree for a song of `total_frames` from reported loop points
    pub fn build(total_frames: Frame, loops: &[Loop], sample_rate: u32) -> Self {
        let mut root = LoopNode::leaf(Loop::forward(0, total_frames, 1));

        let mut sorted: Vec<Loop> = loops.to_vec();
        // Outer loops first so nesting is resolved top-down
        sorted.sort_by_key(|l| (l.start, std::cmp::Reverse(l.stop)));

        for range in sorted {
            if !range.is_valid() || range.stop > total_frames {
                warn!(
                    "Ignoring loop [{}, {}) outside song of {} frames",
                    range.start, range.stop, total_frames
                );
                continue;
            }
            if range == root.range || (range.start == 0 && range.stop == total_frames) {
                // A loop over the whole song repeats the root
                root.range.count = range.count;
                root.range.kind = range.kind;
                continue;
            }
            if !root.insert(range) {
                warn!(
                    "Ignoring loop [{}, {}) overlapping another loop",
                    range.start, range.stop
                );
            }
        }

        Self { root, sample_rate }
    }

    /// Tree with no nested loops
    pub fn straight(total_frames: Frame, sample_rate: u32) -> Self {
        Self::build(total_frames, &[], sample_rate)
    }

    pub fn root(&self) -> &LoopNode {
        &self.root
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn total_frames(&self) -> Frame {
        self.root.stop()
    }

    pub fn is_straight(&self) -> bool {
        self.root.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_spans_song() {
        let tree = LoopTree::straight(100, 44100);
        assert_eq!(tree.root().range, Loop::forward(0, 100, 1));
        assert!(tree.is_straight());
        assert!(tree.root().next_segment(0).is_none());
    }

    #[test]
    fn test_nested_loops_are_placed_by_containment() {
        let tree = LoopTree::build(
            1000,
            &[
                Loop::forward(120, 140, 2),
                Loop::forward(100, 200, 3),
                Loop::forward(500, 600, 1),
            ],
            44100,
        );
        let root = tree.root();
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].range.start, 100);
        assert_eq!(root.children[0].children[0].range, Loop::forward(120, 140, 2));
        assert_eq!(tree.root().node_count(), 4);
    }

    #[test]
    fn test_inner_loop_inserted_before_outer() {
        let mut root = LoopNode::leaf(Loop::forward(0, 1000, 1));
        assert!(root.insert(Loop::forward(120, 140, 2)));
        assert!(root.insert(Loop::forward(100, 200, 3)));
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].children.len(), 1);
    }

    #[test]
    fn test_invalid_and_overlapping_loops_dropped() {
        let tree = LoopTree::build(
            1000,
            &[
                Loop::forward(50, 50, 1),
                Loop::forward(900, 1200, 1),
                Loop::forward(100, 300, 1),
                Loop::forward(200, 400, 1),
            ],
            44100,
        );
        assert_eq!(tree.root().children.len(), 1);
        assert_eq!(tree.root().children[0].range.stop, 300);
    }

    #[test]
    fn test_whole_song_loop_sets_root_count() {
        let tree = LoopTree::build(500, &[Loop::forward(0, 500, 0)], 32000);
        assert!(tree.root().range.is_infinite());
        assert!(tree.is_straight());
    }

    #[test]
    fn test_next_segment_is_nearest_child_after_playhead() {
        let tree = LoopTree::build(
            1000,
            &[Loop::forward(100, 200, 1), Loop::forward(400, 500, 1)],
            44100,
        );
        let root = tree.root();
        assert_eq!(root.next_segment(0).map(LoopNode::start), Some(100));
        // Strictly greater: a child starting at the playhead is not "next"
        assert_eq!(root.next_segment(100).map(LoopNode::start), Some(400));
        assert_eq!(root.next_segment(450).map(LoopNode::start), None);
    }

    #[test]
    fn test_node_at_finds_deepest() {
        let tree = LoopTree::build(
            1000,
            &[Loop::forward(100, 200, 1), Loop::forward(120, 140, 1)],
            44100,
        );
        assert_eq!(tree.root().node_at(130).start(), 120);
        assert_eq!(tree.root().node_at(150).start(), 100);
        assert_eq!(tree.root().node_at(700).start(), 0);
    }
}
