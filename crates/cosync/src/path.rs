//! Dot-delimited paths addressing locations in a state tree.
//!
//! Paths travel on the wire as plain strings (`"messages.0"`,
//! `"nodes.3.position"`); numeric segments address array-like containers.
//! Overlap tests are segment-aware so that `messages1` is never mistaken for
//! a child of `messages`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dot-delimited address into the state tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    /// Create a path from a dot-delimited string.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The raw dot-delimited string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the path has no segments at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the path's segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// True when `self` addresses an ancestor of `other` (or the same
    /// location). The comparison respects segment boundaries.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        let mut mine = self.segments();
        let mut theirs = other.segments();
        loop {
            match (mine.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a == b => continue,
                _ => return false,
            }
        }
    }

    /// True when either path addresses the other's subtree (equal paths
    /// included). Operations on non-overlapping paths never conflict.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl From<&str> for Path {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for Path {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
