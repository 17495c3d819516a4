//! Resolves the single current feed index from list visibility snapshots.

use tracing::debug;

pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// One entry of a visibility snapshot from the list widget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleItem {
    pub index: usize,
    pub visible_fraction: f32,
}

impl VisibleItem {
    pub fn new(index: usize, visible_fraction: f32) -> Self {
        Self {
            index,
            visible_fraction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexChanged {
    pub old: usize,
    pub new: usize,
}

/// Smallest index whose visible fraction reaches `threshold`.
pub fn resolve(items: &[VisibleItem], threshold: f32) -> Option<usize> {
    items
        .iter()
        .filter(|item| item.visible_fraction >= threshold)
        .map(|item| item.index)
        .min()
}

#[derive(Debug, Clone)]
pub struct ViewportTracker {
    threshold: f32,
    current: usize,
}

impl Default for ViewportTracker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ViewportTracker {
    /// Thresholds outside `(0, 1]` fall back to the default.
    pub fn new(threshold: f32) -> Self {
        let threshold = if threshold > 0.0 && threshold <= 1.0 {
            threshold
        } else {
            DEFAULT_THRESHOLD
        };
        Self {
            threshold,
            current: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Applies a snapshot. The index is sticky: nothing qualifying, or the
    /// same index again, yields no event.
    pub fn on_visibility_changed(&mut self, items: &[VisibleItem]) -> Option<IndexChanged> {
        let resolved = resolve(items, self.threshold)?;
        if resolved == self.current {
            return None;
        }
        let change = IndexChanged {
            old: self.current,
            new: resolved,
        };
        debug!(old = change.old, new = change.new, "viewport: index changed");
        self.current = resolved;
        Some(change)
    }
}
