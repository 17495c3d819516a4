//! Decides what happens when the current item changes or finishes.

use tracing::{debug, info};

use crate::feed::Feed;
use crate::player::PlayerEvent;
use crate::pool::PlayerPool;
use crate::viewport::IndexChanged;

/// Programmatic scrolling on the list widget. Requests only; the widget's
/// next visibility snapshot is what actually moves the current index.
pub trait ScrollRequester {
    fn request_scroll_to_index(&mut self, index: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndedDecision {
    /// Scroll requested to this index.
    Advance(usize),
    /// Same item replayed from zero.
    Restart(usize),
    /// Last item with auto-continue on; the handle stays `Ended`.
    Stop(usize),
    /// Event for an index that is no longer current.
    Ignore,
}

/// Pure decision for an ended event.
pub fn decide_ended(enabled: bool, index: usize, current: usize, feed_len: usize) -> EndedDecision {
    if index != current {
        return EndedDecision::Ignore;
    }
    if !enabled {
        return EndedDecision::Restart(index);
    }
    if index + 1 < feed_len {
        EndedDecision::Advance(index + 1)
    } else {
        EndedDecision::Stop(index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutoContinueController {
    enabled: bool,
}

impl AutoContinueController {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Flips the mode and returns the new value. Playback is untouched.
    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        info!(enabled = self.enabled, "autocontinue: toggled");
        self.enabled
    }

    /// Moves active playback from `change.old` to `change.new`, whatever the
    /// mode.
    pub fn on_index_changed(
        &self,
        change: IndexChanged,
        feed: &Feed,
        pool: &mut PlayerPool,
    ) -> Vec<(usize, PlayerEvent)> {
        // Addressed by index: the same media may appear more than once.
        let mut surfaced = Vec::new();
        if feed.get(change.old).is_some() {
            surfaced.extend(pool.set_playing_at(change.old, false));
        }
        if let Some(next) = feed.get(change.new) {
            pool.acquire(change.new, next);
            surfaced.extend(pool.set_playing_at(change.new, true));
        }
        surfaced
    }

    pub fn on_playback_ended(
        &self,
        index: usize,
        current: usize,
        feed: &Feed,
        pool: &mut PlayerPool,
        scroller: &mut dyn ScrollRequester,
    ) -> (EndedDecision, Vec<(usize, PlayerEvent)>) {
        let decision = decide_ended(self.enabled, index, current, feed.len());
        debug!(index, current, enabled = self.enabled, ?decision, "autocontinue: playback ended");
        let surfaced = match decision {
            EndedDecision::Advance(next) => {
                scroller.request_scroll_to_index(next);
                Vec::new()
            }
            EndedDecision::Restart(index) => pool.restart_at(index),
            EndedDecision::Stop(_) | EndedDecision::Ignore => Vec::new(),
        };
        (decision, surfaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_advances_until_last_item() {
        assert_eq!(decide_ended(true, 2, 2, 5), EndedDecision::Advance(3));
        assert_eq!(decide_ended(true, 4, 4, 5), EndedDecision::Stop(4));
    }

    #[test]
    fn disabled_loops_even_on_last_item() {
        assert_eq!(decide_ended(false, 2, 2, 5), EndedDecision::Restart(2));
        assert_eq!(decide_ended(false, 4, 4, 5), EndedDecision::Restart(4));
    }

    #[test]
    fn stale_ended_is_ignored() {
        assert_eq!(decide_ended(true, 1, 2, 5), EndedDecision::Ignore);
        assert_eq!(decide_ended(false, 3, 2, 5), EndedDecision::Ignore);
    }

    #[test]
    fn toggle_flips_state() {
        let mut ctl = AutoContinueController::default();
        assert!(!ctl.enabled());
        assert!(ctl.toggle());
        assert!(!ctl.toggle());
    }
}
