//! Composition root for the reel feed.
//!
//! [`ReelController`] owns the feed list, the viewport tracker, the player
//! pool and the auto-continue state, and is the only thing the list widget
//! talks to. UI inputs and engine events share one queue and are handled on
//! one dispatch thread in arrival order; results go back to the widget as
//! [`ReelEvent`]s.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::autocontinue::{AutoContinueController, EndedDecision, ScrollRequester};
use crate::feed::{Feed, MediaRef};
use crate::player::{EngineEvent, PlayerEvent};
use crate::pool::PlayerPool;
use crate::viewport::{IndexChanged, ViewportTracker, VisibleItem, DEFAULT_THRESHOLD};

/// Commands from the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Visibility(Vec<VisibleItem>),
    ToggleAutoContinue,
    SetMuted(bool),
    /// Tear down and rebuild the handle at an index, e.g. after an error.
    Retry(usize),
    AppendItems(Vec<MediaRef>),
    Shutdown,
}

/// One entry of the dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Input(Input),
    Engine(EngineEvent),
}

/// Queues UI commands behind whatever is already waiting for dispatch.
#[derive(Clone)]
pub struct InputSender(Sender<Message>);

impl InputSender {
    /// Returns false once the controller is gone.
    pub fn send(&self, input: Input) -> bool {
        self.0.send(Message::Input(input)).is_ok()
    }
}

/// Everything the UI renders from, tagged by feed index where relevant.
#[derive(Debug, Clone, PartialEq)]
pub enum ReelEvent {
    IndexChanged(IndexChanged),
    Player { index: usize, event: PlayerEvent },
    ScrollRequested(usize),
    /// The current item is close to the end of the loaded feed.
    EndReached { len: usize },
    PosterVisible { index: usize, visible: bool },
    AutoContinue(bool),
    Muted(bool),
}

#[derive(Debug, Clone, Copy)]
pub struct ReelOptions {
    pub visibility_threshold: f32,
    pub end_reached_threshold: usize,
    pub auto_continue: bool,
}

impl Default for ReelOptions {
    fn default() -> Self {
        Self {
            visibility_threshold: DEFAULT_THRESHOLD,
            end_reached_threshold: 2,
            auto_continue: false,
        }
    }
}

impl From<&crate::config::FeedConfig> for ReelOptions {
    fn from(cfg: &crate::config::FeedConfig) -> Self {
        Self {
            visibility_threshold: cfg.visibility_threshold,
            end_reached_threshold: cfg.end_reached_threshold,
            auto_continue: false,
        }
    }
}

struct Outbox<'a>(&'a Sender<ReelEvent>);

impl ScrollRequester for Outbox<'_> {
    fn request_scroll_to_index(&mut self, index: usize) {
        debug!(index, "reel: scroll requested");
        let _ = self.0.send(ReelEvent::ScrollRequested(index));
    }
}

pub struct ReelController {
    feed: Feed,
    viewport: ViewportTracker,
    pool: PlayerPool,
    auto: AutoContinueController,
    end_reached_threshold: usize,
    end_reached_for: Option<usize>,
    posters: HashMap<usize, bool>,
    events: Sender<ReelEvent>,
    started: bool,
    stopped: bool,
}

impl ReelController {
    pub fn new(feed: Feed, pool: PlayerPool, opts: ReelOptions) -> (Self, Receiver<ReelEvent>) {
        let (events, rx) = unbounded();
        let controller = Self {
            feed,
            viewport: ViewportTracker::new(opts.visibility_threshold),
            pool,
            auto: AutoContinueController::new(opts.auto_continue),
            end_reached_threshold: opts.end_reached_threshold,
            end_reached_for: None,
            posters: HashMap::new(),
            events,
            started: false,
            stopped: false,
        };
        (controller, rx)
    }

    pub fn current_index(&self) -> usize {
        self.viewport.current_index()
    }

    pub fn auto_continue(&self) -> bool {
        self.auto.enabled()
    }

    pub fn muted(&self) -> bool {
        self.pool.muted()
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn pool(&self) -> &PlayerPool {
        &self.pool
    }

    pub fn inputs(&self) -> InputSender {
        InputSender(self.pool.queue_sender())
    }

    /// True once a `Shutdown` input has been handled.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Warms the window around the first item and plays it. Later calls do
    /// nothing.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let current = self.current_index();
        self.sync_window();
        if self.feed.get(current).is_some() {
            let surfaced = self.pool.set_playing_at(current, true);
            self.publish_player(surfaced);
        }
        self.check_end_reached();
        self.refresh_posters();
    }

    pub fn on_visibility_changed(&mut self, items: &[VisibleItem]) {
        let Some(change) = self.viewport.on_visibility_changed(items) else {
            return;
        };
        self.emit(ReelEvent::IndexChanged(change));
        self.pool.set_current_index(change.new);
        self.sync_window();
        let surfaced = self.auto.on_index_changed(change, &self.feed, &mut self.pool);
        self.publish_player(surfaced);
        self.check_end_reached();
        self.refresh_posters();
    }

    pub fn toggle_auto_continue(&mut self) -> bool {
        let enabled = self.auto.toggle();
        self.emit(ReelEvent::AutoContinue(enabled));
        enabled
    }

    /// Global mute; handles created later inherit it.
    pub fn set_muted(&mut self, muted: bool) {
        let surfaced = self.pool.set_all_muted(muted);
        self.publish_player(surfaced);
        self.emit(ReelEvent::Muted(muted));
    }

    pub fn retry(&mut self, index: usize) {
        let Some(media) = self.feed.get(index) else {
            return;
        };
        info!(index, media = %media.id, "reel: retrying item");
        self.pool.release_index(index);
        self.pool.acquire(index, media);
        if index == self.current_index() {
            let surfaced = self.pool.set_playing_at(index, true);
            self.publish_player(surfaced);
        }
        self.refresh_posters();
    }

    pub fn append_items(&mut self, items: Vec<MediaRef>) {
        if items.is_empty() {
            return;
        }
        self.feed.append_items(items);
        info!(len = self.feed.len(), "reel: feed extended");
        self.sync_window();
        self.check_end_reached();
        self.refresh_posters();
    }

    /// Routes one engine event to its handle and reacts to `Ended`.
    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        let Some((index, event)) = self.pool.dispatch(event) else {
            return;
        };
        let ended = matches!(event, PlayerEvent::Ended);
        self.emit(ReelEvent::Player { index, event });
        if ended {
            let current = self.current_index();
            let mut outbox = Outbox(&self.events);
            let (decision, surfaced) =
                self.auto
                    .on_playback_ended(index, current, &self.feed, &mut self.pool, &mut outbox);
            if decision == EndedDecision::Ignore {
                debug!(index, current, "reel: stale ended event dropped");
            }
            self.publish_player(surfaced);
        }
        self.refresh_posters();
    }

    /// Advances range loading, then handles everything already queued.
    pub fn poll(&mut self) {
        self.pump();
        while !self.stopped {
            let Ok(message) = self.pool.queue().try_recv() else {
                break;
            };
            self.handle_message(message);
        }
    }

    fn pump(&mut self) {
        let surfaced = self.pool.pump();
        self.publish_player(surfaced);
    }

    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Input(input) => {
                self.handle_input(input);
            }
            Message::Engine(event) => self.handle_engine_event(event),
        }
    }

    /// Applies one UI command. Returns false on shutdown.
    pub fn handle_input(&mut self, input: Input) -> bool {
        match input {
            Input::Visibility(items) => self.on_visibility_changed(&items),
            Input::ToggleAutoContinue => {
                self.toggle_auto_continue();
            }
            Input::SetMuted(muted) => self.set_muted(muted),
            Input::Retry(index) => self.retry(index),
            Input::AppendItems(items) => self.append_items(items),
            Input::Shutdown => {
                self.stopped = true;
                return false;
            }
        }
        true
    }

    /// Dispatch loop over the shared queue until `Shutdown`. Loaders and
    /// engine clocks advance at least once per `tick`.
    pub fn run(mut self, tick: Duration) {
        let queue = self.pool.queue().clone();
        self.start();
        let mut last_pump = Instant::now();
        while !self.stopped {
            select! {
                recv(queue) -> msg => match msg {
                    Ok(message) => self.handle_message(message),
                    Err(_) => break,
                },
                default(tick) => {},
            }
            if last_pump.elapsed() >= tick {
                self.pump();
                last_pump = Instant::now();
            }
        }
        info!("reel: dispatch loop stopped");
        self.pool.release_all();
    }

    /// Keeps exactly the window around the current index alive.
    fn sync_window(&mut self) {
        let wanted = window_indices(self.current_index(), self.feed.len(), self.pool.window());
        self.pool.retain_indices(&wanted);
        for index in wanted {
            if let Some(media) = self.feed.get(index) {
                self.pool.acquire(index, media);
            }
        }
    }

    fn check_end_reached(&mut self) {
        let len = self.feed.len();
        if len == 0 || self.end_reached_for == Some(len) {
            return;
        }
        let remaining = len - 1 - self.current_index().min(len - 1);
        if remaining <= self.end_reached_threshold {
            self.end_reached_for = Some(len);
            debug!(len, current = self.current_index(), "reel: end reached");
            self.emit(ReelEvent::EndReached { len });
        }
    }

    /// Posters cover every live item with one that is not playing.
    fn refresh_posters(&mut self) {
        let mut now = HashMap::new();
        for index in self.pool.indices() {
            let Some(handle) = self.pool.handle_at(index) else {
                continue;
            };
            let visible = handle.media().poster_url.is_some() && !handle.state().is_playing();
            now.insert(index, visible);
        }
        let mut changed: Vec<(usize, bool)> = now
            .iter()
            .map(|(&index, &visible)| (index, visible))
            .filter(|(index, visible)| self.posters.get(index) != Some(visible))
            .collect();
        changed.sort_unstable();
        self.posters = now;
        for (index, visible) in changed {
            self.emit(ReelEvent::PosterVisible { index, visible });
        }
    }

    fn publish_player(&self, surfaced: Vec<(usize, PlayerEvent)>) {
        for (index, event) in surfaced {
            self.emit(ReelEvent::Player { index, event });
        }
    }

    fn emit(&self, event: ReelEvent) {
        let _ = self.events.send(event);
    }
}

/// Indices kept warm: current first, then alternating next/previous.
pub fn window_indices(current: usize, len: usize, window: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(window);
    if len == 0 || window == 0 {
        return out;
    }
    let current = current.min(len - 1);
    out.push(current);
    let mut step = 1;
    while out.len() < window && (current + step < len || step <= current) {
        if current + step < len {
            out.push(current + step);
        }
        if out.len() < window && step <= current {
            out.push(current - step);
        }
        step += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_prefers_next_then_previous() {
        assert_eq!(window_indices(4, 10, 3), vec![4, 5, 3]);
        assert_eq!(window_indices(0, 10, 3), vec![0, 1, 2]);
        assert_eq!(window_indices(9, 10, 3), vec![9, 8, 7]);
        assert_eq!(window_indices(2, 3, 5), vec![2, 1, 0]);
        assert_eq!(window_indices(1, 4, 2), vec![1, 2]);
        assert!(window_indices(0, 0, 3).is_empty());
    }
}
