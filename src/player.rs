//! Player handles and the capability interface native engines implement.
//!
//! A [`PlayerHandle`] owns one engine session bound to a single media URL and
//! streams that media through the [`CacheStore`] one range at a time.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStore, Pending};
use crate::error::PlayerError;
use crate::feed::MediaRef;
use crate::fetch::Fetcher;
use crate::reel::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Buffering,
    Ended,
    Error(String),
}

impl PlayerState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlayerState::Playing)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PlayerState::Error(_))
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::Idle => f.write_str("idle"),
            PlayerState::Loading => f.write_str("loading"),
            PlayerState::Ready => f.write_str("ready"),
            PlayerState::Playing => f.write_str("playing"),
            PlayerState::Paused => f.write_str("paused"),
            PlayerState::Buffering => f.write_str("buffering"),
            PlayerState::Ended => f.write_str("ended"),
            PlayerState::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Playback position report, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub current_time: f64,
    pub playable_duration: f64,
    pub seekable_duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    Buffering,
    Ended,
    Error(String),
    Progress(Progress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

/// An engine event tagged with the handle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub handle: HandleId,
    pub event: PlayerEvent,
}

/// Where an engine delivers its events: the dispatch queue, tagged with the
/// emitting handle.
#[derive(Clone)]
pub struct EventSink {
    handle: HandleId,
    tx: Sender<Message>,
}

impl EventSink {
    pub fn new(handle: HandleId, tx: Sender<Message>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.tx.send(Message::Engine(EngineEvent {
            handle: self.handle,
            event,
        }));
    }
}

/// How an engine receives its bytes: as consecutive ranges of
/// `segment_bytes` pulled through the shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub segment_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaSource<'a> {
    pub url: &'a str,
    pub poster_url: Option<&'a str>,
    pub policy: CachePolicy,
}

/// One native decode/render session.
pub trait NativePlayer: Send {
    fn append(&mut self, range_start: u64, data: &[u8], end_of_media: bool)
        -> Result<(), PlayerError>;
    fn set_playing(&mut self, playing: bool) -> Result<(), PlayerError>;
    fn set_muted(&mut self, muted: bool) -> Result<(), PlayerError>;
    fn seek_to_start(&mut self) -> Result<(), PlayerError>;
    /// Called from the dispatch loop; engines driven by their own threads
    /// can ignore it.
    fn poll(&mut self) {}
    /// Frees platform resources. Must be idempotent.
    fn release(&mut self);
}

/// Constructs native sessions for one platform.
pub trait PlayerBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn construct(
        &self,
        source: &MediaSource<'_>,
        events: EventSink,
    ) -> Result<Box<dyn NativePlayer>, PlayerError>;
}

struct SegmentLoader {
    next_offset: u64,
    segment_bytes: u64,
    pending: Option<Pending>,
}

impl SegmentLoader {
    fn key(&self, url: &str) -> CacheKey {
        CacheKey::new(url, self.next_offset, self.segment_bytes)
    }
}

pub struct PlayerHandle {
    id: HandleId,
    index: usize,
    media: MediaRef,
    state: PlayerState,
    muted: bool,
    wants_play: bool,
    native: Option<Box<dyn NativePlayer>>,
    loader: Option<SegmentLoader>,
}

impl fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("media", &self.media.id)
            .field("state", &self.state)
            .field("muted", &self.muted)
            .finish()
    }
}

pub(crate) struct OpenParams<'a> {
    pub id: HandleId,
    pub index: usize,
    pub media: &'a MediaRef,
    pub muted: bool,
    pub policy: CachePolicy,
    pub backend: &'a dyn PlayerBackend,
    pub events: Sender<Message>,
}

impl PlayerHandle {
    /// Constructs the native session and starts loading the first range.
    /// Construction failures leave the handle in `Error`.
    pub(crate) fn open(
        params: OpenParams<'_>,
        cache: &CacheStore,
        fetcher: &Arc<dyn Fetcher>,
    ) -> Self {
        let mut handle = Self {
            id: params.id,
            index: params.index,
            media: params.media.clone(),
            state: PlayerState::Idle,
            muted: params.muted,
            wants_play: false,
            native: None,
            loader: None,
        };

        if let Err(reason) = handle.media.validate() {
            warn!(index = handle.index, media = %handle.media.id, %reason, "player: unplayable item");
            handle.state = PlayerState::Error(reason);
            return handle;
        }

        let source = MediaSource {
            url: &handle.media.url,
            poster_url: handle.media.poster_url.as_deref(),
            policy: params.policy,
        };
        let sink = EventSink::new(handle.id, params.events);
        match params.backend.construct(&source, sink) {
            Ok(mut native) => {
                if let Err(err) = native.set_muted(handle.muted) {
                    warn!(index = handle.index, error = %err, "player: initial mute failed");
                }
                handle.native = Some(native);
                handle.transition(PlayerState::Loading);
                let mut loader = SegmentLoader {
                    next_offset: 0,
                    segment_bytes: params.policy.segment_bytes.max(1),
                    pending: None,
                };
                loader.pending = Some(cache.request(loader.key(&handle.media.url), fetcher.clone()));
                handle.loader = Some(loader);
            }
            Err(err) => {
                warn!(
                    index = handle.index,
                    media = %handle.media.id,
                    backend = params.backend.name(),
                    error = %err,
                    "player: native construction failed"
                );
                handle.state = PlayerState::Error(err.to_string());
            }
        }
        handle
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn media(&self) -> &MediaRef {
        &self.media
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Playing, or told to play and waiting for the engine.
    pub fn is_active(&self) -> bool {
        self.wants_play || matches!(self.state, PlayerState::Playing | PlayerState::Buffering)
    }

    fn transition(&mut self, next: PlayerState) {
        if self.state != next {
            debug!(index = self.index, media = %self.media.id, from = %self.state, to = %next, "player: state");
            self.state = next;
        }
    }

    fn fail(&mut self, message: String) -> PlayerEvent {
        self.wants_play = false;
        self.loader = None;
        self.transition(PlayerState::Error(message.clone()));
        PlayerEvent::Error(message)
    }

    fn command<F>(&mut self, op: F) -> Option<PlayerEvent>
    where
        F: FnOnce(&mut dyn NativePlayer) -> Result<(), PlayerError>,
    {
        let native = self.native.as_mut()?;
        match op(native.as_mut()) {
            Ok(()) => None,
            Err(err) => Some(self.fail(err.to_string())),
        }
    }

    /// Returns an error event if the engine rejected the command.
    pub(crate) fn set_playing(&mut self, playing: bool) -> Option<PlayerEvent> {
        if self.native.is_none() || self.state.is_error() {
            return None;
        }
        self.wants_play = playing;
        if playing {
            match self.state {
                PlayerState::Playing => None,
                PlayerState::Ended => self.restart(),
                PlayerState::Ready | PlayerState::Paused => {
                    let failed = self.command(|native| native.set_playing(true));
                    if failed.is_none() {
                        self.transition(PlayerState::Playing);
                    }
                    failed
                }
                // Playback starts on the engine's next Ready.
                _ => self.command(|native| native.set_playing(true)),
            }
        } else {
            let failed = self.command(|native| native.set_playing(false));
            if failed.is_none() && matches!(self.state, PlayerState::Playing | PlayerState::Buffering) {
                self.transition(PlayerState::Paused);
            }
            failed
        }
    }

    pub(crate) fn set_muted(&mut self, muted: bool) -> Option<PlayerEvent> {
        self.muted = muted;
        self.command(|native| native.set_muted(muted))
    }

    /// Rewinds to zero and plays.
    pub(crate) fn restart(&mut self) -> Option<PlayerEvent> {
        if self.native.is_none() || self.state.is_error() {
            return None;
        }
        self.wants_play = true;
        if let Some(failed) = self.command(|native| native.seek_to_start()) {
            return Some(failed);
        }
        if let Some(failed) = self.command(|native| native.set_playing(true)) {
            return Some(failed);
        }
        if !matches!(self.state, PlayerState::Loading | PlayerState::Buffering) {
            self.transition(PlayerState::Playing);
        }
        None
    }

    /// Applies an engine event.
    pub(crate) fn on_event(&mut self, event: &PlayerEvent) {
        match event {
            PlayerEvent::Ready => {
                if self.wants_play {
                    if let Some(native) = self.native.as_mut() {
                        if let Err(err) = native.set_playing(true) {
                            self.fail(err.to_string());
                            return;
                        }
                    }
                    self.transition(PlayerState::Playing);
                } else if matches!(self.state, PlayerState::Loading | PlayerState::Idle) {
                    self.transition(PlayerState::Ready);
                } else if self.state == PlayerState::Buffering {
                    self.transition(PlayerState::Paused);
                }
            }
            PlayerEvent::Buffering => {
                if !matches!(self.state, PlayerState::Loading | PlayerState::Ended) {
                    self.transition(PlayerState::Buffering);
                }
            }
            PlayerEvent::Ended => {
                self.wants_play = false;
                self.transition(PlayerState::Ended);
            }
            PlayerEvent::Error(message) => {
                self.fail(message.clone());
            }
            PlayerEvent::Progress(_) => {}
        }
    }

    /// Advances the range loader and lets the engine do periodic work.
    /// Returns an error event when loading failed.
    pub(crate) fn pump(&mut self, cache: &CacheStore, fetcher: &Arc<dyn Fetcher>) -> Option<PlayerEvent> {
        if let Some(native) = self.native.as_mut() {
            native.poll();
        }

        let outcome = {
            let loader = self.loader.as_mut()?;
            let pending = loader.pending.as_ref()?;
            pending.try_result()?
        };

        match outcome {
            Ok(fetched) => {
                let loader = self.loader.as_mut()?;
                let len = fetched.data.len() as u64;
                let offset = loader.next_offset;
                let end_of_media = len < loader.segment_bytes;
                debug!(
                    index = self.index,
                    offset,
                    len,
                    source = ?fetched.source,
                    end_of_media,
                    "player: range loaded"
                );
                loader.pending = None;
                loader.next_offset += len;
                if !end_of_media {
                    loader.pending = Some(cache.request(loader.key(&self.media.url), fetcher.clone()));
                }
                self.command(|native| native.append(offset, &fetched.data, end_of_media))
            }
            Err(err) => {
                warn!(index = self.index, media = %self.media.id, error = %err, "player: range load failed");
                Some(self.fail(err.to_string()))
            }
        }
    }

    /// Cancels outstanding range requests and frees the native session.
    pub(crate) fn release(&mut self) {
        // Dropping the Pending unsubscribes this handle from its fetch.
        self.loader = None;
        if let Some(mut native) = self.native.take() {
            native.release();
        }
        self.wants_play = false;
        debug!(index = self.index, media = %self.media.id, "player: released");
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        if self.native.is_some() {
            self.release();
        }
    }
}
