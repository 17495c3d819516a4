//! Keeps a small window of player handles warm around the current feed index.
//!
//! Only the dispatch thread touches the pool. Window membership is updated
//! synchronously inside [`PlayerPool::acquire`], so a second acquire for the
//! same index always finds the first handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::feed::MediaRef;
use crate::fetch::Fetcher;
use crate::player::{
    CachePolicy, EngineEvent, HandleId, OpenParams, PlayerBackend, PlayerEvent, PlayerHandle,
};
use crate::reel::Message;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum live handles (W).
    pub window: usize,
    pub segment_bytes: u64,
    pub start_muted: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            window: 3,
            segment_bytes: 1024 * 1024,
            start_muted: false,
        }
    }
}

pub struct PlayerPool {
    backend: Arc<dyn PlayerBackend>,
    cache: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    cfg: PoolConfig,
    handles: BTreeMap<usize, PlayerHandle>,
    current_index: usize,
    muted: bool,
    next_id: u64,
    queue_tx: Sender<Message>,
    queue_rx: Receiver<Message>,
}

impl PlayerPool {
    pub fn new(
        backend: Arc<dyn PlayerBackend>,
        cache: Arc<CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        cfg: PoolConfig,
    ) -> Self {
        let mut cfg = cfg;
        cfg.window = cfg.window.max(1);
        let (queue_tx, queue_rx) = unbounded();
        Self {
            backend,
            cache,
            fetcher,
            cfg,
            handles: BTreeMap::new(),
            current_index: 0,
            muted: cfg.start_muted,
            next_id: 1,
            queue_tx,
            queue_rx,
        }
    }

    /// Dispatch queue. Engines of every handle write into it, and so does
    /// anything holding [`PlayerPool::queue_sender`], so one receiver sees
    /// all of it in arrival order.
    pub fn queue(&self) -> &Receiver<Message> {
        &self.queue_rx
    }

    pub fn queue_sender(&self) -> Sender<Message> {
        self.queue_tx.clone()
    }

    pub fn window(&self) -> usize {
        self.cfg.window
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Proximity reference for window eviction.
    pub fn set_current_index(&mut self, index: usize) {
        self.current_index = index;
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.handles.keys().copied().collect()
    }

    pub fn handle_at(&self, index: usize) -> Option<&PlayerHandle> {
        self.handles.get(&index)
    }

    pub fn playing_count(&self) -> usize {
        self.handles
            .values()
            .filter(|handle| handle.state().is_playing())
            .count()
    }

    /// Returns the live handle for `media` at `index`, constructing one if
    /// needed. A full window first gives up its least-proximate handle.
    pub fn acquire(&mut self, index: usize, media: &MediaRef) -> &PlayerHandle {
        let reusable = self
            .handles
            .get(&index)
            .is_some_and(|handle| handle.media().id == media.id);
        if !reusable {
            if let Some(mut stale) = self.handles.remove(&index) {
                debug!(index, media = %stale.media().id, "pool: index now holds different media");
                stale.release();
            }
            while self.handles.len() >= self.cfg.window {
                let Some(victim) = self.least_proximate(index) else {
                    break;
                };
                if let Some(mut handle) = self.handles.remove(&victim) {
                    info!(
                        victim,
                        incoming = index,
                        current = self.current_index,
                        "pool: window full, evicting least proximate handle"
                    );
                    handle.release();
                }
            }

            let id = HandleId(self.next_id);
            self.next_id += 1;
            let handle = PlayerHandle::open(
                OpenParams {
                    id,
                    index,
                    media,
                    muted: self.muted,
                    policy: CachePolicy {
                        segment_bytes: self.cfg.segment_bytes,
                    },
                    backend: self.backend.as_ref(),
                    events: self.queue_tx.clone(),
                },
                &self.cache,
                &self.fetcher,
            );
            debug!(index, media = %media.id, state = %handle.state(), "pool: acquired");
            self.handles.insert(index, handle);
        }
        &self.handles[&index]
    }

    /// Farthest from the current index; ties go to the one farther from the
    /// incoming index.
    fn least_proximate(&self, incoming: usize) -> Option<usize> {
        self.handles.keys().copied().max_by_key(|&idx| {
            (
                idx.abs_diff(self.current_index),
                idx.abs_diff(incoming),
            )
        })
    }

    /// Tears down the handle for `media`. Idempotent.
    pub fn release(&mut self, media: &MediaRef) {
        if let Some(index) = self.index_of(media) {
            self.release_index(index);
        }
    }

    pub fn release_index(&mut self, index: usize) {
        if let Some(mut handle) = self.handles.remove(&index) {
            handle.release();
        }
    }

    /// Releases every handle whose index is not in `keep`.
    pub fn retain_indices(&mut self, keep: &[usize]) {
        let doomed: Vec<usize> = self
            .handles
            .keys()
            .copied()
            .filter(|index| !keep.contains(index))
            .collect();
        for index in doomed {
            debug!(index, "pool: released outside window");
            self.release_index(index);
        }
    }

    pub fn release_all(&mut self) {
        let indices = self.indices();
        for index in indices {
            self.release_index(index);
        }
    }

    /// The same media can sit at several feed indices; the copy nearest the
    /// current index answers media-addressed commands.
    fn index_of(&self, media: &MediaRef) -> Option<usize> {
        self.handles
            .iter()
            .filter(|(_, handle)| handle.media().id == media.id)
            .min_by_key(|(index, _)| index.abs_diff(self.current_index))
            .map(|(index, _)| *index)
    }

    /// Plays or pauses `media`. Playing demotes any other playing handle to
    /// `Paused` first. Commands for released media are dropped.
    pub fn set_playing(&mut self, media: &MediaRef, playing: bool) -> Vec<(usize, PlayerEvent)> {
        let Some(target) = self.index_of(media) else {
            debug!(media = %media.id, playing, "pool: dropping command for released handle");
            return Vec::new();
        };
        self.set_playing_at(target, playing)
    }

    /// Index-addressed form of [`PlayerPool::set_playing`].
    pub fn set_playing_at(&mut self, target: usize, playing: bool) -> Vec<(usize, PlayerEvent)> {
        if !self.handles.contains_key(&target) {
            debug!(index = target, playing, "pool: dropping command for released handle");
            return Vec::new();
        }
        let mut surfaced = Vec::new();
        if playing {
            self.pause_others(target, &mut surfaced);
        }
        if let Some(handle) = self.handles.get_mut(&target) {
            if let Some(event) = handle.set_playing(playing) {
                surfaced.push((target, event));
            }
        }
        surfaced
    }

    /// Rewinds `media` to zero and plays it.
    pub fn restart(&mut self, media: &MediaRef) -> Vec<(usize, PlayerEvent)> {
        let Some(target) = self.index_of(media) else {
            debug!(media = %media.id, "pool: dropping restart for released handle");
            return Vec::new();
        };
        self.restart_at(target)
    }

    pub fn restart_at(&mut self, target: usize) -> Vec<(usize, PlayerEvent)> {
        if !self.handles.contains_key(&target) {
            debug!(index = target, "pool: dropping restart for released handle");
            return Vec::new();
        }
        let mut surfaced = Vec::new();
        self.pause_others(target, &mut surfaced);
        if let Some(handle) = self.handles.get_mut(&target) {
            if let Some(event) = handle.restart() {
                surfaced.push((target, event));
            }
        }
        surfaced
    }

    fn pause_others(&mut self, keep: usize, surfaced: &mut Vec<(usize, PlayerEvent)>) {
        for (index, handle) in self.handles.iter_mut() {
            if *index == keep {
                continue;
            }
            // Also clears a pending play intent on handles still loading.
            if handle.is_active() {
                if let Some(event) = handle.set_playing(false) {
                    surfaced.push((*index, event));
                }
            }
        }
    }

    pub fn set_muted(&mut self, media: &MediaRef, muted: bool) -> Vec<(usize, PlayerEvent)> {
        let Some(target) = self.index_of(media) else {
            debug!(media = %media.id, muted, "pool: dropping mute for released handle");
            return Vec::new();
        };
        self.handles
            .get_mut(&target)
            .and_then(|handle| handle.set_muted(muted))
            .map(|event| vec![(target, event)])
            .unwrap_or_default()
    }

    /// Mutes every live handle; new handles inherit the setting.
    pub fn set_all_muted(&mut self, muted: bool) -> Vec<(usize, PlayerEvent)> {
        self.muted = muted;
        let mut surfaced = Vec::new();
        for (index, handle) in self.handles.iter_mut() {
            if let Some(event) = handle.set_muted(muted) {
                surfaced.push((*index, event));
            }
        }
        surfaced
    }

    /// Applies an engine event. Events from released handles are dropped.
    ///
    /// Only the handle last told to play carries a play intent, so a `Ready`
    /// can promote at most that one handle to `Playing`.
    pub fn dispatch(&mut self, event: EngineEvent) -> Option<(usize, PlayerEvent)> {
        let Some(index) = self.index_for_id(event.handle) else {
            debug!(handle = event.handle.0, "pool: dropping event for released handle");
            return None;
        };
        let handle = self.handles.get_mut(&index)?;
        handle.on_event(&event.event);
        Some((index, event.event))
    }

    fn index_for_id(&self, id: HandleId) -> Option<usize> {
        self.handles
            .iter()
            .find(|(_, handle)| handle.id() == id)
            .map(|(index, _)| *index)
    }

    /// Advances loaders and engines. Returns load failures per index.
    pub fn pump(&mut self) -> Vec<(usize, PlayerEvent)> {
        let mut surfaced = Vec::new();
        for (index, handle) in self.handles.iter_mut() {
            if let Some(event) = handle.pump(&self.cache, &self.fetcher) {
                surfaced.push((*index, event));
            }
        }
        surfaced
    }
}

impl Drop for PlayerPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{self, CacheKey};
    use crate::error::{FetchError, PlayerError};
    use crate::player::{EventSink, MediaSource, NativePlayer, PlayerState};
    use crate::storage;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, line: String) {
            self.0.lock().push(line);
        }

        fn lines(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Backend {
        log: Arc<Log>,
    }

    impl PlayerBackend for Backend {
        fn name(&self) -> &'static str {
            "test"
        }

        fn construct(
            &self,
            source: &MediaSource<'_>,
            _events: EventSink,
        ) -> Result<Box<dyn NativePlayer>, PlayerError> {
            if source.url.contains("broken") {
                return Err(PlayerError::NativeConstruction("no decoder".into()));
            }
            self.log.push(format!("construct {}", source.url));
            Ok(Box::new(Native {
                url: source.url.to_string(),
                log: self.log.clone(),
            }))
        }
    }

    struct Native {
        url: String,
        log: Arc<Log>,
    }

    impl NativePlayer for Native {
        fn append(&mut self, _: u64, _: &[u8], _: bool) -> Result<(), PlayerError> {
            Ok(())
        }

        fn set_playing(&mut self, playing: bool) -> Result<(), PlayerError> {
            self.log.push(format!("play {} {playing}", self.url));
            Ok(())
        }

        fn set_muted(&mut self, muted: bool) -> Result<(), PlayerError> {
            self.log.push(format!("mute {} {muted}", self.url));
            Ok(())
        }

        fn seek_to_start(&mut self) -> Result<(), PlayerError> {
            self.log.push(format!("seek {}", self.url));
            Ok(())
        }

        fn release(&mut self) {
            self.log.push(format!("release {}", self.url));
        }
    }

    fn pool_with(dir: &TempDir, window: usize) -> (PlayerPool, Arc<Log>) {
        let cache = CacheStore::open(
            storage::Store::open_in_memory().unwrap(),
            cache::Config {
                dir: Some(dir.path().to_path_buf()),
                ..cache::Config::default()
            },
        )
        .unwrap();
        let fetcher: Arc<dyn Fetcher> =
            Arc::new(|_: &CacheKey| -> Result<Vec<u8>, FetchError> { Ok(vec![0u8; 8]) });
        let log = Arc::new(Log::default());
        let pool = PlayerPool::new(
            Arc::new(Backend { log: log.clone() }),
            Arc::new(cache),
            fetcher,
            PoolConfig {
                window,
                segment_bytes: 64,
                start_muted: false,
            },
        );
        (pool, log)
    }

    fn item(i: usize) -> MediaRef {
        MediaRef::new(format!("m{i}"), format!("https://cdn.test/{i}.mp4"))
    }

    fn ready(pool: &mut PlayerPool, index: usize) {
        let handle = pool.handle_at(index).unwrap().id();
        pool.dispatch(EngineEvent {
            handle,
            event: PlayerEvent::Ready,
        });
    }

    #[test]
    fn acquire_outside_window_evicts_least_proximate() {
        let dir = tempdir().unwrap();
        let (mut pool, log) = pool_with(&dir, 3);
        pool.set_current_index(4);
        for i in [3, 4, 5] {
            pool.acquire(i, &item(i));
        }
        pool.acquire(6, &item(6));
        assert_eq!(pool.indices(), vec![4, 5, 6]);
        let lines = log.lines();
        let released = lines
            .iter()
            .position(|l| l == "release https://cdn.test/3.mp4")
            .unwrap();
        let constructed = lines
            .iter()
            .position(|l| l == "construct https://cdn.test/6.mp4")
            .unwrap();
        assert!(released < constructed);
    }

    #[test]
    fn acquire_reuses_live_handle() {
        let dir = tempdir().unwrap();
        let (mut pool, _log) = pool_with(&dir, 3);
        let first = pool.acquire(1, &item(1)).id();
        let second = pool.acquire(1, &item(1)).id();
        assert_eq!(first, second);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.handle_at(1).unwrap().state(), &PlayerState::Loading);
    }

    #[test]
    fn playing_one_handle_pauses_the_other() {
        let dir = tempdir().unwrap();
        let (mut pool, _log) = pool_with(&dir, 3);
        pool.acquire(0, &item(0));
        pool.acquire(1, &item(1));

        pool.set_playing(&item(0), true);
        ready(&mut pool, 0);
        ready(&mut pool, 1);
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Playing);
        assert_eq!(pool.handle_at(1).unwrap().state(), &PlayerState::Ready);

        pool.set_playing(&item(1), true);
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Paused);
        assert_eq!(pool.handle_at(1).unwrap().state(), &PlayerState::Playing);
        assert_eq!(pool.playing_count(), 1);
    }

    #[test]
    fn late_ready_for_demoted_handle_does_not_play() {
        let dir = tempdir().unwrap();
        let (mut pool, _log) = pool_with(&dir, 3);
        pool.acquire(0, &item(0));
        pool.acquire(1, &item(1));
        pool.set_playing(&item(0), true);
        pool.set_playing(&item(1), true);
        ready(&mut pool, 1);
        ready(&mut pool, 0);
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Ready);
        assert_eq!(pool.handle_at(1).unwrap().state(), &PlayerState::Playing);
    }

    #[test]
    fn commands_for_released_media_are_dropped() {
        let dir = tempdir().unwrap();
        let (mut pool, log) = pool_with(&dir, 3);
        let id = pool.acquire(0, &item(0)).id();
        pool.release(&item(0));
        pool.release(&item(0));
        assert!(pool.is_empty());
        assert!(pool.set_playing(&item(0), true).is_empty());
        assert!(pool.set_muted(&item(0), true).is_empty());
        assert!(pool
            .dispatch(EngineEvent {
                handle: id,
                event: PlayerEvent::Ended,
            })
            .is_none());
        let releases = log
            .lines()
            .iter()
            .filter(|l| l.starts_with("release"))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn failed_construction_still_occupies_the_window() {
        let dir = tempdir().unwrap();
        let (mut pool, _log) = pool_with(&dir, 2);
        let broken = MediaRef::new("b", "https://cdn.test/broken.mp4");
        let state = pool.acquire(0, &broken).state().clone();
        assert!(matches!(state, PlayerState::Error(ref m) if m.contains("no decoder")));
        let missing = MediaRef::new("x", "");
        assert_eq!(
            pool.acquire(1, &missing).state(),
            &PlayerState::Error("video URL missing".into())
        );
        assert_eq!(pool.len(), 2);
        pool.set_current_index(1);
        pool.acquire(2, &item(2));
        assert_eq!(pool.indices(), vec![1, 2]);
    }

    #[test]
    fn global_mute_reaches_new_handles() {
        let dir = tempdir().unwrap();
        let (mut pool, log) = pool_with(&dir, 3);
        pool.acquire(0, &item(0));
        pool.set_all_muted(true);
        assert!(pool.acquire(1, &item(1)).muted());
        assert!(pool.handle_at(0).unwrap().muted());
        assert!(log.lines().contains(&"mute https://cdn.test/1.mp4 true".to_string()));
    }

    #[test]
    fn restart_seeks_then_plays() {
        let dir = tempdir().unwrap();
        let (mut pool, log) = pool_with(&dir, 3);
        pool.acquire(0, &item(0));
        pool.set_playing(&item(0), true);
        ready(&mut pool, 0);
        let handle = pool.handle_at(0).unwrap().id();
        pool.dispatch(EngineEvent {
            handle,
            event: PlayerEvent::Ended,
        });
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Ended);

        pool.restart(&item(0));
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Playing);
        let lines = log.lines();
        let tail = &lines[lines.len() - 2..];
        assert_eq!(
            tail,
            &[
                "seek https://cdn.test/0.mp4".to_string(),
                "play https://cdn.test/0.mp4 true".to_string()
            ]
        );
    }

    #[test]
    fn repeated_media_is_addressed_by_index() {
        let dir = tempdir().unwrap();
        let (mut pool, _log) = pool_with(&dir, 3);
        let repeated = item(7);
        pool.acquire(0, &repeated);
        pool.acquire(1, &item(1));
        pool.acquire(2, &repeated);
        pool.set_current_index(2);

        pool.set_playing(&repeated, true);
        ready(&mut pool, 0);
        ready(&mut pool, 2);
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Ready);
        assert_eq!(pool.handle_at(2).unwrap().state(), &PlayerState::Playing);

        pool.set_playing_at(0, true);
        assert_eq!(pool.handle_at(0).unwrap().state(), &PlayerState::Playing);
        assert_eq!(pool.handle_at(2).unwrap().state(), &PlayerState::Paused);

        pool.release(&repeated);
        assert_eq!(pool.indices(), vec![0, 1]);
        assert!(pool.restart_at(2).is_empty());
    }

    #[test]
    fn random_traffic_keeps_window_and_single_player() {
        let dir = tempdir().unwrap();
        let (mut pool, _log) = pool_with(&dir, 3);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..400 {
            let index = rng.gen_range(0..12);
            match rng.gen_range(0..4) {
                0 => pool.set_current_index(index),
                1 => {
                    pool.acquire(index, &item(index));
                }
                2 => {
                    pool.set_playing(&item(index), rng.gen_bool(0.7));
                }
                _ => {
                    if pool.handle_at(index).is_some() {
                        ready(&mut pool, index);
                    }
                }
            }
            assert!(pool.len() <= 3);
            assert!(pool.playing_count() <= 1);
        }
    }
}
