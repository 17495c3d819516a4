//! Bounded, persistent LRU store of media byte ranges.
//!
//! Resident reads and network fetches run on separate worker pools, so a
//! slow download never holds up bytes already on disk. Callers get a
//! [`Pending`] they can poll from the dispatch thread or block on. Concurrent requests
//! for the same [`CacheKey`] share one underlying fetch (single-flight), and
//! dropping a `Pending` unsubscribes only that caller.
//!
//! Overlapping ranges of the same URL are distinct keys; the store never
//! coalesces them.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::fetch::Fetcher;
use crate::storage::{self, IndexRow};

#[derive(Debug, Clone)]
pub struct Config {
    pub dir: Option<PathBuf>,
    pub capacity_bytes: u64,
    pub fetch_timeout: Duration,
    pub workers: usize,
    pub retry_transient: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from(&crate::config::CacheConfig::default())
    }
}

impl From<&crate::config::CacheConfig> for Config {
    fn from(cfg: &crate::config::CacheConfig) -> Self {
        Self {
            dir: cfg.dir.clone(),
            capacity_bytes: cfg.capacity_bytes,
            fetch_timeout: cfg.fetch_timeout,
            workers: cfg.workers,
            retry_transient: cfg.retry_transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub url: String,
    pub range_start: u64,
    pub range_length: u64,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, range_start: u64, range_length: u64) -> Self {
        Self {
            url: url.into(),
            range_start,
            range_length,
        }
    }

    fn file_name(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.url.as_bytes());
        hasher.update(self.range_start.to_le_bytes());
        hasher.update(self.range_length.to_le_bytes());
        format!("{}.bin", hex::encode(hasher.finalize()))
    }
}

/// Where the returned bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Hit,
    Stored,
    /// Served once but not persisted: larger than the whole budget, or the
    /// blob could not be written.
    NotCacheable,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub key: CacheKey,
    pub data: Arc<[u8]>,
    pub source: Source,
}

pub type FetchOutcome = std::result::Result<Fetched, CacheError>;

/// Eviction-relevant view of one resident entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub size_bytes: u64,
    pub last_access: u64,
    pub inserted_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
}

/// Strict LRU victim selection: oldest `last_access` first, ties broken by
/// insertion order. Returns keys in eviction order.
pub fn eviction_policy(entries: &[EntrySnapshot], required_free_bytes: u64) -> Vec<CacheKey> {
    if required_free_bytes == 0 {
        return Vec::new();
    }
    let mut ordered: Vec<&EntrySnapshot> = entries.iter().collect();
    ordered.sort_by_key(|entry| (entry.last_access, entry.inserted_seq));

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for entry in ordered {
        if freed >= required_free_bytes {
            break;
        }
        freed = freed.saturating_add(entry.size_bytes);
        victims.push(entry.key.clone());
    }
    victims
}

struct Resident {
    size_bytes: u64,
    last_access: AtomicU64,
    inserted_seq: u64,
    path: PathBuf,
    checksum: String,
}

#[derive(Default)]
struct Index {
    entries: HashMap<CacheKey, Resident>,
    total_bytes: u64,
}

impl Index {
    fn insert(&mut self, key: CacheKey, resident: Resident) {
        self.total_bytes += resident.size_bytes;
        if let Some(old) = self.entries.insert(key, resident) {
            self.total_bytes -= old.size_bytes;
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Resident> {
        let resident = self.entries.remove(key)?;
        self.total_bytes -= resident.size_bytes;
        Some(resident)
    }

    fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries
            .iter()
            .map(|(key, resident)| EntrySnapshot {
                key: key.clone(),
                size_bytes: resident.size_bytes,
                last_access: resident.last_access.load(Ordering::SeqCst),
                inserted_seq: resident.inserted_seq,
            })
            .collect()
    }
}

/// One in-flight fetch and the callers still waiting on it.
struct Flight {
    subscribers: Mutex<Vec<(u64, Sender<FetchOutcome>)>>,
}

impl Flight {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, id: u64, tx: Sender<FetchOutcome>) {
        self.subscribers.lock().push((id, tx));
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sub, _)| *sub != id);
    }

    fn is_wanted(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    fn complete(&self, outcome: FetchOutcome) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for (_, tx) in subscribers {
            let _ = tx.send(outcome.clone());
        }
    }
}

/// A caller's subscription to one fetch. Dropping it cancels interest for
/// this caller only.
pub struct Pending {
    rx: Receiver<FetchOutcome>,
    flight: Arc<Flight>,
    subscriber: u64,
    deadline: Instant,
    timeout: Duration,
}

impl Pending {
    /// Non-blocking check; yields `Timeout` once the deadline has passed.
    pub fn try_result(&self) -> Option<FetchOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => {
                if Instant::now() >= self.deadline {
                    Some(Err(CacheError::Timeout(self.timeout)))
                } else {
                    None
                }
            }
            Err(TryRecvError::Disconnected) => Some(Err(CacheError::Closed)),
        }
    }

    pub fn wait(self) -> FetchOutcome {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(CacheError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CacheError::Closed),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.flight.unsubscribe(self.subscriber);
    }
}

struct Job {
    key: CacheKey,
    fetcher: Arc<dyn Fetcher>,
    flight: Arc<Flight>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// Entries already on disk.
    Read,
    Fetch,
}

struct Inner {
    store: storage::Store,
    cfg: Config,
    dir: PathBuf,
    index: RwLock<Index>,
    clock: AtomicU64,
    seq: AtomicU64,
    inflight: Mutex<HashMap<CacheKey, Arc<Flight>>>,
    next_subscriber: AtomicU64,
    reads: Sender<Job>,
    jobs: Sender<Job>,
    stop: Sender<()>,
}

pub struct CacheStore {
    inner: Arc<Inner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl CacheStore {
    pub fn open(store: storage::Store, cfg: Config) -> Result<Self> {
        let mut cfg = cfg;
        if cfg.workers == 0 {
            cfg.workers = 2;
        }
        let dir = cfg.dir.clone().context("cache: cache dir not configured")?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("cache: create directory {}", dir.display()))?;

        let rows = store.list_entries().context("cache: load index")?;
        let mut index = Index::default();
        let mut clock = 0u64;
        let mut seq = 0u64;
        for row in rows {
            clock = clock.max(row.last_access);
            seq = seq.max(row.inserted_seq);
            let key = CacheKey::new(row.url, row.range_start, row.range_length);
            index.insert(
                key,
                Resident {
                    size_bytes: row.size_bytes,
                    last_access: AtomicU64::new(row.last_access),
                    inserted_seq: row.inserted_seq,
                    path: PathBuf::from(row.file_path),
                    checksum: row.checksum,
                },
            );
        }
        info!(
            entries = index.entries.len(),
            bytes = index.total_bytes,
            capacity = cfg.capacity_bytes,
            dir = %dir.display(),
            "cache: index loaded"
        );

        let (read_tx, read_rx) = unbounded();
        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let inner = Arc::new(Inner {
            store,
            cfg,
            dir,
            index: RwLock::new(index),
            clock: AtomicU64::new(clock),
            seq: AtomicU64::new(seq),
            inflight: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            reads: read_tx,
            jobs: job_tx,
            stop: stop_tx,
        });
        // A reduced budget since the last run is enforced up front.
        inner.trim_to_capacity();

        let mut handles = Vec::new();
        for (lane, rx) in [(Lane::Read, &read_rx), (Lane::Fetch, &job_rx)] {
            for _ in 0..inner.cfg.workers {
                let rx_jobs = rx.clone();
                let rx_stop = stop_rx.clone();
                let worker_inner = inner.clone();
                handles.push(thread::spawn(move || {
                    worker_inner.worker(lane, rx_jobs, rx_stop)
                }));
            }
        }

        Ok(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// Starts (or joins) the fetch for `key` without blocking.
    pub fn request(&self, key: CacheKey, fetcher: Arc<dyn Fetcher>) -> Pending {
        let (tx, rx) = bounded(1);
        let subscriber = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let timeout = self.inner.cfg.fetch_timeout;
        let deadline = Instant::now() + timeout;

        let mut inflight = self.inner.inflight.lock();
        if let Some(flight) = inflight.get(&key) {
            debug!(url = %key.url, start = key.range_start, "cache: joined in-flight fetch");
            flight.subscribe(subscriber, tx);
            return Pending {
                rx,
                flight: flight.clone(),
                subscriber,
                deadline,
                timeout,
            };
        }

        let flight = Arc::new(Flight::new());
        flight.subscribe(subscriber, tx);
        inflight.insert(key.clone(), flight.clone());
        drop(inflight);

        let job = Job {
            key: key.clone(),
            fetcher,
            flight: flight.clone(),
        };
        let lane = if self.contains(&key) {
            &self.inner.reads
        } else {
            &self.inner.jobs
        };
        if lane.send(job).is_err() {
            self.inner.inflight.lock().remove(&key);
            flight.complete(Err(CacheError::Closed));
        }

        Pending {
            rx,
            flight,
            subscriber,
            deadline,
            timeout,
        }
    }

    /// Blocking form of [`CacheStore::request`].
    pub fn get_or_fetch<F>(&self, key: CacheKey, fetcher: F) -> FetchOutcome
    where
        F: Fetcher + 'static,
    {
        self.request(key, Arc::new(fetcher)).wait()
    }

    /// Removes every range cached for `url`. Returns how many were dropped.
    pub fn invalidate(&self, url: &str) -> usize {
        let removed: Vec<Resident> = {
            let mut index = self.inner.index.write();
            let keys: Vec<CacheKey> = index
                .entries
                .keys()
                .filter(|key| key.url == url)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| index.remove(key)).collect()
        };
        if let Err(err) = self.inner.store.delete_by_url(url) {
            warn!(url, error = %format!("{err:#}"), "cache: failed to drop index rows");
        }
        for resident in &removed {
            remove_blob(&resident.path);
        }
        if !removed.is_empty() {
            info!(url, entries = removed.len(), "cache: invalidated");
        }
        removed.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.index.read().entries.contains_key(key)
    }

    /// Resident entries in eviction order.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let mut entries = self.inner.index.read().snapshot();
        entries.sort_by_key(|entry| (entry.last_access, entry.inserted_seq));
        entries
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.read();
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            capacity_bytes: self.inner.cfg.capacity_bytes,
        }
    }

    fn shutdown(&self) {
        let mut handles = self.handles.lock();
        for _ in handles.iter() {
            let _ = self.inner.stop.send(());
        }
        while let Some(handle) = handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, lane: Lane, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(job) => self.process(lane, job),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn process(&self, lane: Lane, job: Job) {
        // Checked under the in-flight lock so a caller joining now is not
        // handed a cancellation.
        let abandoned = {
            let mut inflight = self.inflight.lock();
            let abandoned = !job.flight.is_wanted();
            if abandoned {
                inflight.remove(&job.key);
            }
            abandoned
        };
        if abandoned {
            debug!(url = %job.key.url, start = job.key.range_start, "cache: nobody waiting, skipping fetch");
            job.flight.complete(Err(CacheError::Cancelled));
            return;
        }

        if lane == Lane::Read {
            if let Some(data) = self.read_resident(&job.key) {
                self.inflight.lock().remove(&job.key);
                job.flight.complete(Ok(Fetched {
                    key: job.key,
                    data,
                    source: Source::Hit,
                }));
                return;
            }
            // Evicted or unreadable since the request; fetch it instead.
            if let Err(err) = self.jobs.send(job) {
                let job = err.0;
                self.inflight.lock().remove(&job.key);
                job.flight.complete(Err(CacheError::Closed));
            }
            return;
        }

        let outcome = self.resolve(&job.key, job.fetcher.as_ref());
        self.inflight.lock().remove(&job.key);
        job.flight.complete(outcome);
    }

    fn resolve(&self, key: &CacheKey, fetcher: &dyn Fetcher) -> FetchOutcome {
        if let Some(data) = self.read_resident(key) {
            return Ok(Fetched {
                key: key.clone(),
                data,
                source: Source::Hit,
            });
        }

        let bytes = self.fetch_with_retry(key, fetcher)?;
        let data: Arc<[u8]> = Arc::from(bytes);
        let source = match self.insert(key, &data) {
            Ok(source) => source,
            Err(err) => {
                warn!(url = %key.url, error = %err, "cache: store failed, serving uncached");
                Source::NotCacheable
            }
        };
        Ok(Fetched {
            key: key.clone(),
            data,
            source,
        })
    }

    fn fetch_with_retry(&self, key: &CacheKey, fetcher: &dyn Fetcher) -> Result<Vec<u8>, CacheError> {
        debug!(url = %key.url, start = key.range_start, len = key.range_length, "cache: miss");
        match fetcher.fetch(key) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_transient() && self.cfg.retry_transient => {
                warn!(url = %key.url, error = %err, "cache: transient fetch failure, retrying once");
                fetcher.fetch(key).map_err(CacheError::from)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn next_stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read_resident(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        let (path, checksum, stamp) = {
            let index = self.index.read();
            let resident = index.entries.get(key)?;
            let stamp = self.next_stamp();
            resident.last_access.fetch_max(stamp, Ordering::SeqCst);
            (resident.path.clone(), resident.checksum.clone(), stamp)
        };

        match fs::read(&path) {
            Ok(bytes) if sha1_hex(&bytes) == checksum => {
                if let Err(err) =
                    self.store
                        .touch_entry(&key.url, key.range_start, key.range_length, stamp)
                {
                    warn!(error = %format!("{err:#}"), "cache: failed to persist access");
                }
                debug!(url = %key.url, start = key.range_start, "cache: hit");
                Some(Arc::from(bytes))
            }
            Ok(_) => {
                warn!(path = %path.display(), "cache: corrupt entry dropped");
                self.drop_entry(key);
                None
            }
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    debug!(path = %path.display(), "cache: blob missing, dropping entry");
                } else {
                    warn!(path = %path.display(), error = %err, "cache: unreadable entry dropped");
                }
                self.drop_entry(key);
                None
            }
        }
    }

    fn insert(&self, key: &CacheKey, data: &[u8]) -> Result<Source, CacheError> {
        let size = data.len() as u64;
        if size > self.cfg.capacity_bytes {
            info!(
                url = %key.url,
                size,
                capacity = self.cfg.capacity_bytes,
                "cache: entry exceeds budget, not cacheable"
            );
            return Ok(Source::NotCacheable);
        }

        let path = self.dir.join(key.file_name());
        fs::write(&path, data)?;
        let checksum = sha1_hex(data);

        let mut index = self.index.write();
        // Same key means same blob path; only the accounting goes.
        index.remove(key);

        let required = (index.total_bytes + size).saturating_sub(self.cfg.capacity_bytes);
        if required > 0 {
            let victims = eviction_policy(&index.snapshot(), required);
            for victim in victims {
                if let Some(resident) = index.remove(&victim) {
                    debug!(
                        url = %victim.url,
                        start = victim.range_start,
                        size = resident.size_bytes,
                        "cache: evicted"
                    );
                    if let Err(err) = self.store.delete_entry(
                        &victim.url,
                        victim.range_start,
                        victim.range_length,
                    ) {
                        warn!(error = %format!("{err:#}"), "cache: failed to delete index row");
                    }
                    remove_blob(&resident.path);
                }
            }
        }

        let stamp = self.next_stamp();
        let inserted_seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let row = IndexRow {
            url: key.url.clone(),
            range_start: key.range_start,
            range_length: key.range_length,
            size_bytes: size,
            last_access: stamp,
            inserted_seq,
            file_path: path.to_string_lossy().to_string(),
            checksum: checksum.clone(),
            stored_at: Utc::now(),
        };
        if let Err(err) = self.store.upsert_entry(&row) {
            drop(index);
            remove_blob(&path);
            return Err(err.into());
        }
        index.insert(
            key.clone(),
            Resident {
                size_bytes: size,
                last_access: AtomicU64::new(stamp),
                inserted_seq,
                path,
                checksum,
            },
        );
        debug_assert!(index.total_bytes <= self.cfg.capacity_bytes);
        debug!(url = %key.url, start = key.range_start, size, "cache: stored");
        Ok(Source::Stored)
    }

    fn drop_entry(&self, key: &CacheKey) {
        let removed = self.index.write().remove(key);
        if let Some(resident) = removed {
            if let Err(err) = self
                .store
                .delete_entry(&key.url, key.range_start, key.range_length)
            {
                warn!(error = %format!("{err:#}"), "cache: failed to delete index row");
            }
            remove_blob(&resident.path);
        }
    }

    fn trim_to_capacity(&self) {
        let mut index = self.index.write();
        let required = index
            .total_bytes
            .saturating_sub(self.cfg.capacity_bytes);
        if required == 0 {
            return;
        }
        let victims = eviction_policy(&index.snapshot(), required);
        info!(victims = victims.len(), "cache: trimming to capacity");
        for victim in victims {
            if let Some(resident) = index.remove(&victim) {
                if let Err(err) =
                    self.store
                        .delete_entry(&victim.url, victim.range_start, victim.range_length)
                {
                    warn!(error = %format!("{err:#}"), "cache: failed to delete index row");
                }
                remove_blob(&resident.path);
            }
        }
    }
}

fn remove_blob(path: &std::path::Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "cache: failed to remove blob");
        }
    }
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use tempfile::{tempdir, TempDir};

    fn open_store(dir: &TempDir, capacity: u64) -> CacheStore {
        open_with(dir, capacity, Duration::from_secs(5), 2)
    }

    fn open_with(dir: &TempDir, capacity: u64, timeout: Duration, workers: usize) -> CacheStore {
        let index = storage::Store::open(storage::Options {
            path: Some(dir.path().join("index.db")),
        })
        .unwrap();
        CacheStore::open(
            index,
            Config {
                dir: Some(dir.path().join("blobs")),
                capacity_bytes: capacity,
                fetch_timeout: timeout,
                workers,
                retry_transient: true,
            },
        )
        .unwrap()
    }

    fn sized(size: usize) -> impl Fn(&CacheKey) -> Result<Vec<u8>, FetchError> + Send + Sync {
        move |key: &CacheKey| Ok(vec![key.url.len() as u8; size])
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(format!("https://cdn.test/{name}.mp4"), 0, 4)
    }

    fn resident_urls(store: &CacheStore) -> Vec<String> {
        store.entries().into_iter().map(|e| e.key.url).collect()
    }

    #[test]
    fn policy_picks_oldest_until_enough_is_free() {
        let entries = vec![
            EntrySnapshot { key: key("a"), size_bytes: 4, last_access: 7, inserted_seq: 1 },
            EntrySnapshot { key: key("b"), size_bytes: 4, last_access: 3, inserted_seq: 2 },
            EntrySnapshot { key: key("c"), size_bytes: 4, last_access: 3, inserted_seq: 3 },
        ];
        assert_eq!(eviction_policy(&entries, 5), vec![key("b"), key("c")]);
        assert_eq!(eviction_policy(&entries, 1), vec![key("b")]);
        assert!(eviction_policy(&entries, 0).is_empty());
    }

    #[test]
    fn third_insert_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 10);
        for name in ["a", "b", "c"] {
            let fetched = store.get_or_fetch(key(name), sized(4)).unwrap();
            assert_eq!(fetched.source, Source::Stored);
        }
        assert_eq!(
            resident_urls(&store),
            vec!["https://cdn.test/b.mp4", "https://cdn.test/c.mp4"]
        );
        assert_eq!(store.stats().total_bytes, 8);
    }

    #[test]
    fn hit_refreshes_recency() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 10);
        store.get_or_fetch(key("a"), sized(4)).unwrap();
        store.get_or_fetch(key("b"), sized(4)).unwrap();
        let hit = store.get_or_fetch(key("a"), sized(4)).unwrap();
        assert_eq!(hit.source, Source::Hit);
        store.get_or_fetch(key("c"), sized(4)).unwrap();
        assert!(store.contains(&key("a")));
        assert!(!store.contains(&key("b")));
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 64);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..120 {
            let name = format!("item{}", rng.gen_range(0..12));
            let size = rng.gen_range(1..=24);
            store.get_or_fetch(key(&name), sized(size)).unwrap();
            let stats = store.stats();
            assert!(stats.total_bytes <= stats.capacity_bytes);
            let summed: u64 = store.entries().iter().map(|e| e.size_bytes).sum();
            assert_eq!(summed, stats.total_bytes);
        }
    }

    #[test]
    fn eviction_is_deterministic_for_identical_histories() {
        let history = ["a", "b", "a", "c", "d", "b", "e", "a", "f", "c"];
        let run = || {
            let dir = tempdir().unwrap();
            let store = open_store(&dir, 12);
            for name in history {
                store.get_or_fetch(key(name), sized(4)).unwrap();
            }
            resident_urls(&store)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn oversized_entry_is_served_but_not_kept() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 10);
        store.get_or_fetch(key("a"), sized(4)).unwrap();
        let fetched = store.get_or_fetch(key("big"), sized(11)).unwrap();
        assert_eq!(fetched.source, Source::NotCacheable);
        assert_eq!(fetched.data.len(), 11);
        assert!(store.contains(&key("a")));
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn concurrent_misses_share_one_fetch() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open_with(&dir, 1024, Duration::from_secs(5), 4));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.get_or_fetch(key("shared"), move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(150));
                        Ok(vec![1u8; 4])
                    })
                })
            })
            .collect();

        for handle in threads {
            let fetched = handle.join().unwrap().unwrap();
            assert_eq!(&fetched.data[..], &[1, 1, 1, 1]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_failure_reaches_every_waiter() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1024);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let failing: Arc<dyn Fetcher> = Arc::new(move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
            let _ = gate_rx.recv();
            Err(FetchError::permanent("404 not found"))
        });
        let first = store.request(key("gone"), failing.clone());
        let second = store.request(key("gone"), failing);
        gate_tx.send(()).unwrap();
        for pending in [first, second] {
            match pending.wait() {
                Err(CacheError::Fetch(err)) => assert!(!err.is_transient()),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn dropping_one_waiter_does_not_cancel_the_other() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1024);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let slow: Arc<dyn Fetcher> = Arc::new(move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
            let _ = gate_rx.recv();
            Ok(vec![9u8; 4])
        });
        let first = store.request(key("a"), slow.clone());
        let second = store.request(key("a"), slow);
        drop(first);
        gate_tx.send(()).unwrap();
        let fetched = second.wait().unwrap();
        assert_eq!(fetched.data.len(), 4);
        assert!(store.contains(&key("a")));
    }

    #[test]
    fn abandoned_request_is_never_fetched() {
        let dir = tempdir().unwrap();
        let store = open_with(&dir, 1024, Duration::from_secs(5), 1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let blocker = store.request(
            key("blocker"),
            Arc::new(move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
                let _ = gate_rx.recv();
                Ok(vec![0u8; 1])
            }),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let abandoned = store.request(
            key("abandoned"),
            Arc::new(move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(vec![0u8; 1])
            }),
        );
        drop(abandoned);
        gate_tx.send(()).unwrap();
        blocker.wait().unwrap();

        // The worker is serial, so the abandoned job has been processed by now
        // once a later request completes.
        store.get_or_fetch(key("after"), sized(1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!store.contains(&key("abandoned")));
    }

    #[test]
    fn slow_fetch_times_out() {
        let dir = tempdir().unwrap();
        let store = open_with(&dir, 1024, Duration::from_millis(50), 2);
        let outcome = store.get_or_fetch(key("slow"), |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
            thread::sleep(Duration::from_millis(300));
            Ok(vec![0u8; 4])
        });
        assert_eq!(outcome.unwrap_err(), CacheError::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn resident_hit_is_not_queued_behind_slow_fetches() {
        let dir = tempdir().unwrap();
        let store = open_with(&dir, 1024, Duration::from_millis(300), 2);
        store.get_or_fetch(key("a"), sized(4)).unwrap();

        let (gate_tx, gate_rx) = bounded::<()>(0);
        let stalled: Arc<dyn Fetcher> = Arc::new(move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
            let _ = gate_rx.recv();
            Ok(vec![0u8; 4])
        });
        let b = store.request(key("b"), stalled.clone());
        let c = store.request(key("c"), stalled);

        let started = Instant::now();
        let hit = store
            .get_or_fetch(key("a"), |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
                Err(FetchError::permanent("offline"))
            })
            .unwrap();
        assert_eq!(hit.source, Source::Hit);
        assert!(started.elapsed() < Duration::from_millis(300));

        drop(gate_tx);
        drop((b, c));
    }

    #[test]
    fn default_config_uses_configured_cache_dir() {
        assert_eq!(Config::default().dir, crate::config::CacheConfig::default().dir);
        assert_eq!(Config::default().capacity_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn transient_failure_is_retried_once() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1024);
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let fetched = store
            .get_or_fetch(key("flaky"), move |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FetchError::transient("connection reset"))
                } else {
                    Ok(vec![3u8; 4])
                }
            })
            .unwrap();
        assert_eq!(fetched.source, Source::Stored);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_drops_all_ranges_for_url() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1024);
        let url = "https://cdn.test/a.mp4";
        store.get_or_fetch(CacheKey::new(url, 0, 4), sized(4)).unwrap();
        store.get_or_fetch(CacheKey::new(url, 2, 4), sized(4)).unwrap();
        store.get_or_fetch(key("b"), sized(4)).unwrap();
        assert_eq!(store.stats().entries, 3);
        assert_eq!(store.invalidate(url), 2);
        assert_eq!(store.invalidate("https://cdn.test/none.mp4"), 0);
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn missing_blob_is_treated_as_miss() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1024);
        store.get_or_fetch(key("a"), sized(4)).unwrap();
        let blob = dir.path().join("blobs").join(key("a").file_name());
        fs::remove_file(&blob).unwrap();
        let again = store.get_or_fetch(key("a"), sized(4)).unwrap();
        assert_eq!(again.source, Source::Stored);
        assert!(blob.exists());
    }

    #[test]
    fn corrupt_blob_is_refetched() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 1024);
        store.get_or_fetch(key("a"), sized(4)).unwrap();
        let blob = dir.path().join("blobs").join(key("a").file_name());
        fs::write(&blob, b"junk").unwrap();
        let again = store.get_or_fetch(key("a"), sized(4)).unwrap();
        assert_eq!(again.source, Source::Stored);
    }

    #[test]
    fn index_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir, 1024);
            store.get_or_fetch(key("a"), sized(4)).unwrap();
            store.get_or_fetch(key("b"), sized(4)).unwrap();
        }
        let store = open_store(&dir, 1024);
        assert_eq!(store.stats().entries, 2);
        let fetched = store
            .get_or_fetch(key("a"), |_: &CacheKey| -> Result<Vec<u8>, FetchError> {
                Err(FetchError::permanent("offline"))
            })
            .unwrap();
        assert_eq!(fetched.source, Source::Hit);
    }

    #[test]
    fn reduced_budget_trims_on_open() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir, 1024);
            for name in ["a", "b", "c"] {
                store.get_or_fetch(key(name), sized(4)).unwrap();
            }
        }
        let store = open_store(&dir, 8);
        assert_eq!(
            resident_urls(&store),
            vec!["https://cdn.test/b.mp4", "https://cdn.test/c.mp4"]
        );
    }
}
