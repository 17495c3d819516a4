//! Native engines behind [`PlayerBackend`].
//!
//! [`HeadlessBackend`] simulates decode from the byte stream alone and is what
//! `--stats`-style runs and the scenario tests drive. [`MpvBackend`] hands the
//! cached ranges to an `mpv` child through a spool file and talks to it over
//! its JSON IPC socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{EngineKind, PlayerConfig};
use crate::error::PlayerError;
use crate::player::{EventSink, MediaSource, NativePlayer, PlayerBackend, PlayerEvent, Progress};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Picks the engine named in the player config.
pub fn backend_for(cfg: &PlayerConfig) -> Arc<dyn PlayerBackend> {
    match cfg.engine {
        EngineKind::Headless => Arc::new(HeadlessBackend::new(cfg.headless_byte_rate)),
        EngineKind::Mpv => Arc::new(MpvBackend::new(cfg.mpv_path.clone(), std::env::temp_dir())),
    }
}

/// Plays media without decoding it: one second of media per `byte_rate`
/// bytes, paced by the wall clock.
#[derive(Debug, Clone)]
pub struct HeadlessBackend {
    byte_rate: u64,
}

impl HeadlessBackend {
    pub fn new(byte_rate: u64) -> Self {
        Self {
            byte_rate: byte_rate.max(1),
        }
    }
}

impl PlayerBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn construct(
        &self,
        source: &MediaSource<'_>,
        events: EventSink,
    ) -> Result<Box<dyn NativePlayer>, PlayerError> {
        debug!(url = source.url, handle = events.handle().0, "headless: construct");
        Ok(Box::new(HeadlessPlayer::new(self.byte_rate, events)))
    }
}

struct HeadlessPlayer {
    sink: EventSink,
    byte_rate: f64,
    buffered_bytes: u64,
    complete: bool,
    ready_sent: bool,
    playing: bool,
    stalled: bool,
    ended: bool,
    position: f64,
    last_tick: Instant,
    last_progress: Option<Instant>,
    released: bool,
}

impl HeadlessPlayer {
    fn new(byte_rate: u64, sink: EventSink) -> Self {
        Self {
            sink,
            byte_rate: byte_rate as f64,
            buffered_bytes: 0,
            complete: false,
            ready_sent: false,
            playing: false,
            stalled: false,
            ended: false,
            position: 0.0,
            last_tick: Instant::now(),
            last_progress: None,
            released: false,
        }
    }

    fn buffered_secs(&self) -> f64 {
        self.buffered_bytes as f64 / self.byte_rate
    }

    fn progress(&self) -> Progress {
        let buffered = self.buffered_secs();
        Progress {
            current_time: self.position,
            playable_duration: buffered,
            seekable_duration: if self.complete { buffered } else { 0.0 },
        }
    }

    /// Moves the playhead by `elapsed` of wall time.
    fn advance(&mut self, elapsed: Duration, now: Instant) {
        if self.released || !self.playing || self.ended || self.stalled {
            return;
        }
        let buffered = self.buffered_secs();
        self.position = (self.position + elapsed.as_secs_f64()).min(buffered);

        if self.position >= buffered {
            if self.complete {
                self.ended = true;
                self.playing = false;
                self.sink.emit(PlayerEvent::Progress(self.progress()));
                self.sink.emit(PlayerEvent::Ended);
                return;
            }
            self.stalled = true;
            self.sink.emit(PlayerEvent::Buffering);
        }

        let due = self
            .last_progress
            .map_or(true, |at| now.duration_since(at) >= PROGRESS_INTERVAL);
        if due {
            self.last_progress = Some(now);
            self.sink.emit(PlayerEvent::Progress(self.progress()));
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick);
        self.last_tick = now;
        self.advance(elapsed, now);
    }
}

impl NativePlayer for HeadlessPlayer {
    fn append(
        &mut self,
        _range_start: u64,
        data: &[u8],
        end_of_media: bool,
    ) -> Result<(), PlayerError> {
        if self.released {
            return Err(PlayerError::Command("append after release".into()));
        }
        self.tick();
        self.buffered_bytes += data.len() as u64;
        self.complete |= end_of_media;
        if !self.ready_sent {
            self.ready_sent = true;
            self.sink.emit(PlayerEvent::Ready);
        } else if self.stalled && (self.buffered_secs() > self.position || self.complete) {
            self.stalled = false;
            self.sink.emit(PlayerEvent::Ready);
        }
        Ok(())
    }

    fn set_playing(&mut self, playing: bool) -> Result<(), PlayerError> {
        self.tick();
        self.playing = playing;
        Ok(())
    }

    fn set_muted(&mut self, _muted: bool) -> Result<(), PlayerError> {
        Ok(())
    }

    fn seek_to_start(&mut self) -> Result<(), PlayerError> {
        self.tick();
        self.position = 0.0;
        self.ended = false;
        self.stalled = false;
        Ok(())
    }

    fn poll(&mut self) {
        self.tick();
    }

    fn release(&mut self) {
        self.released = true;
        self.playing = false;
    }
}

/// Drives an external `mpv` process per handle.
#[derive(Debug, Clone)]
pub struct MpvBackend {
    mpv_path: String,
    spool_dir: PathBuf,
}

impl MpvBackend {
    pub fn new(mpv_path: impl Into<String>, spool_dir: PathBuf) -> Self {
        Self {
            mpv_path: mpv_path.into(),
            spool_dir,
        }
    }
}

impl PlayerBackend for MpvBackend {
    fn name(&self) -> &'static str {
        "mpv"
    }

    #[cfg(unix)]
    fn construct(
        &self,
        source: &MediaSource<'_>,
        events: EventSink,
    ) -> Result<Box<dyn NativePlayer>, PlayerError> {
        let session = mpv::Session::spawn(&self.mpv_path, &self.spool_dir, source, events)
            .map_err(|err| PlayerError::NativeConstruction(format!("{err:#}")))?;
        Ok(Box::new(session))
    }

    #[cfg(not(unix))]
    fn construct(
        &self,
        _source: &MediaSource<'_>,
        _events: EventSink,
    ) -> Result<Box<dyn NativePlayer>, PlayerError> {
        Err(PlayerError::NativeConstruction(
            "the mpv engine needs a unix IPC socket on this platform".into(),
        ))
    }
}

/// Accumulates observed properties between IPC messages.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IpcProgress {
    progress: Progress,
}

/// Translates one mpv IPC message into a player event.
pub(crate) fn map_ipc_event(message: &serde_json::Value, state: &mut IpcProgress) -> Option<PlayerEvent> {
    let event = message.get("event")?.as_str()?;
    match event {
        "file-loaded" => Some(PlayerEvent::Ready),
        "end-file" => match message.get("reason").and_then(|r| r.as_str()) {
            Some("error") => {
                let detail = message
                    .get("file_error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("playback failed");
                Some(PlayerEvent::Error(detail.to_string()))
            }
            Some("eof") => Some(PlayerEvent::Ended),
            _ => None,
        },
        "property-change" => {
            let name = message.get("name")?.as_str()?;
            let data = message.get("data");
            match name {
                "time-pos" => {
                    state.progress.current_time = data?.as_f64()?;
                    Some(PlayerEvent::Progress(state.progress))
                }
                "demuxer-cache-time" => {
                    state.progress.playable_duration = data?.as_f64()?;
                    None
                }
                "duration" => {
                    state.progress.seekable_duration = data?.as_f64()?;
                    None
                }
                "paused-for-cache" => match data?.as_bool()? {
                    true => Some(PlayerEvent::Buffering),
                    false => Some(PlayerEvent::Ready),
                },
                "eof-reached" => data?.as_bool()?.then_some(PlayerEvent::Ended),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Properties the session subscribes to, in observe-id order.
pub(crate) const OBSERVED_PROPERTIES: [&str; 5] = [
    "time-pos",
    "demuxer-cache-time",
    "duration",
    "paused-for-cache",
    "eof-reached",
];

pub(crate) fn command_line(args: serde_json::Value) -> String {
    let mut line = serde_json::json!({ "command": args }).to_string();
    line.push('\n');
    line
}

#[cfg(unix)]
mod mpv {
    use std::fs::{self, File, OpenOptions};
    use std::io::{BufRead, BufReader, ErrorKind, Write};
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::process::{Child, Command, Stdio};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use rand::{distributions::Alphanumeric, Rng};
    use serde_json::json;
    use tracing::{debug, trace, warn};

    use super::{command_line, map_ipc_event, IpcProgress, OBSERVED_PROPERTIES};
    use crate::error::PlayerError;
    use crate::player::{EventSink, MediaSource, NativePlayer, PlayerEvent};

    const CONNECT_RETRIES: usize = 50;
    const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);
    const QUIT_GRACE: Duration = Duration::from_millis(200);

    pub(super) struct Session {
        child: Child,
        ipc: UnixStream,
        ipc_path: PathBuf,
        spool_path: PathBuf,
        spool: File,
        loaded: bool,
        released: Arc<AtomicBool>,
        reader: Option<thread::JoinHandle<()>>,
    }

    impl Session {
        pub(super) fn spawn(
            mpv_path: &str,
            spool_dir: &Path,
            source: &MediaSource<'_>,
            events: EventSink,
        ) -> Result<Self> {
            let suffix = unique_suffix();
            let ipc_path = std::env::temp_dir().join(format!("reelfeed-mpv-{suffix}.sock"));
            let spool_path = spool_dir.join(format!("reelfeed-spool-{suffix}.media"));
            remove_quietly(&ipc_path);

            fs::create_dir_all(spool_dir)
                .with_context(|| format!("mpv: create spool dir {}", spool_dir.display()))?;
            let spool = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&spool_path)
                .with_context(|| format!("mpv: create spool {}", spool_path.display()))?;

            let mut command = Command::new(mpv_path);
            command
                .arg("--idle=yes")
                .arg("--pause")
                .arg("--keep-open=yes")
                .arg("--force-window=no")
                .arg("--really-quiet")
                .arg("--terminal=no")
                .arg("--input-terminal=no")
                .arg("--no-config")
                .arg("--ytdl=no")
                .arg("--osc=no")
                .arg(format!("--input-ipc-server={}", ipc_path.display()))
                .arg(format!("--force-media-title={}", source.url))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            let mut child = command
                .spawn()
                .with_context(|| format!("mpv: launch {mpv_path} for {}", source.url))?;

            if let Some(stderr) = child.stderr.take() {
                thread::spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines().map_while(Result::ok) {
                        trace!(target: "reelfeed::engine::mpv", "mpv stderr: {line}");
                    }
                });
            }

            let ipc = match connect(&ipc_path, &mut child) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    remove_quietly(&spool_path);
                    return Err(err);
                }
            };

            let mut session = Self {
                child,
                ipc,
                ipc_path,
                spool_path,
                spool,
                loaded: false,
                released: Arc::new(AtomicBool::new(false)),
                reader: None,
            };
            for (id, name) in OBSERVED_PROPERTIES.iter().enumerate() {
                session
                    .send(json!(["observe_property", id + 1, name]))
                    .context("mpv: observe properties")?;
            }

            let stream = session.ipc.try_clone().context("mpv: clone ipc stream")?;
            let released = session.released.clone();
            session.reader = Some(thread::spawn(move || read_events(stream, events, released)));
            debug!(ipc = %session.ipc_path.display(), "mpv: session started");
            Ok(session)
        }

        fn send(&mut self, args: serde_json::Value) -> Result<(), PlayerError> {
            let line = command_line(args);
            self.ipc
                .write_all(line.as_bytes())
                .map_err(|err| PlayerError::Command(format!("mpv ipc write: {err}")))
        }
    }

    impl NativePlayer for Session {
        fn append(
            &mut self,
            _range_start: u64,
            data: &[u8],
            _end_of_media: bool,
        ) -> Result<(), PlayerError> {
            self.spool
                .write_all(data)
                .and_then(|_| self.spool.flush())
                .map_err(|err| PlayerError::Command(format!("mpv spool write: {err}")))?;
            if !self.loaded {
                self.loaded = true;
                let target = format!("appending://{}", self.spool_path.display());
                self.send(json!(["loadfile", target, "replace"]))?;
            }
            Ok(())
        }

        fn set_playing(&mut self, playing: bool) -> Result<(), PlayerError> {
            self.send(json!(["set_property", "pause", !playing]))
        }

        fn set_muted(&mut self, muted: bool) -> Result<(), PlayerError> {
            self.send(json!(["set_property", "mute", muted]))
        }

        fn seek_to_start(&mut self) -> Result<(), PlayerError> {
            self.send(json!(["seek", 0, "absolute"]))
        }

        fn release(&mut self) {
            if self.released.swap(true, Ordering::SeqCst) {
                return;
            }
            let _ = self.send(json!(["quit"]));
            thread::sleep(QUIT_GRACE);
            if matches!(self.child.try_wait(), Ok(None)) {
                let _ = self.child.kill();
            }
            let _ = self.child.wait();
            let _ = self.ipc.shutdown(std::net::Shutdown::Both);
            if let Some(reader) = self.reader.take() {
                let _ = reader.join();
            }
            remove_quietly(&self.ipc_path);
            remove_quietly(&self.spool_path);
            debug!(ipc = %self.ipc_path.display(), "mpv: session released");
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            self.release();
        }
    }

    fn read_events(stream: UnixStream, events: EventSink, released: Arc<AtomicBool>) {
        let mut progress = IpcProgress::default();
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if let Some(event) = map_ipc_event(&message, &mut progress) {
                events.emit(event);
            }
        }
        if !released.load(Ordering::SeqCst) {
            warn!(handle = events.handle().0, "mpv: process went away");
            events.emit(PlayerEvent::Error("mpv exited unexpectedly".into()));
        }
    }

    fn connect(path: &Path, child: &mut Child) -> Result<UnixStream> {
        for _ in 0..CONNECT_RETRIES {
            match UnixStream::connect(path) {
                Ok(stream) => return Ok(stream),
                Err(_) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(anyhow!("mpv exited during startup with {status}"));
                    }
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
        Err(anyhow!("mpv: connect to IPC socket {}", path.display()))
    }

    fn unique_suffix() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        format!("{}-{suffix}", std::process::id())
    }

    fn remove_quietly(path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "mpv: cleanup failed");
            }
        }
    }
}
