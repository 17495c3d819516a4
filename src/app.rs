use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tracing::info;

use crate::cache::{self, CacheKey, CacheStats, CacheStore, Source};
use crate::config::{self, Config};
use crate::engine;
use crate::feed::{Feed, MediaRef};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::pool::{PlayerPool, PoolConfig};
use crate::reel::{Input, InputSender, ReelController, ReelEvent, ReelOptions};
use crate::storage;
use crate::viewport::VisibleItem;

const TICK: Duration = Duration::from_millis(50);

/// Long-lived collaborators shared by every command.
pub struct Services {
    pub cfg: Config,
    pub cache: Arc<CacheStore>,
    pub fetcher: Arc<dyn Fetcher>,
}

pub fn open_services() -> Result<Services> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let index_path = index_path(&cfg);
    let store = storage::Store::open(storage::Options {
        path: index_path,
    })
    .context("open cache index")?;
    let cache = CacheStore::open(store, cache::Config::from(&cfg.cache)).context("open cache")?;
    let fetcher: Arc<dyn Fetcher> =
        Arc::new(HttpFetcher::new(cfg.cache.fetch_timeout).context("build fetcher")?);
    Ok(Services {
        cfg,
        cache: Arc::new(cache),
        fetcher,
    })
}

// The index lives next to the blobs it describes.
fn index_path(cfg: &Config) -> Option<PathBuf> {
    cfg.cache.dir.as_ref().map(|dir| dir.join("index.db"))
}

pub fn stats(services: &Services) -> CacheStats {
    services.cache.stats()
}

/// Pulls the first segment of `url` through the cache.
pub fn warm(services: &Services, url: &str) -> Result<(Source, usize)> {
    let media = MediaRef::new("warm", url);
    media
        .validate()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("warm {url}"))?;
    let key = CacheKey::new(media.url.clone(), 0, services.cfg.cache.segment_bytes);
    let fetched = services
        .cache
        .request(key, services.fetcher.clone())
        .wait()
        .with_context(|| format!("warm {url}"))?;
    Ok((fetched.source, fetched.data.len()))
}

pub fn invalidate(services: &Services, url: &str) -> usize {
    services.cache.invalidate(url.trim())
}

/// Interactive session over a fixed list of URLs, driven by stdin lines.
pub fn play(services: Services, urls: Vec<String>) -> Result<()> {
    let items: Vec<MediaRef> = urls
        .iter()
        .enumerate()
        .map(|(i, url)| MediaRef::new(format!("item-{i}"), url.as_str()))
        .collect();
    if items.is_empty() {
        anyhow::bail!("play: at least one url required");
    }
    let len = items.len();

    let backend = engine::backend_for(&services.cfg.player);
    let pool = PlayerPool::new(
        backend,
        services.cache.clone(),
        services.fetcher.clone(),
        PoolConfig {
            window: services.cfg.feed.window,
            segment_bytes: services.cfg.cache.segment_bytes,
            start_muted: services.cfg.player.start_muted,
        },
    );
    let (controller, events) =
        ReelController::new(Feed::new(items), pool, ReelOptions::from(&services.cfg.feed));
    let muted = controller.muted();

    let inputs = controller.inputs();
    let current = Arc::new(AtomicUsize::new(0));

    let reel = thread::spawn(move || controller.run(TICK));
    let printer = {
        let inputs = inputs.clone();
        let current = current.clone();
        thread::spawn(move || render_events(events, inputs, current))
    };

    println!("j/k: next/previous  m: mute  a: auto-continue  r: retry  q: quit");
    let mut muted = muted;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("play: read stdin")?;
        let at = current.load(Ordering::SeqCst);
        let input = match line.trim() {
            "j" => Input::Visibility(vec![VisibleItem::new((at + 1).min(len - 1), 1.0)]),
            "k" => Input::Visibility(vec![VisibleItem::new(at.saturating_sub(1), 1.0)]),
            "m" => {
                muted = !muted;
                Input::SetMuted(muted)
            }
            "a" => Input::ToggleAutoContinue,
            "r" => Input::Retry(at),
            "q" => break,
            "" => continue,
            other => {
                println!("unknown command: {other}");
                continue;
            }
        };
        if !inputs.send(input) {
            break;
        }
    }

    inputs.send(Input::Shutdown);
    drop(inputs);
    let _ = reel.join();
    let _ = printer.join();
    info!("play: session closed");
    Ok(())
}

/// Stands in for the list widget: prints events and performs requested
/// scrolls by reporting the target as fully visible.
fn render_events(events: Receiver<ReelEvent>, inputs: InputSender, current: Arc<AtomicUsize>) {
    for event in events {
        match event {
            ReelEvent::IndexChanged(change) => {
                current.store(change.new, Ordering::SeqCst);
                println!("now at item {} (was {})", change.new, change.old);
            }
            ReelEvent::ScrollRequested(index) => {
                println!("auto-continue: scrolling to {index}");
                inputs.send(Input::Visibility(vec![VisibleItem::new(index, 1.0)]));
            }
            ReelEvent::Player { index, event } => match event {
                crate::player::PlayerEvent::Progress(_) => {}
                other => println!("[{index}] {other:?}"),
            },
            ReelEvent::EndReached { len } => println!("end of feed in sight ({len} items)"),
            ReelEvent::PosterVisible { .. } => {}
            ReelEvent::AutoContinue(enabled) => println!("auto-continue {}", on_off(enabled)),
            ReelEvent::Muted(muted) => println!("mute {}", on_off(muted)),
        }
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_sits_beside_configured_blobs() {
        let mut cfg = Config::default();
        cfg.cache.dir = None;
        assert_eq!(index_path(&cfg), None);
        cfg.cache.dir = Some(PathBuf::from("/tmp/reel-cache"));
        assert_eq!(
            index_path(&cfg),
            Some(PathBuf::from("/tmp/reel-cache/index.db"))
        );
    }
}
