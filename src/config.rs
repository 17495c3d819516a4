use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "REELFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_transient")]
    pub retry_transient: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            capacity_bytes: default_capacity_bytes(),
            segment_bytes: default_segment_bytes(),
            fetch_timeout: default_fetch_timeout(),
            workers: default_workers(),
            retry_transient: default_retry_transient(),
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("reelfeed").join("media_cache"))
}

fn default_capacity_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_segment_bytes() -> u64 {
    1024 * 1024
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_workers() -> usize {
    2
}

fn default_retry_transient() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f32,
    #[serde(default = "default_end_reached_threshold")]
    pub end_reached_threshold: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            visibility_threshold: default_visibility_threshold(),
            end_reached_threshold: default_end_reached_threshold(),
        }
    }
}

fn default_window() -> usize {
    3
}

fn default_visibility_threshold() -> f32 {
    0.5
}

fn default_end_reached_threshold() -> usize {
    2
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Mpv,
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
    #[serde(default)]
    pub start_muted: bool,
    #[serde(default = "default_headless_byte_rate")]
    pub headless_byte_rate: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            mpv_path: default_mpv_path(),
            start_muted: false,
            headless_byte_rate: default_headless_byte_rate(),
        }
    }
}

fn default_mpv_path() -> String {
    "mpv".into()
}

// ~2 Mbit/s, a typical short-form rendition.
fn default_headless_byte_rate() -> u64 {
    256 * 1024
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = apply_env(cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if other.cache.dir.is_some() {
        base.cache.dir = other.cache.dir;
    }
    if other.cache.capacity_bytes != 0 {
        base.cache.capacity_bytes = other.cache.capacity_bytes;
    }
    if other.cache.segment_bytes != 0 {
        base.cache.segment_bytes = other.cache.segment_bytes;
    }
    if !other.cache.fetch_timeout.is_zero() {
        base.cache.fetch_timeout = other.cache.fetch_timeout;
    }
    if other.cache.workers != 0 {
        base.cache.workers = other.cache.workers;
    }
    base.cache.retry_transient = other.cache.retry_transient;

    if other.feed.window != 0 {
        base.feed.window = other.feed.window;
    }
    if other.feed.visibility_threshold > 0.0 && other.feed.visibility_threshold <= 1.0 {
        base.feed.visibility_threshold = other.feed.visibility_threshold;
    }
    base.feed.end_reached_threshold = other.feed.end_reached_threshold;

    base.player.engine = other.player.engine;
    if !other.player.mpv_path.is_empty() {
        base.player.mpv_path = other.player.mpv_path;
    }
    base.player.start_muted = other.player.start_muted;
    if other.player.headless_byte_rate != 0 {
        base.player.headless_byte_rate = other.player.headless_byte_rate;
    }

    base
}

// Overrides are applied in place so that unset variables keep file values.
fn apply_env(mut cfg: Config, prefix: &str) -> Config {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }

    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "cache.dir" => cfg.cache.dir = Some(PathBuf::from(value)),
        "cache.capacity_bytes" => {
            if let Ok(parsed) = value.parse::<u64>() {
                if parsed != 0 {
                    cfg.cache.capacity_bytes = parsed;
                }
            }
        }
        "cache.segment_bytes" => {
            if let Ok(parsed) = value.parse::<u64>() {
                if parsed != 0 {
                    cfg.cache.segment_bytes = parsed;
                }
            }
        }
        "cache.fetch_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.fetch_timeout = duration;
            }
        }
        "cache.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.cache.workers = parsed;
            }
        }
        "cache.retry_transient" => cfg.cache.retry_transient = parse_bool(&value),
        "feed.window" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed != 0 {
                    cfg.feed.window = parsed;
                }
            }
        }
        "feed.visibility_threshold" => {
            if let Ok(parsed) = value.parse::<f32>() {
                if parsed > 0.0 && parsed <= 1.0 {
                    cfg.feed.visibility_threshold = parsed;
                }
            }
        }
        "feed.end_reached_threshold" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.end_reached_threshold = parsed;
            }
        }
        "player.engine" => match value.trim().to_ascii_lowercase().as_str() {
            "mpv" => cfg.player.engine = EngineKind::Mpv,
            "headless" => cfg.player.engine = EngineKind::Headless,
            _ => {}
        },
        "player.mpv_path" => cfg.player.mpv_path = value,
        "player.start_muted" => cfg.player.start_muted = parse_bool(&value),
        "player.headless_byte_rate" => {
            if let Ok(parsed) = value.parse::<u64>() {
                if parsed != 0 {
                    cfg.player.headless_byte_rate = parsed;
                }
            }
        }
        _ => {}
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reelfeed").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_reel_budget() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.capacity_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.cache.fetch_timeout, Duration::from_secs(15));
        assert_eq!(cfg.feed.window, 3);
        assert_eq!(cfg.feed.visibility_threshold, 0.5);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "cache:\n  capacity_bytes: 2048\n  fetch_timeout: 3s\nfeed:\n  window: 5\nplayer:\n  engine: headless\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("REELFEED_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.cache.capacity_bytes, 2048);
        assert_eq!(cfg.cache.fetch_timeout, Duration::from_secs(3));
        assert_eq!(cfg.cache.segment_bytes, default_segment_bytes());
        assert_eq!(cfg.feed.window, 5);
        assert_eq!(cfg.player.engine, EngineKind::Headless);
    }

    #[test]
    fn env_overrides() {
        env::set_var("REELFEED_TEST_ENV_FEED__WINDOW", "7");
        env::set_var("REELFEED_TEST_ENV_CACHE__FETCH_TIMEOUT", "250ms");
        env::set_var("REELFEED_TEST_ENV_FEED__VISIBILITY_THRESHOLD", "1.5");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/reelfeed.yaml")),
            env_prefix: Some("REELFEED_TEST_ENV".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.window, 7);
        assert_eq!(cfg.cache.fetch_timeout, Duration::from_millis(250));
        assert_eq!(cfg.feed.visibility_threshold, 0.5);
        env::remove_var("REELFEED_TEST_ENV_FEED__WINDOW");
        env::remove_var("REELFEED_TEST_ENV_CACHE__FETCH_TIMEOUT");
        env::remove_var("REELFEED_TEST_ENV_FEED__VISIBILITY_THRESHOLD");
    }
}
