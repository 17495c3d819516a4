#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod autocontinue;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod logging;
pub mod player;
pub mod pool;
pub mod reel;
pub mod storage;
pub mod viewport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use reel::ReelController;
