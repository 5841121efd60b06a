pub mod app;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod fingerprint;
pub mod log_parser;
pub mod refresher;
pub mod relevance;
pub mod stats;
pub mod usage_cache;
pub mod util;
pub mod watcher;
