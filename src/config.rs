use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogRoots, SortMode};
use crate::stats::DEFAULT_STALE_AFTER_DAYS;
use crate::watcher::DEFAULT_LATENCY;

const DEFAULT_REFRESH_HOURS: u64 = 12;
const MAX_REFRESH_HOURS: u64 = 24 * 7;
const MAX_WATCH_LATENCY_MS: u64 = 60_000;
const DEFAULT_WATCH_LATENCY_MS: u64 = DEFAULT_LATENCY.as_millis() as u64;
const CONFIG_SCHEMA_VERSION: u32 = 1;
const APP_DIR_NAME: &str = "skillsync";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub schema_version: u32,
    pub sort: SortMode,
    pub watch_session_logs: bool,
    pub extra_skill_dirs: Vec<PathBuf>,
    pub stale_after_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            sort: SortMode::default(),
            watch_session_logs: false,
            extra_skill_dirs: Vec::new(),
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub refresh_interval: Duration,
    pub watch_latency: Duration,
}

impl SyncConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(cfg_path: &Path) -> Result<Self> {
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: SyncConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = SyncConfig::default();
            cfg.save_to(cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn catalog_roots(&self) -> CatalogRoots {
        CatalogRoots {
            claude_home: claude_home(),
            codex_home: codex_home(),
            extra_skill_dirs: self.extra_skill_dirs.clone(),
        }
    }

    pub fn watch_targets(&self) -> Vec<PathBuf> {
        let mut targets = self.catalog_roots().watch_targets();
        if self.watch_session_logs {
            targets.push(projects_path());
        }
        targets
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }
        if self.stale_after_days <= 0 {
            self.stale_after_days = DEFAULT_STALE_AFTER_DAYS;
            changed = true;
        }

        let before = self.extra_skill_dirs.len();
        let mut seen = Vec::with_capacity(before);
        self.extra_skill_dirs.retain(|dir| {
            let keep = !dir.as_os_str().is_empty() && !seen.contains(dir);
            if keep {
                seen.push(dir.clone());
            }
            keep
        });
        if self.extra_skill_dirs.len() != before {
            changed = true;
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        refresh_interval: refresh_interval(env_u64("SKILLSYNC_REFRESH_HOURS", DEFAULT_REFRESH_HOURS)),
        watch_latency: watch_latency(env_u64(
            "SKILLSYNC_WATCH_LATENCY_MS",
            DEFAULT_WATCH_LATENCY_MS,
        )),
    }
}

fn refresh_interval(hours: u64) -> Duration {
    Duration::from_secs(hours.min(MAX_REFRESH_HOURS).saturating_mul(3600))
}

fn watch_latency(millis: u64) -> Duration {
    Duration::from_millis(millis.min(MAX_WATCH_LATENCY_MS))
}

pub fn claude_home() -> PathBuf {
    home_override("CLAUDE_HOME").unwrap_or_else(|| home_dir().join(".claude"))
}

pub fn codex_home() -> PathBuf {
    home_override("CODEX_HOME").unwrap_or_else(|| home_dir().join(".codex"))
}

pub fn app_home() -> PathBuf {
    home_override("SKILLSYNC_HOME").unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| home_dir().join(".local").join("share"))
            .join(APP_DIR_NAME)
    })
}

pub fn projects_path() -> PathBuf {
    claude_home().join("projects")
}

pub fn config_path() -> PathBuf {
    app_home().join("config.json")
}

pub fn usage_cache_path() -> PathBuf {
    app_home().join("usage-cache.json")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn home_override(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
