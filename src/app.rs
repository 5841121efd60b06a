use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::catalog::{SortMode, group_catalog};
use crate::config::{self, RuntimeSettings, SyncConfig};
use crate::refresher::{
    DiskScanSource, PublishedView, RefreshHandle, Refresher, ScanSnapshot, ScanSource,
    TriggerReason,
};
use crate::relevance::WatchTargets;
use crate::stats::{most_used, ranked, stale, stat_for, total_invocations};
use crate::usage_cache::{IncrementalLogCache, decode_cache};
use crate::util::{format_age, human_duration, truncate};
use crate::watcher::WatchSession;

pub fn watch(config: &SyncConfig, runtime: RuntimeSettings) -> Result<()> {
    let source = Arc::new(disk_source(config));
    let mut refresher = Refresher::new(source, config.sort);
    let handle = refresher.handle();
    install_stop_signal(handle.clone())?;

    let session = WatchSession::start(config.watch_targets(), runtime.watch_latency, handle);
    refresher.attach_watch(session);
    info!(
        refresh_every = %human_duration(runtime.refresh_interval),
        latency_ms = runtime.watch_latency.as_millis() as u64,
        "skillsync started; press Ctrl+C to stop"
    );

    refresher.trigger(TriggerReason::Startup);
    refresher.run(runtime.refresh_interval, log_view_summary);
    Ok(())
}

pub fn print_status(config: &SyncConfig) -> Result<()> {
    let snapshot = scan_once(config);
    let groups = group_catalog(&snapshot.catalog, &snapshot.usage, config.sort);

    println!("skillsync status");
    println!("config: {}", config::config_path().display());
    println!("usage_cache: {}", config::usage_cache_path().display());
    println!("claude_home: {}", config::claude_home().display());
    println!("codex_home: {}", config::codex_home().display());
    println!("catalog_entries: {}", snapshot.catalog.len());
    for group in &groups {
        println!("  {}: {}", group.id, group.len());
    }
    let report = snapshot.report;
    println!(
        "session_logs: {} (reparsed {}, reused {}, pruned {}, unreadable {})",
        report.discovered, report.reparsed, report.reused, report.pruned, report.unreadable
    );
    println!(
        "invocations: {} across {} skill(s)",
        total_invocations(&snapshot.usage),
        snapshot.usage.len()
    );
    if let Some(top) = most_used(&snapshot.usage) {
        println!("most_used: {} ({})", top.skill_name, top.total_count);
    }
    println!(
        "stale_skills: {} (unused for {}+ days)",
        stale(&snapshot.usage, Utc::now(), config.stale_after_days).len(),
        config.stale_after_days
    );
    println!("scanned_at: {}", snapshot.scanned_at.to_rfc3339());
    Ok(())
}

#[derive(Debug, Serialize)]
struct UsageRow<'a> {
    skill: &'a str,
    total_count: usize,
    first_used: DateTime<Utc>,
    last_used: DateTime<Utc>,
    frequency: String,
    stale: bool,
}

pub fn print_usage(config: &SyncConfig, limit: usize, json: bool) -> Result<()> {
    let snapshot = scan_once(config);
    let now = Utc::now();
    let rows: Vec<UsageRow<'_>> = ranked(&snapshot.usage)
        .into_iter()
        .take(limit)
        .map(|stat| UsageRow {
            skill: &stat.skill_name,
            total_count: stat.total_count,
            first_used: stat.first_used,
            last_used: stat.last_used,
            frequency: stat.frequency_description(),
            stale: stat.is_stale(now, config.stale_after_days),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No skill usage recorded yet.");
        return Ok(());
    }
    println!("{:<32} {:>6}  {:<12} {}", "SKILL", "USES", "FREQUENCY", "LAST USED");
    for row in &rows {
        println!(
            "{:<32} {:>6}  {:<12} {}{}",
            truncate(row.skill, 32),
            row.total_count,
            row.frequency,
            format_age(Some(row.last_used), now),
            if row.stale { "  (stale)" } else { "" }
        );
    }
    Ok(())
}

pub fn print_catalog(config: &SyncConfig, sort: SortMode) -> Result<()> {
    let snapshot = scan_once(config);
    let groups = group_catalog(&snapshot.catalog, &snapshot.usage, sort);

    println!("skillsync catalog (sorted {})", sort.label());
    for group in groups.iter().filter(|group| !group.is_empty()) {
        println!();
        println!("{} ({})", group.title, group.len());
        for section in &group.sections {
            println!("  {}", section.title);
            for entry in &section.entries {
                let trigger = entry.trigger_command();
                let uses = stat_for(&snapshot.usage, &trigger)
                    .map(|stat| stat.total_count)
                    .unwrap_or(0);
                println!(
                    "    {:<28} {:>4}  {}",
                    truncate(&trigger, 28),
                    uses,
                    truncate(&entry.description, 72)
                );
            }
        }
    }
    if snapshot.catalog.is_empty() {
        println!("No skills or agents found.");
    }
    Ok(())
}

pub fn doctor(config: &SyncConfig) -> Result<u8> {
    let mut issues = 0u8;
    let targets = WatchTargets::resolve(&config.watch_targets());

    println!("skillsync doctor");
    println!("config_path: {}", config::config_path().display());
    print_paths("watch_targets", targets.requested());

    if targets.roots().is_empty() {
        issues += 1;
        println!("[WARN] None of the skill directories exist yet.");
    } else {
        println!("[OK] Watching {} existing directory(ies).", targets.roots().len());
    }
    for marker in targets.markers() {
        println!(
            "[INFO] {} does not exist; it will be picked up when created.",
            marker.display()
        );
    }

    let projects = config::projects_path();
    if projects.is_dir() {
        println!("[OK] Session logs found at {}.", projects.display());
    } else {
        issues += 1;
        println!("[WARN] Session log directory {} not found.", projects.display());
    }

    let cache_path = config::usage_cache_path();
    match fs::read(&cache_path) {
        Ok(raw) if serde_json::from_slice::<serde_json::Value>(&raw).is_ok() => {
            let cache = decode_cache(&raw);
            println!(
                "[OK] Usage cache holds {} parsed log(s).",
                cache.parsed_files.len()
            );
        }
        Ok(_) => {
            issues += 1;
            println!(
                "[WARN] Usage cache {} is corrupt; it will be rebuilt on the next refresh.",
                cache_path.display()
            );
        }
        Err(_) => println!("[INFO] No usage cache yet; the first refresh creates it."),
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn disk_source(config: &SyncConfig) -> DiskScanSource {
    DiskScanSource::new(
        config.catalog_roots(),
        config::projects_path(),
        IncrementalLogCache::load(config::usage_cache_path()),
    )
}

fn scan_once(config: &SyncConfig) -> ScanSnapshot {
    disk_source(config).scan(0)
}

fn log_view_summary(view: &PublishedView) {
    let snapshot = &view.snapshot;
    let groups: Vec<String> = view
        .groups
        .iter()
        .map(|group| format!("{} {}", group.id, group.len()))
        .collect();
    info!(
        generation = view.generation,
        reason = ?view.reason,
        sort = view.sort.label(),
        entries = snapshot.catalog.len(),
        groups = %groups.join(", "),
        invocations = total_invocations(&snapshot.usage),
        reparsed = snapshot.report.reparsed,
        "catalog updated"
    );
}

fn print_paths(label: &str, paths: &[PathBuf]) {
    println!("{label}:");
    for path in paths {
        println!("  - {}", path.display());
    }
}

fn install_stop_signal(handle: RefreshHandle) -> Result<()> {
    ctrlc::set_handler(move || {
        handle.shutdown();
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(())
}
