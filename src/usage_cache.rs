use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fingerprint::FileFingerprint;
use crate::log_parser::{InvocationRecord, parse_log_file};
use crate::util::{iso8601, parse_timestamp_or_far_past};

pub const LOG_FILE_EXTENSION: &str = "jsonl";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode usage cache: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFileRecord {
    pub path: String,
    #[serde(with = "iso8601")]
    pub last_modified: DateTime<Utc>,
    pub file_size: u64,
    #[serde(default)]
    pub invocations: Vec<InvocationRecord>,
}

impl ParsedFileRecord {
    pub fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint::new(self.last_modified, self.file_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCache {
    pub parsed_files: BTreeMap<String, ParsedFileRecord>,
    #[serde(with = "iso8601::option")]
    pub last_full_scan_date: Option<DateTime<Utc>>,
}

impl UsageCache {
    pub fn invocations(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.parsed_files
            .values()
            .flat_map(|record| record.invocations.iter())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub discovered: usize,
    pub reparsed: usize,
    pub reused: usize,
    pub pruned: usize,
    pub unreadable: usize,
}

#[derive(Debug)]
pub struct IncrementalLogCache {
    cache: UsageCache,
    store_path: Option<PathBuf>,
    parse_calls: u64,
}

impl IncrementalLogCache {
    pub fn in_memory() -> Self {
        Self {
            cache: UsageCache::default(),
            store_path: None,
            parse_calls: 0,
        }
    }

    // A missing or unreadable file yields an empty cache.
    pub fn load(store_path: PathBuf) -> Self {
        let cache = load_cache(&store_path);
        debug!(
            path = %store_path.display(),
            files = cache.parsed_files.len(),
            "loaded usage cache"
        );
        Self {
            cache,
            store_path: Some(store_path),
            parse_calls: 0,
        }
    }

    pub fn cache(&self) -> &UsageCache {
        &self.cache
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    pub fn parse_calls(&self) -> u64 {
        self.parse_calls
    }

    pub fn refresh(&mut self, log_root: &Path) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for path in discover_log_files(log_root) {
            let key = path.to_string_lossy().into_owned();
            seen.insert(key.clone());
            report.discovered += 1;

            let fingerprint = match FileFingerprint::probe(&path) {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "log file vanished during scan");
                    self.cache.parsed_files.remove(&key);
                    report.unreadable += 1;
                    continue;
                }
            };

            if self
                .cache
                .parsed_files
                .get(&key)
                .is_some_and(|record| record.fingerprint() == fingerprint)
            {
                report.reused += 1;
                continue;
            }

            self.parse_calls += 1;
            match parse_log_file(&path) {
                Ok(invocations) => {
                    self.cache.parsed_files.insert(
                        key.clone(),
                        ParsedFileRecord {
                            path: key,
                            last_modified: fingerprint.modified,
                            file_size: fingerprint.size,
                            invocations,
                        },
                    );
                    report.reparsed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read session log");
                    self.cache.parsed_files.remove(&key);
                    report.unreadable += 1;
                }
            }
        }

        let before = self.cache.parsed_files.len();
        self.cache.parsed_files.retain(|path, _| seen.contains(path));
        report.pruned = before - self.cache.parsed_files.len();
        self.cache.last_full_scan_date = Some(Utc::now());

        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist usage cache");
        }
        info!(
            discovered = report.discovered,
            reparsed = report.reparsed,
            reused = report.reused,
            pruned = report.pruned,
            "usage logs refreshed"
        );
        report
    }

    pub fn persist(&self) -> Result<(), PersistError> {
        match self.store_path.as_deref() {
            Some(path) => save_cache(&self.cache, path),
            None => Ok(()),
        }
    }
}

pub fn discover_log_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some(LOG_FILE_EXTENSION)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CacheDocument {
    parsed_files: BTreeMap<String, Value>,
    last_full_scan_date: Option<String>,
}

pub fn load_cache(path: &Path) -> UsageCache {
    match fs::read(path) {
        Ok(raw) => decode_cache(&raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => UsageCache::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read usage cache; starting empty");
            UsageCache::default()
        }
    }
}

/// A document that is not the expected shape yields an empty cache. A single
/// entry that fails to decode is dropped and will be reparsed.
pub fn decode_cache(raw: &[u8]) -> UsageCache {
    let document: CacheDocument = match serde_json::from_slice(raw) {
        Ok(document) => document,
        Err(err) => {
            warn!(error = %err, "usage cache is corrupt; starting empty");
            return UsageCache::default();
        }
    };

    let mut parsed_files = BTreeMap::new();
    let mut dropped = 0usize;
    for (key, value) in document.parsed_files {
        match serde_json::from_value::<ParsedFileRecord>(value) {
            Ok(record) => {
                parsed_files.insert(key, record);
            }
            Err(_) => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(dropped, "dropped undecodable usage cache entries");
    }

    UsageCache {
        parsed_files,
        last_full_scan_date: document
            .last_full_scan_date
            .as_deref()
            .map(parse_timestamp_or_far_past),
    }
}

// Temp file plus rename, under an exclusive lock on `<path>.lock`.
pub fn save_cache(cache: &UsageCache, path: &Path) -> Result<(), PersistError> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let io_err = |target: &Path| {
        let target = target.to_path_buf();
        move |source: io::Error| PersistError::Io {
            path: target,
            source,
        }
    };

    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let lock_path = lock_path_for(path);
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(io_err(&lock_path))?;
    lock.lock_exclusive().map_err(io_err(&lock_path))?;

    let payload = serde_json::to_vec(cache)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(&payload).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|err| PersistError::Io {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::is_far_past;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn invocation_line(skill: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "timestamp": ts,
            "sessionId": "s",
            "message": { "content": [
                { "type": "tool_use", "name": "Skill", "input": { "skill": skill } }
            ]}
        })
        .to_string()
    }

    fn write_log(root: &Path, project: &str, name: &str, skills: &[&str]) -> PathBuf {
        let dir = root.join(project);
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join(name);
        let body: Vec<String> = skills
            .iter()
            .map(|skill| invocation_line(skill, "2025-01-05T10:00:00.500Z"))
            .collect();
        fs::write(&path, body.join("\n") + "\n").expect("write");
        path
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .and_then(|file| file.set_modified(when))
            .expect("set mtime");
    }

    #[test]
    fn unchanged_files_are_not_reparsed() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        write_log(&root, "a", "one.jsonl", &["pdf", "xlsx"]);
        write_log(&root, "b", "two.jsonl", &["pdf"]);

        let mut cache = IncrementalLogCache::in_memory();
        let first = cache.refresh(&root);
        assert_eq!(first.reparsed, 2);
        let snapshot = cache.cache().parsed_files.clone();

        let second = cache.refresh(&root);
        assert_eq!(second.reparsed, 0);
        assert_eq!(second.reused, 2);
        assert_eq!(cache.parse_calls(), 2);
        assert_eq!(cache.cache().parsed_files, snapshot);
    }

    #[test]
    fn size_change_forces_reparse() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        let path = write_log(&root, "a", "one.jsonl", &["pdf"]);
        let mut cache = IncrementalLogCache::in_memory();
        cache.refresh(&root);

        let mut file = File::options().append(true).open(&path).expect("open");
        writeln!(file, "{}", invocation_line("docx", "2025-01-06T10:00:00Z")).expect("append");
        drop(file);

        let report = cache.refresh(&root);
        assert_eq!(report.reparsed, 1);
        assert_eq!(cache.cache().invocations().count(), 2);
    }

    #[test]
    fn mtime_only_change_forces_reparse() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        let path = write_log(&root, "a", "one.jsonl", &["pdf"]);
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut cache = IncrementalLogCache::in_memory();
        cache.refresh(&root);

        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_060));
        let report = cache.refresh(&root);
        assert_eq!(report.reparsed, 1);
        assert_eq!(report.reused, 0);
    }

    #[test]
    fn deleted_files_are_pruned() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        let gone = write_log(&root, "a", "one.jsonl", &["pdf"]);
        write_log(&root, "a", "two.jsonl", &["xlsx"]);
        let mut cache = IncrementalLogCache::in_memory();
        cache.refresh(&root);

        fs::remove_file(&gone).expect("remove");
        let report = cache.refresh(&root);
        assert_eq!(report.pruned, 1);
        assert!(!cache.cache().parsed_files.contains_key(&*gone.to_string_lossy()));
        let names: Vec<_> = cache.cache().invocations().map(|r| r.skill_name.clone()).collect();
        assert_eq!(names, vec!["xlsx".to_string()]);
    }

    #[test]
    fn missing_root_empties_the_cache() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        write_log(&root, "a", "one.jsonl", &["pdf"]);
        let mut cache = IncrementalLogCache::in_memory();
        cache.refresh(&root);

        fs::remove_dir_all(&root).expect("rm");
        let report = cache.refresh(&root);
        assert_eq!(report.discovered, 0);
        assert_eq!(report.pruned, 1);
        assert!(cache.cache().parsed_files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_log_contributes_nothing_and_is_retried() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        write_log(&root, "a", "one.jsonl", &["pdf"]);
        let locked = write_log(&root, "a", "two.jsonl", &["xlsx"]);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read(&locked).is_ok() {
            // Permission bits do not apply to this user (e.g. root).
            return;
        }

        let mut cache = IncrementalLogCache::in_memory();
        let report = cache.refresh(&root);
        assert_eq!(report.discovered, 2);
        assert_eq!(report.reparsed, 1);
        assert_eq!(report.unreadable, 1);
        assert!(!cache.cache().parsed_files.contains_key(&*locked.to_string_lossy()));
        let names: Vec<_> = cache.cache().invocations().map(|r| r.skill_name.clone()).collect();
        assert_eq!(names, vec!["pdf".to_string()]);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).expect("chmod");
        let report = cache.refresh(&root);
        assert_eq!(report.unreadable, 0);
        assert_eq!(report.reparsed, 1);
        assert_eq!(report.reused, 1);
        assert_eq!(cache.cache().invocations().count(), 2);
    }

    #[test]
    fn failed_persist_keeps_in_memory_cache() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        write_log(&root, "a", "one.jsonl", &["pdf", "docx"]);
        let blocker = tmp.path().join("state");
        fs::write(&blocker, "not a directory").expect("write");
        let store = blocker.join("usage-cache.json");

        let mut cache = IncrementalLogCache::load(store.clone());
        assert!(cache.cache().parsed_files.is_empty());
        let report = cache.refresh(&root);
        assert_eq!(report.reparsed, 1);
        assert_eq!(cache.cache().invocations().count(), 2);
        assert!(cache.persist().is_err());
        assert!(!store.exists());

        let report = cache.refresh(&root);
        assert_eq!(report.reparsed, 0);
        assert_eq!(report.reused, 1);
        assert_eq!(cache.cache().invocations().count(), 2);
    }

    #[test]
    fn non_log_files_are_ignored() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        write_log(&root, "a", "one.jsonl", &["pdf"]);
        fs::write(root.join("a").join("notes.txt"), invocation_line("x", "")).expect("write");
        assert_eq!(discover_log_files(&root).len(), 1);
    }

    #[test]
    fn persisted_cache_survives_restart_without_reparse() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        let store = tmp.path().join("state").join("usage-cache.json");
        write_log(&root, "a", "one.jsonl", &["pdf"]);

        let mut first = IncrementalLogCache::load(store.clone());
        first.refresh(&root);
        assert!(store.exists());

        let mut second = IncrementalLogCache::load(store.clone());
        assert_eq!(second.cache().parsed_files.len(), 1);
        let report = second.refresh(&root);
        assert_eq!(report.reparsed, 0);
        assert_eq!(second.parse_calls(), 0);
    }

    #[test]
    fn persisted_document_uses_camel_case_keys() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("projects");
        let store = tmp.path().join("usage-cache.json");
        write_log(&root, "a", "one.jsonl", &["pdf"]);
        IncrementalLogCache::load(store.clone()).refresh(&root);

        let raw: Value = serde_json::from_slice(&fs::read(&store).expect("read")).expect("json");
        assert!(raw.get("lastFullScanDate").and_then(Value::as_str).is_some());
        let (_, entry) = raw["parsedFiles"]
            .as_object()
            .and_then(|files| files.iter().next())
            .expect("one entry");
        assert!(entry.get("lastModified").is_some());
        assert!(entry.get("fileSize").is_some());
        assert_eq!(entry["invocations"][0]["skillName"], "pdf");
        assert_eq!(entry["invocations"][0]["sessionId"], "s");
        assert_eq!(entry["invocations"][0]["projectPath"], "a");
    }

    #[test]
    fn persist_leaves_no_temporary_files() {
        let tmp = TempDir::new().expect("tempdir");
        let store = tmp.path().join("usage-cache.json");
        save_cache(&UsageCache::default(), &store).expect("save");
        save_cache(&UsageCache::default(), &store).expect("save again");
        let mut names: Vec<String> = fs::read_dir(tmp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["usage-cache.json", "usage-cache.json.lock"]);
    }

    #[test]
    fn corrupt_cache_loads_empty() {
        let tmp = TempDir::new().expect("tempdir");
        let store = tmp.path().join("usage-cache.json");
        fs::write(&store, b"{ this is not json").expect("write");
        let cache = IncrementalLogCache::load(store);
        assert!(cache.cache().parsed_files.is_empty());
        assert!(cache.cache().last_full_scan_date.is_none());
    }

    #[test]
    fn bad_entries_are_dropped_and_timestamps_decode_leniently() {
        let raw = serde_json::json!({
            "parsedFiles": {
                "/logs/good.jsonl": {
                    "path": "/logs/good.jsonl",
                    "lastModified": "2025-01-05T10:00:00Z",
                    "fileSize": 10,
                    "invocations": [
                        { "skillName": "pdf", "timestamp": "2025-01-05T10:00:00.123Z", "sessionId": "s" },
                        { "skillName": "xlsx", "timestamp": "garbage" }
                    ]
                },
                "/logs/bad.jsonl": { "path": 42 }
            },
            "lastFullScanDate": "2025-01-05T11:00:00Z"
        });
        let cache = decode_cache(raw.to_string().as_bytes());
        assert_eq!(cache.parsed_files.len(), 1);
        let record = &cache.parsed_files["/logs/good.jsonl"];
        assert_eq!(record.file_size, 10);
        assert_eq!(record.invocations.len(), 2);
        assert!(is_far_past(record.invocations[1].timestamp));
        assert_eq!(record.invocations[1].session_id, "");
        assert!(cache.last_full_scan_date.is_some());
    }
}
