use std::cmp::{Ordering, Reverse};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::stats::{UsageStats, stat_for};

pub const SKILL_FILE_NAME: &str = "SKILL.md";
const AGENTS_DIR_NAME: &str = "agents";
const CODEX_SYSTEM_DIR: &str = ".system";
const CODEX_AGENT_MANIFEST: &str = "openai.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SortMode {
    #[default]
    Name,
    Recent,
    MostUsed,
}

impl SortMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Name => "A-Z",
            Self::Recent => "Recently Modified",
            Self::MostUsed => "Most Used",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Skill,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    ClaudeUser,
    ClaudePlugin,
    CodexBuiltin,
    CodexUser,
    Extra,
    UserAgent,
    PluginAgent,
}

impl EntrySource {
    pub fn kind(self) -> EntryKind {
        match self {
            Self::UserAgent | Self::PluginAgent => EntryKind::Agent,
            _ => EntryKind::Skill,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::ClaudeUser => "User Skills",
            Self::ClaudePlugin => "Plugin Skills",
            Self::CodexBuiltin => "Built-in Skills",
            Self::CodexUser => "User Skills",
            Self::Extra => "Extra Skills",
            Self::UserAgent => "User Agents",
            Self::PluginAgent => "Plugin Agents",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub source: EntrySource,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    pub fn kind(&self) -> EntryKind {
        self.source.kind()
    }

    pub fn trigger_command(&self) -> String {
        match self.source {
            EntrySource::ClaudeUser => format!("/{}", folder_name(&self.path)),
            EntrySource::ClaudePlugin => {
                plugin_trigger(&self.path).unwrap_or_else(|| folder_name(&self.path))
            }
            EntrySource::CodexBuiltin | EntrySource::CodexUser | EntrySource::Extra => {
                folder_name(&self.path)
            }
            EntrySource::UserAgent | EntrySource::PluginAgent => self
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.clone()),
        }
    }
}

fn folder_name(skill_file: &Path) -> String {
    skill_file
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `<plugin>:<skill>` for `.../<plugin>/<version>/skills/<skill>/SKILL.md`.
fn plugin_trigger(skill_file: &Path) -> Option<String> {
    let components: Vec<String> = skill_file
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    let skills_idx = components.iter().rposition(|component| component == "skills")?;
    if skills_idx < 2 || skills_idx + 1 >= components.len() {
        return None;
    }
    Some(format!(
        "{}:{}",
        components[skills_idx - 2],
        components[skills_idx + 1]
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preamble {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
}

pub fn parse_preamble(content: &str) -> Option<Preamble> {
    let mut lines = content.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    let mut preamble = Preamble::default();
    for line in lines {
        if line.trim() == "---" {
            return Some(preamble);
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = unquote(value.trim());
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "name" => preamble.name = Some(value),
            "description" => preamble.description = Some(value),
            "version" => preamble.version = Some(value),
            "model" => preamble.model = Some(value),
            "tools" => {
                preamble.tools = value
                    .trim_matches(|c| c == '[' || c == ']')
                    .split(',')
                    .map(|tool| unquote(tool.trim()))
                    .filter(|tool| !tool.is_empty())
                    .collect();
            }
            _ => {}
        }
    }
    None
}

pub fn parse_agent_manifest(content: &str) -> (Option<String>, Option<String>) {
    let mut display_name = None;
    let mut short_description = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = unquote(value.trim());
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "display_name" => display_name = Some(value),
            "short_description" => short_description = Some(value),
            _ => {}
        }
    }
    (display_name, short_description)
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRoots {
    pub claude_home: PathBuf,
    pub codex_home: PathBuf,
    pub extra_skill_dirs: Vec<PathBuf>,
}

impl CatalogRoots {
    pub fn claude_skills(&self) -> PathBuf {
        self.claude_home.join("skills")
    }

    pub fn claude_plugin_cache(&self) -> PathBuf {
        self.claude_home.join("plugins").join("cache")
    }

    pub fn claude_agents(&self) -> PathBuf {
        self.claude_home.join(AGENTS_DIR_NAME)
    }

    pub fn codex_skills(&self) -> PathBuf {
        self.codex_home.join("skills")
    }

    pub fn watch_targets(&self) -> Vec<PathBuf> {
        let mut targets = vec![
            self.claude_skills(),
            self.claude_plugin_cache(),
            self.codex_skills(),
            self.claude_agents(),
        ];
        targets.extend(self.extra_skill_dirs.iter().cloned());
        targets
    }
}

pub fn scan_catalog(roots: &CatalogRoots) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();

    scan_skill_folders(&roots.claude_skills(), EntrySource::ClaudeUser, &mut entries);
    scan_plugin_cache(&roots.claude_plugin_cache(), &mut entries);
    scan_skill_folders(
        &roots.codex_skills().join(CODEX_SYSTEM_DIR),
        EntrySource::CodexBuiltin,
        &mut entries,
    );
    scan_skill_folders(&roots.codex_skills(), EntrySource::CodexUser, &mut entries);
    for extra in &roots.extra_skill_dirs {
        for path in walk_files(extra) {
            if path.file_name().and_then(|name| name.to_str()) == Some(SKILL_FILE_NAME) {
                entries.extend(read_skill(&path, EntrySource::Extra));
            }
        }
    }
    scan_user_agents(&roots.claude_agents(), &mut entries);

    debug!(entries = entries.len(), "catalog scanned");
    entries
}

fn scan_skill_folders(dir: &Path, source: EntrySource, out: &mut Vec<CatalogEntry>) {
    for child in visible_children(dir) {
        if child.is_dir() {
            out.extend(read_skill(&child.join(SKILL_FILE_NAME), source));
        }
    }
}

fn scan_plugin_cache(dir: &Path, out: &mut Vec<CatalogEntry>) {
    for path in walk_files(dir) {
        let is_skill = path.file_name().and_then(|name| name.to_str()) == Some(SKILL_FILE_NAME);
        if is_skill {
            out.extend(read_skill(&path, EntrySource::ClaudePlugin));
        } else if is_agent_file(&path) {
            out.extend(read_agent(&path, EntrySource::PluginAgent));
        }
    }
}

fn scan_user_agents(dir: &Path, out: &mut Vec<CatalogEntry>) {
    for path in visible_children(dir) {
        if path.is_file() && has_markdown_extension(&path) {
            out.extend(read_agent(&path, EntrySource::UserAgent));
        }
    }
}

fn is_agent_file(path: &Path) -> bool {
    has_markdown_extension(path)
        && path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == AGENTS_DIR_NAME)
}

fn has_markdown_extension(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("md")
}

fn visible_children(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut children: Vec<PathBuf> = read_dir
        .filter_map(Result::ok)
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .collect();
    children.sort();
    children
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn read_skill(path: &Path, source: EntrySource) -> Option<CatalogEntry> {
    let content = fs::read_to_string(path).ok()?;
    let preamble = parse_preamble(&content).unwrap_or_default();
    let mut name = preamble
        .name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| folder_name(path));
    let mut description = preamble.description.unwrap_or_default();

    if matches!(source, EntrySource::CodexBuiltin | EntrySource::CodexUser) {
        let manifest = path
            .parent()
            .map(|dir| dir.join(AGENTS_DIR_NAME).join(CODEX_AGENT_MANIFEST));
        if let Some(raw) = manifest.and_then(|manifest| fs::read_to_string(manifest).ok()) {
            let (display_name, short_description) = parse_agent_manifest(&raw);
            if let Some(display_name) = display_name {
                name = display_name;
            }
            if let Some(short_description) = short_description {
                description = short_description;
            }
        }
    }

    Some(CatalogEntry {
        name,
        description,
        source,
        path: path.to_path_buf(),
        version: preamble.version,
        model: preamble.model,
        tools: preamble.tools,
        last_modified: modified_at(path),
    })
}

fn read_agent(path: &Path, source: EntrySource) -> Option<CatalogEntry> {
    let content = fs::read_to_string(path).ok()?;
    let preamble = parse_preamble(&content).unwrap_or_default();
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    Some(CatalogEntry {
        name: preamble.name.filter(|name| !name.is_empty()).unwrap_or(stem),
        description: preamble.description.unwrap_or_default(),
        source,
        path: path.to_path_buf(),
        version: preamble.version,
        model: preamble.model,
        tools: preamble.tools,
        last_modified: modified_at(path),
    })
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogSection {
    pub source: EntrySource,
    pub title: &'static str,
    pub entries: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogGroup {
    pub id: &'static str,
    pub title: &'static str,
    pub sections: Vec<CatalogSection>,
}

impl CatalogGroup {
    pub fn len(&self) -> usize {
        self.sections.iter().map(|section| section.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const GROUP_LAYOUT: [(&str, &str, &[EntrySource]); 3] = [
    (
        "claude-code",
        "Claude Code",
        &[EntrySource::ClaudeUser, EntrySource::ClaudePlugin, EntrySource::Extra],
    ),
    (
        "codex-cli",
        "Codex CLI",
        &[EntrySource::CodexUser, EntrySource::CodexBuiltin],
    ),
    (
        "agents",
        "Agents",
        &[EntrySource::UserAgent, EntrySource::PluginAgent],
    ),
];

// Empty sections are omitted; groups are always present.
pub fn group_catalog(
    entries: &[CatalogEntry],
    usage: &UsageStats,
    sort: SortMode,
) -> Vec<CatalogGroup> {
    GROUP_LAYOUT
        .iter()
        .map(|&(id, title, sources)| CatalogGroup {
            id,
            title,
            sections: sources
                .iter()
                .filter_map(|source| {
                    let mut section: Vec<CatalogEntry> = entries
                        .iter()
                        .filter(|entry| entry.source == *source)
                        .cloned()
                        .collect();
                    if section.is_empty() {
                        return None;
                    }
                    sort_entries(&mut section, usage, sort);
                    Some(CatalogSection {
                        source: *source,
                        title: source.title(),
                        entries: section,
                    })
                })
                .collect(),
        })
        .collect()
}

pub fn sort_entries(entries: &mut [CatalogEntry], usage: &UsageStats, sort: SortMode) {
    let by_name = |a: &CatalogEntry, b: &CatalogEntry| -> Ordering {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.path.cmp(&b.path))
    };
    match sort {
        SortMode::Name => entries.sort_by(by_name),
        SortMode::Recent => entries.sort_by(|a, b| {
            Reverse(a.last_modified)
                .cmp(&Reverse(b.last_modified))
                .then_with(|| by_name(a, b))
        }),
        SortMode::MostUsed => {
            let count = |entry: &CatalogEntry| {
                stat_for(usage, &entry.trigger_command())
                    .map(|stat| stat.total_count)
                    .unwrap_or(0)
            };
            entries.sort_by(|a, b| count(b).cmp(&count(a)).then_with(|| by_name(a, b)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_parser::InvocationRecord;
    use crate::stats::UsageStat;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn skill_md(name: &str, description: &str) -> String {
        format!("---\nname: {name}\ndescription: \"{description}\"\nversion: 1.2.0\n---\n\n# Body\n")
    }

    fn roots(tmp: &TempDir) -> CatalogRoots {
        CatalogRoots {
            claude_home: tmp.path().join(".claude"),
            codex_home: tmp.path().join(".codex"),
            extra_skill_dirs: vec![tmp.path().join("extra")],
        }
    }

    fn fixture(tmp: &TempDir) -> CatalogRoots {
        let roots = roots(tmp);
        write(&roots.claude_skills().join("pdf").join(SKILL_FILE_NAME), &skill_md("PDF Tools", "Work with PDFs"));
        write(&roots.claude_skills().join("bare").join(SKILL_FILE_NAME), "no preamble here");
        write(&roots.claude_skills().join(".hidden").join(SKILL_FILE_NAME), &skill_md("hidden", "x"));
        let plugin = roots.claude_plugin_cache().join("market").join("acme").join("1.0.0");
        write(&plugin.join("skills").join("lint").join(SKILL_FILE_NAME), &skill_md("lint", "Lint code"));
        write(
            &plugin.join("agents").join("reviewer.md"),
            "---\nname: reviewer\nmodel: sonnet\ntools: [Read, \"Grep\"]\n---\n",
        );
        let codex = roots.codex_skills();
        write(&codex.join(".system").join("plan").join(SKILL_FILE_NAME), &skill_md("plan", "Plan work"));
        write(&codex.join("deploy").join(SKILL_FILE_NAME), &skill_md("deploy", "Ship it"));
        write(
            &codex.join("deploy").join("agents").join("openai.yaml"),
            "interface:\n  display_name: \"Deployer\"\n  short_description: Ships builds\n",
        );
        write(&roots.claude_agents().join("helper.md"), "plain agent without preamble");
        write(&tmp.path().join("extra").join("nested").join("tool").join(SKILL_FILE_NAME), &skill_md("tool", "Extra"));
        roots
    }

    fn by_source(entries: &[CatalogEntry], source: EntrySource) -> Vec<&CatalogEntry> {
        entries.iter().filter(|entry| entry.source == source).collect()
    }

    #[test]
    fn preamble_fields_and_quotes() {
        let preamble = parse_preamble(&skill_md("pdf", "Handles \"PDF\" files")).expect("preamble");
        assert_eq!(preamble.name.as_deref(), Some("pdf"));
        assert_eq!(preamble.description.as_deref(), Some("Handles \"PDF\" files"));
        assert_eq!(preamble.version.as_deref(), Some("1.2.0"));
        assert!(parse_preamble("# just markdown").is_none());
        assert!(parse_preamble("---\nname: unterminated\n").is_none());
    }

    #[test]
    fn scans_every_source() {
        let tmp = TempDir::new().expect("tempdir");
        let entries = scan_catalog(&fixture(&tmp));

        let user: Vec<_> = by_source(&entries, EntrySource::ClaudeUser)
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        assert_eq!(user, vec!["bare".to_string(), "PDF Tools".to_string()]);
        assert_eq!(by_source(&entries, EntrySource::ClaudePlugin).len(), 1);
        assert_eq!(by_source(&entries, EntrySource::CodexBuiltin)[0].name, "plan");
        let codex_user = by_source(&entries, EntrySource::CodexUser);
        assert_eq!(codex_user.len(), 1);
        assert_eq!(codex_user[0].name, "Deployer");
        assert_eq!(codex_user[0].description, "Ships builds");
        assert_eq!(by_source(&entries, EntrySource::Extra)[0].name, "tool");

        let plugin_agent = by_source(&entries, EntrySource::PluginAgent)[0];
        assert_eq!(plugin_agent.model.as_deref(), Some("sonnet"));
        assert_eq!(plugin_agent.tools, vec!["Read".to_string(), "Grep".to_string()]);
        assert_eq!(by_source(&entries, EntrySource::UserAgent)[0].name, "helper");
    }

    #[test]
    fn missing_roots_yield_empty_catalog() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(scan_catalog(&roots(&tmp)).is_empty());
    }

    #[test]
    fn trigger_commands_match_log_names() {
        let tmp = TempDir::new().expect("tempdir");
        let entries = scan_catalog(&fixture(&tmp));
        let trigger = |source| by_source(&entries, source)[0].trigger_command();
        assert_eq!(trigger(EntrySource::ClaudeUser), "/bare");
        assert_eq!(trigger(EntrySource::ClaudePlugin), "acme:lint");
        assert_eq!(trigger(EntrySource::CodexUser), "deploy");
        assert_eq!(trigger(EntrySource::PluginAgent), "reviewer");
    }

    fn usage_of(counts: &[(&str, usize)]) -> UsageStats {
        let ts = DateTime::<Utc>::from(SystemTime::UNIX_EPOCH);
        counts
            .iter()
            .map(|(name, count)| {
                let invocation = InvocationRecord {
                    skill_name: name.to_string(),
                    args: None,
                    timestamp: ts,
                    session_id: String::new(),
                    project_path: None,
                };
                (
                    name.to_string(),
                    UsageStat {
                        skill_name: name.to_string(),
                        total_count: *count,
                        first_used: ts,
                        last_used: ts,
                        invocations: vec![invocation; *count],
                    },
                )
            })
            .collect()
    }

    #[test]
    fn grouping_orders_sections_by_sort_mode() {
        let tmp = TempDir::new().expect("tempdir");
        let roots = fixture(&tmp);
        write(&roots.claude_skills().join("zeta").join(SKILL_FILE_NAME), &skill_md("zeta", "z"));
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        for folder in ["bare", "pdf"] {
            File::options()
                .write(true)
                .open(roots.claude_skills().join(folder).join(SKILL_FILE_NAME))
                .and_then(|file| file.set_modified(old))
                .expect("set mtime");
        }
        let entries = scan_catalog(&roots);
        let usage = usage_of(&[("pdf", 5), ("bare", 1)]);

        let names = |sort| -> Vec<String> {
            let groups = group_catalog(&entries, &usage, sort);
            assert_eq!(
                groups.iter().map(|group| group.id).collect::<Vec<_>>(),
                vec!["claude-code", "codex-cli", "agents"]
            );
            groups[0].sections[0]
                .entries
                .iter()
                .map(|entry| entry.name.clone())
                .collect()
        };
        assert_eq!(names(SortMode::Name), vec!["bare", "PDF Tools", "zeta"]);
        assert_eq!(names(SortMode::MostUsed), vec!["PDF Tools", "bare", "zeta"]);
        assert_eq!(names(SortMode::Recent)[0], "zeta");
    }

    #[test]
    fn empty_sections_are_omitted() {
        let groups = group_catalog(&[], &UsageStats::new(), SortMode::Name);
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(CatalogGroup::is_empty));
    }
}
