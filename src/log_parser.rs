use std::fs;
use std::io;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::util::{iso8601, parse_timestamp_or_far_past};

pub const SKILL_TOOL_NAME: &str = "Skill";
pub const SKILL_DIRECTORY_MARKER: &str = "Base directory for this skill:";

const PROJECTS_COMPONENT: &str = "projects";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub skill_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

pub fn parse_log_file(path: &Path) -> io::Result<Vec<InvocationRecord>> {
    let bytes = fs::read(path)?;
    let project = project_from_log_path(path);
    Ok(parse_log_bytes(&bytes, project.as_deref()))
}

/// Lines are handled independently. A line that is not UTF-8, not JSON or
/// not a recognised shape contributes nothing.
pub fn parse_log_bytes(bytes: &[u8], project_path: Option<&str>) -> Vec<InvocationRecord> {
    let mut records = Vec::new();
    let mut undecodable = 0usize;

    for raw in bytes.split(|byte| *byte == b'\n') {
        let Ok(line) = std::str::from_utf8(raw) else {
            undecodable += 1;
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mentions_tool = line.contains(SKILL_TOOL_NAME);
        let mentions_marker = line.contains(SKILL_DIRECTORY_MARKER);
        if !mentions_tool && !mentions_marker {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(line) else {
            undecodable += 1;
            continue;
        };
        extract_invocations(&parsed, project_path, &mut records);
    }

    if undecodable > 0 {
        debug!(undecodable, "skipped undecodable session log lines");
    }
    records
}

fn extract_invocations(
    parsed: &Value,
    project_path: Option<&str>,
    out: &mut Vec<InvocationRecord>,
) {
    let kind = str_at(parsed, &["type"]);
    let timestamp = str_at(parsed, &["timestamp"])
        .map(|text| parse_timestamp_or_far_past(&text))
        .unwrap_or_else(crate::util::far_past);
    let session_id = str_at(parsed, &["sessionId"]).unwrap_or_default();
    let content = parsed.get("message").and_then(|message| message.get("content"));

    let record = |skill_name: String, args: Option<String>| InvocationRecord {
        skill_name,
        args,
        timestamp,
        session_id: session_id.clone(),
        project_path: project_path.map(str::to_string),
    };

    match kind.as_deref() {
        Some("assistant") => {
            let Some(blocks) = content.and_then(Value::as_array) else {
                return;
            };
            for block in blocks {
                if str_at(block, &["type"]).as_deref() != Some("tool_use")
                    || str_at(block, &["name"]).as_deref() != Some(SKILL_TOOL_NAME)
                {
                    continue;
                }
                let Some(skill) = str_at(block, &["input", "skill"]).filter(|s| !s.is_empty()) else {
                    continue;
                };
                out.push(record(skill, str_at(block, &["input", "args"])));
            }
        }
        Some("user") => {
            let texts: Vec<&str> = match content {
                Some(Value::String(text)) => vec![text.as_str()],
                Some(Value::Array(blocks)) => blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect(),
                _ => Vec::new(),
            };
            for text in texts {
                if let Some(skill) = skill_from_marker_text(text) {
                    out.push(record(skill, None));
                }
            }
        }
        _ => {}
    }
}

/// Name of the skill whose directory follows the loader marker, i.e. the
/// last component of the path on the marker line.
pub fn skill_from_marker_text(text: &str) -> Option<String> {
    let (_, rest) = text.split_once(SKILL_DIRECTORY_MARKER)?;
    let dir = rest.lines().next()?.trim();
    if dir.is_empty() {
        return None;
    }
    Path::new(dir)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

pub fn project_from_log_path(path: &Path) -> Option<String> {
    let mut components = path.components();
    components
        .by_ref()
        .find(|component| matches!(component, Component::Normal(name) if *name == PROJECTS_COMPONENT))?;
    match components.next()? {
        Component::Normal(name) => name.to_str().map(str::to_string),
        _ => None,
    }
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor.as_str().map(|s| s.to_string())
}
