use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing_subscriber::{EnvFilter, fmt};

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
const FAR_PAST_EPOCH_SECONDS: i64 = -62_135_596_800;

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).without_time().try_init();
}

/// Sentinel used for timestamps that are missing or unparseable.
///
/// Records carrying it still count towards usage totals, but they pull
/// "first used" back to year 1, so callers presenting first-use dates
/// should treat it as unknown.
pub fn far_past() -> DateTime<Utc> {
    DateTime::from_timestamp(FAR_PAST_EPOCH_SECONDS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn is_far_past(ts: DateTime<Utc>) -> bool {
    ts <= far_past()
}

// Zone-less values are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn parse_timestamp_or_far_past(text: &str) -> DateTime<Utc> {
    parse_timestamp(text).unwrap_or_else(far_past)
}

/// Serde adapter writing RFC 3339 UTC with as many sub-second digits as the
/// value carries, and reading either precision leniently.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(super::parse_timestamp_or_far_past(&raw))
    }

    pub mod option {
        use chrono::{DateTime, SecondsFormat, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().map(super::super::parse_timestamp_or_far_past))
        }
    }
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn format_age(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(ts) = ts else {
        return "n/a".to_string();
    };
    if is_far_past(ts) {
        return "unknown".to_string();
    }
    if ts >= now {
        return "just now".to_string();
    }
    let delta = (now - ts).to_std().unwrap_or_default();
    format!("{} ago", human_duration(delta))
}

pub fn truncate(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    if max_len <= 3 {
        return input.chars().take(max_len).collect();
    }
    let head: String = input.chars().take(max_len - 3).collect();
    format!("{head}...")
}
