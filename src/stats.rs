use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::log_parser::InvocationRecord;
use crate::usage_cache::UsageCache;
use crate::util::is_far_past;

pub const DEFAULT_STALE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStat {
    pub skill_name: String,
    pub total_count: usize,
    pub first_used: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Ascending by timestamp.
    pub invocations: Vec<InvocationRecord>,
}

pub type UsageStats = BTreeMap<String, UsageStat>;

pub fn aggregate(cache: &UsageCache) -> UsageStats {
    let mut grouped: HashMap<&str, Vec<&InvocationRecord>> = HashMap::new();
    for invocation in cache.invocations() {
        grouped
            .entry(invocation.skill_name.as_str())
            .or_default()
            .push(invocation);
    }

    let mut stats = UsageStats::new();
    for (name, mut invocations) in grouped {
        invocations.sort_by_key(|invocation| invocation.timestamp);
        let (Some(first), Some(last)) = (invocations.first(), invocations.last()) else {
            continue;
        };
        let stat = UsageStat {
            skill_name: name.to_string(),
            total_count: invocations.len(),
            first_used: first.timestamp,
            last_used: last.timestamp,
            invocations: invocations.iter().map(|&inv| inv.clone()).collect(),
        };
        stats.insert(stat.skill_name.clone(), stat);
    }
    stats
}

impl UsageStat {
    pub fn days_since_last_used(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_used).num_days().max(0)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_days: i64) -> bool {
        self.days_since_last_used(now) >= stale_after_days
    }

    /// Human summary of how often the skill is used, e.g. `3 uses`,
    /// `~2x/week` or `~5x/month`.
    pub fn frequency_description(&self) -> String {
        let count = self.total_count;
        if count == 0 {
            return "never".to_string();
        }
        if is_far_past(self.first_used) {
            return uses(count);
        }
        let span_days = (self.last_used - self.first_used).num_days();
        if span_days < 7 {
            return uses(count);
        }
        let per_week = count as f64 / (span_days as f64 / 7.0);
        if per_week >= 1.0 {
            format!("~{}x/week", per_week.round() as u64)
        } else {
            let per_month = count as f64 / (span_days as f64 / 30.0);
            format!("~{}x/month", per_month.round().max(1.0) as u64)
        }
    }
}

fn uses(count: usize) -> String {
    if count == 1 {
        "1 use".to_string()
    } else {
        format!("{count} uses")
    }
}

/// Looks up a stat by the command that triggers a skill (`/pdf`) or by its
/// bare name (`pdf`, `plugin:skill`).
pub fn stat_for<'a>(stats: &'a UsageStats, trigger: &str) -> Option<&'a UsageStat> {
    let name = trigger.strip_prefix('/').unwrap_or(trigger);
    stats.get(name)
}

// Most used first, ties broken by name.
pub fn ranked(stats: &UsageStats) -> Vec<&UsageStat> {
    let mut ranked: Vec<&UsageStat> = stats.values().collect();
    ranked.sort_by(|a, b| {
        b.total_count
            .cmp(&a.total_count)
            .then_with(|| a.skill_name.cmp(&b.skill_name))
    });
    ranked
}

pub fn most_used(stats: &UsageStats) -> Option<&UsageStat> {
    ranked(stats).into_iter().next()
}

// Least recently used first.
pub fn stale(stats: &UsageStats, now: DateTime<Utc>, stale_after_days: i64) -> Vec<&UsageStat> {
    let mut stale: Vec<&UsageStat> = stats
        .values()
        .filter(|stat| stat.is_stale(now, stale_after_days))
        .collect();
    stale.sort_by_key(|stat| stat.last_used);
    stale
}

pub fn total_invocations(stats: &UsageStats) -> usize {
    stats.values().map(|stat| stat.total_count).sum()
}
