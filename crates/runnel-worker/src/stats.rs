//! Per-host outcome counters and the transposed run summary.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventKind, ExecutionEvent};

/// Counters for one host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStat {
    pub ok: u64,
    pub changed: u64,
    pub failures: u64,
    pub dark: u64,
    pub skipped: u64,
}

/// Per-status mapping of host to count. Hosts with a zero count for a bucket
/// are omitted from that bucket; all five buckets are always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposedStats {
    pub ok: BTreeMap<String, u64>,
    pub changed: BTreeMap<String, u64>,
    pub failures: BTreeMap<String, u64>,
    pub dark: BTreeMap<String, u64>,
    pub skipped: BTreeMap<String, u64>,
}

impl TransposedStats {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || !self.dark.is_empty()
    }
}

/// Accumulates outcomes from translated terminal events.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    hosts: BTreeMap<String, HostStat>,
    counted: HashSet<(String, Uuid)>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `host` shows up in the recap even if it never finishes a task.
    pub fn observe_host(&mut self, host: &str) {
        if !self.hosts.contains_key(host) {
            self.hosts.insert(host.to_string(), HostStat::default());
        }
    }

    /// Count a translated event. Returns `true` if a bucket was incremented.
    ///
    /// Only terminal runner events count, and each (host, task scope) pair
    /// counts at most once.
    pub fn record(&mut self, event: &ExecutionEvent) -> bool {
        if !event.event.is_terminal() {
            return false;
        }
        let Some(host) = event.host() else {
            return false;
        };
        let scope = event.parent_uuid.unwrap_or(Uuid::nil());
        if !self.counted.insert((host.to_string(), scope)) {
            return false;
        }

        let stat = self.hosts.entry(host.to_string()).or_default();
        match event.event {
            EventKind::RunnerOnOk if event.changed() => stat.changed += 1,
            EventKind::RunnerOnOk => stat.ok += 1,
            EventKind::RunnerOnFailed => stat.failures += 1,
            EventKind::RunnerOnUnreachable => stat.dark += 1,
            EventKind::RunnerOnSkipped => stat.skipped += 1,
            _ => return false,
        }
        true
    }

    /// Hosts in recap order.
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostStat)> {
        self.hosts.iter().map(|(host, stat)| (host.as_str(), stat))
    }

    pub fn transposed(&self) -> TransposedStats {
        let mut out = TransposedStats::default();
        for (host, stat) in &self.hosts {
            for (bucket, count) in [
                (&mut out.ok, stat.ok),
                (&mut out.changed, stat.changed),
                (&mut out.failures, stat.failures),
                (&mut out.dark, stat.dark),
                (&mut out.skipped, stat.skipped),
            ] {
                if count > 0 {
                    bucket.insert(host.clone(), count);
                }
            }
        }
        out
    }

    /// Any host failed a task or was unreachable.
    pub fn has_failures(&self) -> bool {
        self.hosts.values().any(|s| s.failures > 0 || s.dark > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{Map, json};

    fn terminal(kind: EventKind, host: &str, scope: Uuid, changed: bool) -> ExecutionEvent {
        let mut data = Map::new();
        data.insert("host".into(), json!(host));
        data.insert("changed".into(), json!(changed));
        ExecutionEvent {
            uuid: Uuid::new_v4(),
            counter: 1,
            created: Utc::now(),
            runner_ident: "1".into(),
            event: kind,
            parent_uuid: Some(scope),
            event_data: data,
            stdout: String::new(),
            start_line: 0,
            end_line: 0,
        }
    }

    #[test]
    fn test_buckets() {
        let mut stats = StatsAggregator::new();
        stats.record(&terminal(EventKind::RunnerOnOk, "a", Uuid::new_v4(), false));
        stats.record(&terminal(EventKind::RunnerOnOk, "a", Uuid::new_v4(), true));
        stats.record(&terminal(EventKind::RunnerOnSkipped, "b", Uuid::new_v4(), false));

        let summary = stats.transposed();
        assert_eq!(summary.ok.get("a"), Some(&1));
        assert_eq!(summary.changed.get("a"), Some(&1));
        assert_eq!(summary.skipped.get("b"), Some(&1));
        assert!(summary.ok.get("b").is_none());
        assert!(!stats.has_failures());
        assert!(!summary.has_failures());
    }

    #[test]
    fn test_failures_and_dark() {
        let mut stats = StatsAggregator::new();
        stats.record(&terminal(EventKind::RunnerOnUnreachable, "db", Uuid::new_v4(), false));
        assert!(stats.has_failures());
        assert_eq!(stats.transposed().dark.get("db"), Some(&1));

        let mut stats = StatsAggregator::new();
        stats.record(&terminal(EventKind::RunnerOnFailed, "db", Uuid::new_v4(), false));
        assert!(stats.has_failures());
        assert!(stats.transposed().has_failures());
    }

    #[test]
    fn test_pair_counts_once() {
        let mut stats = StatsAggregator::new();
        let scope = Uuid::new_v4();
        assert!(stats.record(&terminal(EventKind::RunnerOnOk, "a", scope, false)));
        assert!(!stats.record(&terminal(EventKind::RunnerOnFailed, "a", scope, false)));
        assert!(!stats.has_failures());
        assert_eq!(stats.transposed().ok.get("a"), Some(&1));
    }

    #[test]
    fn test_observed_host_has_zero_row() {
        let mut stats = StatsAggregator::new();
        stats.observe_host("idle");
        let rows: Vec<_> = stats.hosts().collect();
        assert_eq!(rows, vec![("idle", &HostStat::default())]);
        let summary = serde_json::to_value(stats.transposed()).unwrap();
        assert_eq!(
            summary,
            json!({"ok": {}, "changed": {}, "failures": {}, "dark": {}, "skipped": {}})
        );
    }

    #[test]
    fn test_non_terminal_ignored() {
        let mut stats = StatsAggregator::new();
        let event = terminal(EventKind::RunnerOnStart, "a", Uuid::new_v4(), false);
        assert!(!stats.record(&event));
    }
}
