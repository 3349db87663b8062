use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// What one poll cycle did, used for the cycle log line and the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub fetch_ok: bool,
    pub records: usize,
    pub rejected: usize,
    pub first_sights: usize,
    pub notified: usize,
    pub suppressed: usize,
    pub send_failures: usize,
    pub persist_failures: usize,
}

/// Running counters for one watcher.
#[derive(Debug, Default)]
pub struct WatcherStats {
    pub cycles: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub records: AtomicU64,
    pub rejected: AtomicU64,
    pub first_sights: AtomicU64,
    pub notified: AtomicU64,
    pub send_failures: AtomicU64,
    pub persist_failures: AtomicU64,
    pub last_cycle_at: AtomicI64,
}

impl WatcherStats {
    pub fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !report.fetch_ok {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.records.fetch_add(report.records as u64, Ordering::Relaxed);
        self.rejected.fetch_add(report.rejected as u64, Ordering::Relaxed);
        self.first_sights.fetch_add(report.first_sights as u64, Ordering::Relaxed);
        self.notified.fetch_add(report.notified as u64, Ordering::Relaxed);
        self.send_failures.fetch_add(report.send_failures as u64, Ordering::Relaxed);
        self.persist_failures.fetch_add(report.persist_failures as u64, Ordering::Relaxed);
        self.last_cycle_at.store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles": self.cycles.load(Ordering::Relaxed),
            "fetch_failures": self.fetch_failures.load(Ordering::Relaxed),
            "records": self.records.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "first_sights": self.first_sights.load(Ordering::Relaxed),
            "notified": self.notified.load(Ordering::Relaxed),
            "send_failures": self.send_failures.load(Ordering::Relaxed),
            "persist_failures": self.persist_failures.load(Ordering::Relaxed),
            "last_cycle_at": self.last_cycle_at.load(Ordering::Relaxed),
        })
    }
}

/// Counters for every watcher, keyed by watcher name.
#[derive(Debug, Default, Clone)]
pub struct PollStats {
    watchers: Arc<DashMap<String, Arc<WatcherStats>>>,
}

impl PollStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watcher(&self, name: &str) -> Arc<WatcherStats> {
        self.watchers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(WatcherStats::default()))
            .clone()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .watchers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}
