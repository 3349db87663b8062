use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named numeric observations for one entity (`txn_count`, `market_cap_usd`, ...).
pub type Metrics = BTreeMap<String, f64>;

/// Read a metric, treating a missing name as zero.
pub fn metric(metrics: &Metrics, name: &str) -> f64 {
    metrics.get(name).copied().unwrap_or(0.0)
}

/// One raw record after identity and field extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub metrics: Metrics,
}

/// Persisted per-entity state: last-known metrics plus notification status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub metrics: Metrics,
    pub notified: bool,
    #[serde(default)]
    pub notify_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Snapshot {
    /// Baseline snapshot for an entity seen for the first time.
    pub fn first_sight(key: String, obs: &Observation, now: DateTime<Utc>) -> Self {
        Self {
            key,
            name: obs.name.clone(),
            symbol: obs.symbol.clone(),
            metrics: obs.metrics.clone(),
            notified: false,
            notify_count: 0,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Successor snapshot carrying over identity, first-seen time and notification status.
    pub fn observe(&self, obs: &Observation, now: DateTime<Utc>) -> Self {
        Self {
            key: self.key.clone(),
            name: obs.name.clone().or_else(|| self.name.clone()),
            symbol: obs.symbol.clone().or_else(|| self.symbol.clone()),
            metrics: obs.metrics.clone(),
            notified: self.notified,
            notify_count: self.notify_count,
            first_seen_at: self.first_seen_at,
            last_seen_at: now,
        }
    }

    pub fn mark_notified(&mut self) {
        self.notified = true;
        self.notify_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(name: Option<&str>, txns: f64) -> Observation {
        let mut metrics = Metrics::new();
        metrics.insert("txn_count".into(), txns);
        Observation {
            key: "mintA".into(),
            name: name.map(str::to_string),
            symbol: Some("AAA".into()),
            metrics,
        }
    }

    #[test]
    fn observe_keeps_history_fields() {
        let t0 = Utc::now();
        let mut first = Snapshot::first_sight("mintA".into(), &obs(Some("Alpha"), 1.0), t0);
        first.mark_notified();

        let t1 = t0 + chrono::Duration::seconds(30);
        let next = first.observe(&obs(None, 4.0), t1);

        assert!(next.notified);
        assert_eq!(next.notify_count, 1);
        assert_eq!(next.first_seen_at, t0);
        assert_eq!(next.last_seen_at, t1);
        assert_eq!(next.name.as_deref(), Some("Alpha"));
        assert_eq!(metric(&next.metrics, "txn_count"), 4.0);
        assert_eq!(metric(&next.metrics, "volume_usd"), 0.0);
    }
}
