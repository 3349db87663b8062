use serde::{Deserialize, Serialize};
use super::{Metrics, Snapshot};

/// A qualifying transition ready to be formatted and sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub watcher: String,
    pub key: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub reason: String,
    pub metrics: Metrics,
    /// Metric names the reason was decided on, in display order.
    pub relevant: Vec<String>,
    pub timestamp: i64,
}

impl Alert {
    pub fn from_snapshot(watcher: &str, entity_key: &str, snap: &Snapshot, reason: &str, relevant: Vec<String>) -> Self {
        Self {
            watcher: watcher.to_string(),
            key: entity_key.to_string(),
            name: snap.name.clone(),
            symbol: snap.symbol.clone(),
            reason: reason.to_string(),
            metrics: snap.metrics.clone(),
            relevant,
            timestamp: snap.last_seen_at.timestamp(),
        }
    }
}
