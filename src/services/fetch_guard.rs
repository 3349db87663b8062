use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::sources::{RecordSource, SourceError};

/// Result of one guarded fetch. `records` is empty whenever `failure` is set.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<Value>,
    pub failure: Option<SourceError>,
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// Single attempt per cycle, hard timeout, errors logged and turned into an empty result.
pub struct FetchGuard {
    source: Arc<dyn RecordSource>,
    timeout: Duration,
}

impl FetchGuard {
    pub fn new(source: Arc<dyn RecordSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub async fn fetch(&self) -> FetchOutcome {
        let result = match tokio::time::timeout(self.timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.timeout)),
        };

        match result {
            Ok(records) => FetchOutcome { records, failure: None },
            Err(e) => {
                tracing::warn!(source = %self.source.name(), "Fetch failed, skipping cycle: {}", e);
                FetchOutcome { records: Vec::new(), failure: Some(e) }
            }
        }
    }
}
