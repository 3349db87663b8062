pub mod json_api;

use async_trait::async_trait;
use serde_json::Value;

pub use crate::error::SourceError;
pub use json_api::JsonApiSource;

/// External feed of raw, JSON-shaped records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<Vec<Value>, SourceError>;
}
