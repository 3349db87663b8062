use std::time::Duration;
use thiserror::Error;

/// Failure fetching records from an external data source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("Rate limited")]
    RateLimited,
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// A single raw record that cannot be tracked.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("no derivable identity (address, pair or name/symbol)")]
    NoIdentity,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("sink network error: {0}")]
    Network(String),
    #[error("sink rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
    #[error("sink not configured: {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
