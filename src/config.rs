use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::services::{
    AlertFormatter, DedupeStore, FetchGuard, FieldSpec, KeySpec, MessageTemplate, Notifier, NotifySink,
    Poller, RecordExtractor, Schedule, ThresholdPolicy, WatcherStats,
};
use crate::sources::JsonApiSource;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub watchers: Vec<WatcherConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default = "default_store_path")]
    pub path: String,
    /// LRU bound on tracked entities; 0 disables eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    #[serde(default)]
    pub disable_preview: bool,
    /// Log alerts instead of sending them.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub records_path: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub immediate_first: bool,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub key: KeySpec,
    #[serde(default)]
    pub fields: FieldSpec,
    #[serde(default)]
    pub policy: ThresholdPolicy,
    #[serde(default)]
    pub message: MessageTemplate,
}

fn default_true() -> bool { true }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 10000 }
fn default_store_path() -> String { "./data/seen.json".to_string() }
fn default_max_entries() -> usize { 10_000 }
fn default_parse_mode() -> String { "Markdown".to_string() }
fn default_interval_secs() -> u64 { 60 }
fn default_fetch_timeout_secs() -> u64 { 15 }
fn default_grace_secs() -> u64 { 5 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { enabled: true, host: default_host(), port: default_port() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { persist: true, path: default_store_path(), max_entries: default_max_entries() }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            parse_mode: default_parse_mode(),
            disable_preview: false,
            dry_run: false,
        }
    }
}

impl Config {
    /// Read, apply environment overrides and validate.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Environment wins over the file for credentials and a few operational knobs.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|&n| var(n).filter(|v| !v.is_empty()));

        if let Some(token) = first(&["TELEGRAM_BOT_TOKEN", "BOT_TOKEN"]) {
            self.telegram.bot_token = token;
        }
        if let Some(chat) = first(&["TELEGRAM_CHAT", "CHANNEL_ID"]) {
            self.telegram.chat_id = chat;
        }
        if let Some(path) = first(&["DEDUPE_STORE_PATH"]) {
            self.storage.path = path;
        }
        if let Some(secs) = first(&["POLL_INTERVAL_SECS"]) {
            match secs.parse::<u64>() {
                Ok(secs) => self.watchers.iter_mut().for_each(|w| w.interval_secs = secs),
                Err(_) => tracing::warn!("Ignoring invalid POLL_INTERVAL_SECS={}", secs),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchers.is_empty() {
            return Err(ConfigError::Invalid("no [[watchers]] configured".to_string()));
        }

        let mut names = HashSet::new();
        for w in &self.watchers {
            let invalid = |msg: String| ConfigError::Invalid(format!("watcher '{}': {}", w.name, msg));
            if w.name.trim().is_empty() {
                return Err(ConfigError::Invalid("watcher with empty name".to_string()));
            }
            if !names.insert(w.name.as_str()) {
                return Err(invalid("duplicate name".to_string()));
            }
            if w.url.trim().is_empty() {
                return Err(invalid("empty url".to_string()));
            }
            if w.interval_secs == 0 || w.fetch_timeout_secs == 0 {
                return Err(invalid("interval_secs and fetch_timeout_secs must be > 0".to_string()));
            }
            w.policy.validate().map_err(invalid)?;
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl WatcherConfig {
    /// Wire this watcher's source, extractor, policy and message into a poller.
    pub fn build_poller(
        &self,
        store: Arc<dyn DedupeStore>,
        sink: Arc<dyn NotifySink>,
        stats: Arc<WatcherStats>,
        grace: Duration,
    ) -> Result<Poller, ConfigError> {
        let timeout = Duration::from_secs(self.fetch_timeout_secs);
        let source = JsonApiSource::new(&self.name, &self.url, &self.records_path, timeout)
            .map_err(|e| ConfigError::Invalid(format!("watcher '{}': {}", self.name, e)))?;

        let notifier = Notifier::new(AlertFormatter::new(self.message.clone()), sink);
        let schedule = Schedule {
            interval: Duration::from_secs(self.interval_secs),
            immediate_first: self.immediate_first,
            grace,
        };

        Ok(Poller::new(
            &self.name,
            FetchGuard::new(Arc::new(source), timeout),
            RecordExtractor::new(self.key.clone(), self.fields.clone()),
            self.policy.clone(),
            store,
            notifier,
        )
        .with_schedule(schedule)
        .with_namespace(self.namespace.clone())
        .with_stats(stats))
    }
}
