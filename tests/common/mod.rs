#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pump_watch::error::{PersistenceError, SendError, SourceError};
use pump_watch::models::Snapshot;
use pump_watch::services::{
    Apply, AlertFormatter, DedupeStore, FetchGuard, FieldSpec, KeySpec, MemoryStore, MessageTemplate, Notifier,
    NotifySink, Poller, RecordExtractor, Schedule, ThresholdPolicy,
};
use pump_watch::sources::RecordSource;

pub enum Step {
    Records(Vec<Value>),
    Fail,
    Hang,
}

/// Replays a fixed list of responses, then returns empty batches.
#[derive(Default)]
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self { steps: Mutex::new(steps.into()), calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Records(records)) => Ok(records),
            Some(Step::Fail) => Err(SourceError::Network("connection reset".into())),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(vec![])
            }
            None => Ok(vec![]),
        }
    }
}

/// Captures every message; can be told to fail or to be slow.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl NotifySink for RecordingSink {
    async fn send(&self, text: &str) -> Result<(), SendError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::Rejected { status: 400, description: "chat not found".into() });
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

/// Memory store whose durable write always fails.
pub struct FailingStore {
    inner: MemoryStore,
    pub failed_writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: MemoryStore::new(0), failed_writes: AtomicUsize::new(0) })
    }
}

impl DedupeStore for FailingStore {
    fn get(&self, key: &str) -> Option<Snapshot> {
        self.inner.get(key)
    }

    fn update(&self, key: &str, apply: &mut Apply<'_>) -> Result<(), PersistenceError> {
        self.inner.update(key, apply)?;
        self.failed_writes.fetch_add(1, Ordering::SeqCst);
        Err(PersistenceError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs")))
    }

    fn all_keys(&self) -> Vec<String> {
        self.inner.all_keys()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

pub fn fields() -> FieldSpec {
    FieldSpec::new([
        ("txn_count", vec!["txn_count", "txns"]),
        ("market_cap_usd", vec!["market_cap_usd", "usd_market_cap"]),
        ("volume_usd", vec!["volume_usd", "liquidity_usd"]),
    ])
}

pub fn poller(
    source: Arc<ScriptedSource>,
    policy: ThresholdPolicy,
    store: Arc<dyn DedupeStore>,
    sink: Arc<RecordingSink>,
) -> Poller {
    let template = MessageTemplate {
        title: "🆕 *Test alert*".into(),
        link_template: "https://pump.fun/{key}".into(),
        extra_links: vec![],
    };
    Poller::new(
        "test",
        FetchGuard::new(source, Duration::from_millis(200)),
        RecordExtractor::new(KeySpec::default(), fields()),
        policy,
        store,
        Notifier::new(AlertFormatter::new(template), sink),
    )
    .with_schedule(Schedule {
        interval: Duration::from_millis(30),
        immediate_first: true,
        grace: Duration::from_millis(500),
    })
}
