use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::PersistenceError;
use crate::models::{Alert, Snapshot};
use super::extract::RecordExtractor;
use super::fetch_guard::FetchGuard;
use super::notifier::Notifier;
use super::policy::{Decision, ThresholdPolicy};
use super::stats::{CycleReport, WatcherStats};
use super::store::DedupeStore;

/// Cooperative cancellation observed between cycles and during the sleep.
///
/// Dropping the [`CancelHandle`] counts as cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal { rx: self.tx.subscribe() }
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&mut self) {
        loop {
            let done = *self.rx.borrow_and_update();
            if done || self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Timing knobs for one poller.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub interval: Duration,
    /// Run the first cycle right away instead of after one interval.
    pub immediate_first: bool,
    /// How long an in-flight cycle may keep running after cancellation.
    pub grace: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            immediate_first: true,
            grace: Duration::from_secs(5),
        }
    }
}

/// fetch -> extract -> evaluate -> persist -> notify, for one source.
pub struct Poller {
    name: String,
    fetch: FetchGuard,
    extractor: RecordExtractor,
    policy: ThresholdPolicy,
    store: Arc<dyn DedupeStore>,
    notifier: Notifier,
    schedule: Schedule,
    namespace: Option<String>,
    stats: Arc<WatcherStats>,
    cycle: AtomicU64,
}

impl Poller {
    pub fn new(
        name: &str,
        fetch: FetchGuard,
        extractor: RecordExtractor,
        policy: ThresholdPolicy,
        store: Arc<dyn DedupeStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            name: name.to_string(),
            fetch,
            extractor,
            policy,
            store,
            notifier,
            schedule: Schedule::default(),
            namespace: None,
            stats: Arc::new(WatcherStats::default()),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Prefix store keys so this watcher does not share dedupe state with others.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn with_stats(mut self, stats: Arc<WatcherStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    /// Loop until cancelled. Returns the number of completed cycles.
    pub async fn run(&self, mut cancel: CancelSignal) -> u64 {
        let interval = self.schedule.interval;
        tracing::info!(watcher = %self.name, "▶ Poller started ({}s interval)", interval.as_secs());

        if !self.schedule.immediate_first {
            tokio::select! {
                _ = cancel.cancelled() => return 0,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let mut completed = 0;
        while !cancel.is_cancelled() {
            let start = Instant::now();

            let cycle = self.run_cycle();
            tokio::pin!(cycle);
            tokio::select! {
                _ = &mut cycle => completed += 1,
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(self.schedule.grace, &mut cycle).await {
                        Ok(_) => completed += 1,
                        Err(_) => tracing::warn!(watcher = %self.name, "Cycle abandoned after grace period"),
                    }
                    break;
                }
            }

            let sleep_time = interval.saturating_sub(start.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_time) => {}
            }
        }

        tracing::info!(watcher = %self.name, "■ Poller stopped after {} cycles", completed);
        completed
    }

    /// One fetch and evaluation pass over every returned record, in source order.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = self.fetch.fetch().await;

        let mut report = CycleReport {
            cycle,
            fetch_ok: outcome.is_ok(),
            records: outcome.records.len(),
            ..Default::default()
        };

        for record in &outcome.records {
            self.process_record(record, &mut report).await;
        }
        self.flush(&mut report);

        self.stats.record(&report);
        if report.fetch_ok {
            tracing::info!(
                watcher = %self.name,
                "✓ Cycle {}: {} records | {} new | {} alerts | {} rejected",
                cycle, report.records, report.first_sights, report.notified, report.rejected
            );
        }
        report
    }

    async fn process_record(&self, record: &Value, report: &mut CycleReport) {
        let obs = match self.extractor.extract(record) {
            Ok(obs) => obs,
            Err(e) => {
                report.rejected += 1;
                tracing::warn!(watcher = %self.name, "Record skipped: {}", e);
                return;
            }
        };

        let store_key = self.store_key(&obs.key);
        let now = Utc::now();

        // Decide and mark under the store lock so pollers sharing a key cannot both send.
        let mut outcome = Outcome::Unchanged;
        let written = self.store.update(&store_key, &mut |previous| {
            let decision = self.policy.evaluate(&obs.metrics, previous.map(|s| &s.metrics));
            let mut next = match previous {
                Some(prev) => prev.observe(&obs, now),
                None => Snapshot::first_sight(store_key.clone(), &obs, now),
            };
            outcome = match decision {
                Decision::FirstSight => Outcome::FirstSight,
                Decision::NoChange => Outcome::Unchanged,
                Decision::Qualifies(reason) if next.notified && !self.policy.repeatable => {
                    Outcome::Suppressed(reason)
                }
                Decision::Qualifies(reason) => {
                    let was_notified = next.notified;
                    next.mark_notified();
                    Outcome::Send { reason, snapshot: next.clone(), was_notified }
                }
            };
            Some(next)
        });
        if let Err(e) = written {
            self.persist_failed(report, &store_key, e);
        }

        let (reason, snapshot, was_notified) = match outcome {
            Outcome::FirstSight => {
                report.first_sights += 1;
                tracing::debug!(watcher = %self.name, key = %store_key, "tracking new entity");
                return;
            }
            Outcome::Unchanged => return,
            Outcome::Suppressed(reason) => {
                report.suppressed += 1;
                tracing::debug!(watcher = %self.name, key = %store_key, reason = %reason, "already notified");
                return;
            }
            Outcome::Send { reason, snapshot, was_notified } => (reason, snapshot, was_notified),
        };

        // Persist before sending: a crash in between loses an alert instead of duplicating it.
        self.flush(report);

        let alert = Alert::from_snapshot(&self.name, &obs.key, &snapshot, &reason, self.policy.relevant_metrics(&reason));
        match self.notifier.notify(&alert).await {
            Ok(()) => {
                report.notified += 1;
                tracing::info!(watcher = %self.name, key = %obs.key, reason = %reason, "🔔 Alert sent");
            }
            Err(e) => {
                report.send_failures += 1;
                tracing::warn!(watcher = %self.name, key = %obs.key, reason = %reason, "Alert send failed: {}", e);
                if !self.policy.mark_notified_on_send_failure {
                    self.revert_notified(&store_key, snapshot.notify_count, was_notified, report);
                }
            }
        }
    }

    /// Undo this cycle's notified mark on whatever the store holds now.
    /// Skipped when another cycle has marked the key since.
    fn revert_notified(&self, store_key: &str, marked_count: u32, was_notified: bool, report: &mut CycleReport) {
        let reverted = self.store.update(store_key, &mut |current| {
            let current = current?;
            if current.notify_count != marked_count {
                return None;
            }
            let mut next = current.clone();
            next.notified = was_notified;
            next.notify_count = marked_count.saturating_sub(1);
            Some(next)
        });
        if let Err(e) = reverted {
            self.persist_failed(report, store_key, e);
        }
    }

    fn flush(&self, report: &mut CycleReport) {
        if let Err(e) = self.store.flush() {
            report.persist_failures += 1;
            tracing::warn!(watcher = %self.name, "Dedupe store flush failed, keeping in memory: {}", e);
        }
    }

    fn persist_failed(&self, report: &mut CycleReport, key: &str, e: PersistenceError) {
        report.persist_failures += 1;
        tracing::warn!(watcher = %self.name, key = %key, "Dedupe store write failed, keeping in memory: {}", e);
    }
}

/// What one record's store update decided, carried out of the store lock.
enum Outcome {
    FirstSight,
    Unchanged,
    Suppressed(String),
    Send { reason: String, snapshot: Snapshot, was_notified: bool },
}

/// Runs several pollers as supervised tasks sharing one cancel signal.
pub struct PollScheduler {
    cancel: CancelHandle,
    tasks: Vec<(String, JoinHandle<u64>)>,
}

impl PollScheduler {
    pub fn spawn(pollers: Vec<Arc<Poller>>) -> Self {
        let (cancel, _) = cancel_pair();
        let tasks = pollers
            .into_iter()
            .map(|poller| {
                let name = poller.name().to_string();
                let signal = cancel.signal();
                let handle = tokio::spawn(async move { poller.run(signal).await });
                (name, handle)
            })
            .collect();
        Self { cancel, tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Names of pollers whose task already ended (panicked or returned).
    pub fn finished(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Cancel every poller and join it, aborting any that outlive `grace`.
    /// Returns completed cycles per poller; `None` for aborted or panicked ones.
    pub async fn shutdown(self, grace: Duration) -> Vec<(String, Option<u64>)> {
        self.cancel.cancel();

        let joins = self.tasks.into_iter().map(|(name, mut handle)| async move {
            let result = match tokio::time::timeout(grace, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(watcher = %name, "Poller did not stop within grace, aborting");
                    handle.abort();
                    handle.await
                }
            };
            match result {
                Ok(cycles) => (name, Some(cycles)),
                Err(e) if e.is_panic() => {
                    tracing::error!(watcher = %name, "Poller panicked: {}", e);
                    (name, None)
                }
                Err(_) => (name, None),
            }
        });

        futures::future::join_all(joins).await
    }
}

/// Single cycle for every poller, concurrently; used by `--once`.
pub async fn run_once(pollers: &[Arc<Poller>]) -> Vec<(String, CycleReport)> {
    let cycles = pollers.iter().map(|p| async move { (p.name().to_string(), p.run_cycle().await) });
    futures::future::join_all(cycles).await
}
