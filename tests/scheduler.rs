mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{poller, RecordingSink, ScriptedSource, Step};
use pump_watch::services::{
    cancel_pair, run_once, DedupeStore, MemoryStore, PollScheduler, PollStats, Poller, Predicate, Schedule,
    ThresholdPolicy,
};

fn low_cap_policy() -> ThresholdPolicy {
    ThresholdPolicy::new().on_first_sight("low_cap", Predicate::at_most("market_cap_usd", 5000.0))
}

async fn wait_until<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test]
async fn failed_fetch_does_not_stop_the_next_cycle() {
    let source = ScriptedSource::new(vec![
        Step::Fail,
        Step::Records(vec![json!({"mint": "late", "market_cap_usd": 900})]),
    ]);
    let sink = RecordingSink::new();
    let stats = PollStats::new();
    let p = Arc::new(
        poller(source.clone(), low_cap_policy(), Arc::new(MemoryStore::new(0)), sink.clone())
            .with_stats(stats.watcher("test")),
    );

    let (handle, signal) = cancel_pair();
    let task = tokio::spawn({
        let p = p.clone();
        async move { p.run(signal).await }
    });

    assert!(wait_until(|| sink.count() == 1, Duration::from_secs(2)).await);
    handle.cancel();
    let cycles = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    assert!(cycles >= 2);
    let json = stats.snapshot();
    assert_eq!(json["test"]["fetch_failures"], 1);
    assert_eq!(json["test"]["notified"], 1);
}

#[tokio::test]
async fn hanging_source_is_cut_off_by_the_fetch_timeout() {
    let source = ScriptedSource::new(vec![
        Step::Hang,
        Step::Records(vec![json!({"mint": "after", "market_cap_usd": 10})]),
    ]);
    let sink = RecordingSink::new();
    let p = poller(source, low_cap_policy(), Arc::new(MemoryStore::new(0)), sink.clone());

    let started = std::time::Instant::now();
    let report = p.run_cycle().await;
    assert!(!report.fetch_ok);
    assert_eq!(report.records, 0);
    assert!(started.elapsed() < Duration::from_secs(2));

    let report = p.run_cycle().await;
    assert!(report.fetch_ok);
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn delayed_start_waits_one_interval() {
    let source = ScriptedSource::new(vec![]);
    let p = Arc::new(
        poller(source.clone(), low_cap_policy(), Arc::new(MemoryStore::new(0)), RecordingSink::new()).with_schedule(
            Schedule {
                interval: Duration::from_millis(400),
                immediate_first: false,
                grace: Duration::from_millis(100),
            },
        ),
    );

    let (handle, signal) = cancel_pair();
    let task = tokio::spawn({
        let p = p.clone();
        async move { p.run(signal).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.calls(), 0);
    assert!(wait_until(|| source.calls() >= 1, Duration::from_secs(2)).await);

    handle.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_before_delayed_start_runs_nothing() {
    let source = ScriptedSource::new(vec![]);
    let p = poller(source.clone(), low_cap_policy(), Arc::new(MemoryStore::new(0)), RecordingSink::new())
        .with_schedule(Schedule {
            interval: Duration::from_secs(60),
            immediate_first: false,
            grace: Duration::from_millis(100),
        });

    let (handle, signal) = cancel_pair();
    handle.cancel();
    let cycles = tokio::time::timeout(Duration::from_secs(1), p.run(signal)).await.unwrap();
    assert_eq!(cycles, 0);
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn in_flight_send_finishes_within_grace() {
    let source = ScriptedSource::new(vec![Step::Records(vec![json!({"mint": "slow", "market_cap_usd": 10})])]);
    let sink = RecordingSink::new();
    *sink.delay.lock() = Some(Duration::from_millis(200));
    let store = Arc::new(MemoryStore::new(0));
    let p = Arc::new(poller(source.clone(), low_cap_policy(), store.clone(), sink.clone()));

    let (handle, signal) = cancel_pair();
    let task = tokio::spawn({
        let p = p.clone();
        async move { p.run(signal).await }
    });

    assert!(wait_until(|| source.calls() == 1, Duration::from_secs(1)).await);
    handle.cancel();
    let cycles = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    assert_eq!(cycles, 1);
    assert_eq!(sink.count(), 1);
    assert!(store.get("slow").unwrap().notified);
}

#[tokio::test]
async fn cycle_past_grace_is_abandoned() {
    let source = ScriptedSource::new(vec![Step::Records(vec![json!({"mint": "stuck", "market_cap_usd": 10})])]);
    let sink = RecordingSink::new();
    *sink.delay.lock() = Some(Duration::from_secs(30));
    let p = Arc::new(poller(source.clone(), low_cap_policy(), Arc::new(MemoryStore::new(0)), sink.clone()));

    let (handle, signal) = cancel_pair();
    let task = tokio::spawn({
        let p = p.clone();
        async move { p.run(signal).await }
    });

    assert!(wait_until(|| source.calls() == 1, Duration::from_secs(1)).await);
    handle.cancel();
    let cycles = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    assert_eq!(cycles, 0);
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn scheduler_runs_pollers_over_a_shared_store() {
    let store: Arc<dyn DedupeStore> = Arc::new(MemoryStore::new(0));
    let sink = RecordingSink::new();
    let pump = ScriptedSource::new(vec![Step::Records(vec![json!({"mint": "p1", "market_cap_usd": 100})])]);
    let dex = ScriptedSource::new(vec![Step::Records(vec![
        json!({"pairAddress": "d1", "market_cap_usd": 200}),
        json!({"mint": "p1", "market_cap_usd": 100}),
    ])]);

    let scheduler = PollScheduler::spawn(vec![
        Arc::new(poller(pump, low_cap_policy(), store.clone(), sink.clone())),
        Arc::new(poller(dex, low_cap_policy(), store.clone(), sink.clone())),
    ]);
    assert_eq!(scheduler.len(), 2);

    assert!(wait_until(|| store.len() == 2, Duration::from_secs(2)).await);
    assert!(scheduler.finished().is_empty());

    let results = scheduler.shutdown(Duration::from_secs(2)).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, cycles)| cycles.map_or(false, |n| n >= 1)));

    // p1 reached the store from both pollers but was announced once.
    assert_eq!(sink.count(), 2);
    assert_eq!(store.all_keys(), vec!["d1".to_string(), "p1".to_string()]);
}

#[tokio::test]
async fn run_once_reports_every_poller() {
    let store: Arc<dyn DedupeStore> = Arc::new(MemoryStore::new(0));
    let sink = RecordingSink::new();
    let ok = ScriptedSource::new(vec![Step::Records(vec![json!({"mint": "a", "market_cap_usd": 1})])]);
    let broken = ScriptedSource::new(vec![Step::Fail]);

    let pollers = vec![
        Arc::new(poller(ok, low_cap_policy(), store.clone(), sink.clone())),
        Arc::new(poller(broken, low_cap_policy(), store.clone(), sink.clone())),
    ];
    let reports = run_once(&pollers).await;

    assert_eq!(reports.len(), 2);
    assert!(reports[0].1.fetch_ok);
    assert_eq!(reports[0].1.notified, 1);
    assert!(!reports[1].1.fetch_ok);
    assert_eq!(sink.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_keys_are_announced_once_across_threads() {
    const ROUNDS: usize = 10;
    const MINTS: usize = 500;

    let batch = |round: usize| {
        Step::Records(
            (0..MINTS)
                .map(|i| json!({"mint": format!("r{}-m{}", round, i), "market_cap_usd": 100}))
                .collect(),
        )
    };
    let store: Arc<dyn DedupeStore> = Arc::new(MemoryStore::new(0));
    let sink = RecordingSink::new();
    let pollers: Vec<Arc<Poller>> = (0..2)
        .map(|_| {
            let source = ScriptedSource::new((0..ROUNDS).map(&batch).collect());
            Arc::new(poller(source, low_cap_policy(), store.clone(), sink.clone()))
        })
        .collect();

    let tasks: Vec<_> = pollers
        .into_iter()
        .map(|p| {
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    p.run_cycle().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(store.len(), ROUNDS * MINTS);
    assert_eq!(sink.count(), ROUNDS * MINTS);
}
