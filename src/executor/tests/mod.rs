use super::*;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Job that records every call it receives
#[derive(Default)]
struct RecordingJob {
    items: Vec<u32>,
    work: Duration,
    failing: HashSet<u32>,
    panicking: HashSet<u32>,
    /// Items that block until cancelled
    hanging: HashSet<u32>,
    fail_start: AtomicBool,
    fail_snapshot: AtomicBool,
    fail_end: AtomicBool,
    calls: Mutex<Vec<String>>,
    snapshot_calls: AtomicUsize,
    start_calls: AtomicUsize,
    end_calls: AtomicUsize,
    cancelled_items: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingJob {
    fn with_items(count: u32) -> Self {
        Self {
            items: (0..count).collect(),
            ..Default::default()
        }
    }

    fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn reset_peak(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl CycleJob for RecordingJob {
    type Item = u32;

    async fn on_start(&self, ctx: &CycleContext) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.record(format!("start:{}", ctx.trigger));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Other("start refused".into()));
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<u32>> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.record("snapshot");
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(Error::Other("source unavailable".into()));
        }
        Ok(self.items.clone())
    }

    async fn process_item(&self, item: u32, cancel: CancellationToken) -> Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if self.hanging.contains(&item) {
            cancel.cancelled().await;
            self.cancelled_items.fetch_add(1, Ordering::SeqCst);
        } else if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.record(format!("item:{item}"));

        if self.panicking.contains(&item) {
            panic!("item {item} panicked");
        }
        if self.failing.contains(&item) {
            return Err(Error::job(format!("item {item} failed")));
        }
        Ok(())
    }

    async fn on_end(&self) -> Result<()> {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        self.record("end");
        if self.fail_end.load(Ordering::SeqCst) {
            return Err(Error::Other("flush failed".into()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

fn config(max_worker_threads: i32) -> CycleConfig {
    CycleConfig {
        max_worker_threads,
        drain_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_millis(500),
    }
}

fn executor(job: RecordingJob, max_worker_threads: i32) -> Arc<CycleExecutor<RecordingJob>> {
    Arc::new(CycleExecutor::new(job, config(max_worker_threads)).unwrap())
}

async fn wait_until_running(executor: &CycleExecutor<RecordingJob>) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while executor.state() != CycleState::Draining {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cycle should reach the draining state");
}

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        CycleOutcome::Skipped => panic!("cycle was unexpectedly skipped"),
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_items_three_workers() {
    let executor = executor(
        RecordingJob::with_items(10).work(Duration::from_millis(20)),
        3,
    );

    let report = completed(executor.execute(CycleContext::new("test")).await.unwrap());

    assert_eq!(report.total, 10);
    assert_eq!(report.completed, 10);
    assert!(report.is_clean());
    assert!(executor.job().peak() <= 3);
    assert!(!executor.is_running());
    assert_eq!(executor.state(), CycleState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hooks_bracket_every_item() {
    let executor = executor(RecordingJob::with_items(6), 2);

    executor.execute(CycleContext::new("order")).await.unwrap();

    let calls = executor.job().calls();
    assert_eq!(calls.first().map(String::as_str), Some("start:order"));
    assert_eq!(calls.get(1).map(String::as_str), Some("snapshot"));
    assert_eq!(calls.last().map(String::as_str), Some("end"));
    assert_eq!(calls.iter().filter(|c| c.starts_with("item:")).count(), 6);
    assert_eq!(executor.job().start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.job().end_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_snapshot_runs_hooks_only() {
    let executor = executor(RecordingJob::with_items(0), 3);

    let report = completed(executor.execute(CycleContext::new("empty")).await.unwrap());

    assert_eq!(report.total, 0);
    assert_eq!(report.completed, 0);
    assert_eq!(executor.job().calls(), vec!["start:empty", "snapshot", "end"]);
    assert_eq!(executor.job().peak(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_positive_worker_count_serializes() {
    for workers in [0, -5] {
        let executor = executor(
            RecordingJob::with_items(4).work(Duration::from_millis(10)),
            workers,
        );
        let report = completed(executor.execute(CycleContext::default()).await.unwrap());
        assert_eq!(report.completed, 4);
        assert_eq!(executor.job().peak(), 1, "max_worker_threads={workers}");
    }
}

#[tokio::test]
async fn test_cycle_ids_increase() {
    let executor = executor(RecordingJob::with_items(1), 1);

    let first = completed(executor.execute(CycleContext::default()).await.unwrap());
    let second = completed(executor.execute(CycleContext::default()).await.unwrap());

    assert_eq!(first.cycle_id, CycleId(1));
    assert_eq!(second.cycle_id, CycleId(2));
    assert_eq!(executor.cycles_started(), 2);
}

// ---------------------------------------------------------------------------
// Re-entrancy
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_trigger_is_skipped() {
    let executor = executor(
        RecordingJob::with_items(3).work(Duration::from_millis(200)),
        3,
    );

    let first = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(CycleContext::new("first")).await })
    };
    wait_until_running(&executor).await;

    let second = executor.execute(CycleContext::new("second")).await.unwrap();
    assert!(second.is_skipped());
    assert_eq!(executor.job().snapshot_calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.job().start_calls.load(Ordering::SeqCst), 1);

    let first = completed(first.await.unwrap().unwrap());
    assert_eq!(first.completed, 3);

    let third = completed(executor.execute(CycleContext::new("third")).await.unwrap());
    assert_eq!(third.completed, 3);
    assert_eq!(executor.job().snapshot_calls.load(Ordering::SeqCst), 2);
    assert!(!executor.job().calls().contains(&"start:second".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_run_one_cycle() {
    let executor = executor(
        RecordingJob::with_items(2).work(Duration::from_millis(100)),
        2,
    );

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute(CycleContext::new(format!("t{n}"))).await })
        })
        .collect();

    let mut ran = 0;
    let mut skipped = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            CycleOutcome::Completed(_) => ran += 1,
            CycleOutcome::Skipped => skipped += 1,
        }
    }

    assert!(ran >= 1);
    assert_eq!(ran + skipped, 8);
    assert_eq!(
        executor.job().snapshot_calls.load(Ordering::SeqCst),
        ran,
        "every accepted cycle takes exactly one snapshot"
    );
    assert!(!executor.is_running());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_item_failure_is_isolated() {
    let mut job = RecordingJob::with_items(5);
    job.failing.insert(2);
    let executor = executor(job, 2);

    let report = completed(executor.execute(CycleContext::default()).await.unwrap());

    assert_eq!(report.completed, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(
        report.failures,
        vec![ItemFailure {
            index: 2,
            error: "item 2 failed".into()
        }]
    );
    assert_eq!(executor.job().end_calls.load(Ordering::SeqCst), 1);
    assert!(!executor.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_item_panic_is_isolated() {
    let mut job = RecordingJob::with_items(4);
    job.panicking.insert(0);
    let executor = executor(job, 4);

    let report = completed(executor.execute(CycleContext::default()).await.unwrap());

    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].error.contains("item 0 panicked"));
    assert!(!executor.is_running());
}

#[tokio::test]
async fn test_snapshot_failure_releases_guard() {
    let job = RecordingJob::with_items(3);
    job.fail_snapshot.store(true, Ordering::SeqCst);
    let executor = executor(job, 2);

    let err = executor.execute(CycleContext::default()).await.unwrap_err();
    assert!(matches!(err, Error::Snapshot { .. }));
    assert_eq!(err.to_string(), "snapshot failed: source unavailable");
    assert_eq!(executor.job().end_calls.load(Ordering::SeqCst), 1);
    assert!(!executor.is_running());
    assert_eq!(executor.state(), CycleState::Idle);

    executor.job().fail_snapshot.store(false, Ordering::SeqCst);
    let report = completed(executor.execute(CycleContext::default()).await.unwrap());
    assert_eq!(report.completed, 3);
}

#[tokio::test]
async fn test_start_hook_failure_skips_snapshot() {
    let job = RecordingJob::with_items(3);
    job.fail_start.store(true, Ordering::SeqCst);
    let executor = executor(job, 2);

    let err = executor.execute(CycleContext::default()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Hook {
            hook: HookKind::Start,
            ..
        }
    ));
    assert_eq!(executor.job().snapshot_calls.load(Ordering::SeqCst), 0);
    assert_eq!(executor.job().end_calls.load(Ordering::SeqCst), 1);
    assert!(!executor.is_running());
}

#[tokio::test]
async fn test_end_hook_failure_releases_guard() {
    let job = RecordingJob::with_items(2);
    job.fail_end.store(true, Ordering::SeqCst);
    let executor = executor(job, 2);

    let err = executor.execute(CycleContext::default()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Hook {
            hook: HookKind::End,
            ..
        }
    ));
    assert_eq!(executor.job().calls().iter().filter(|c| c.starts_with("item:")).count(), 2);
    assert!(!executor.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_timeout_still_ends_cycle() {
    let mut job = RecordingJob::with_items(4);
    job.hanging.insert(3);
    let executor = Arc::new(
        CycleExecutor::new(
            job,
            CycleConfig {
                max_worker_threads: 4,
                drain_timeout: Duration::from_millis(150),
                idle_timeout: Duration::from_millis(500),
            },
        )
        .unwrap(),
    );

    let report = completed(executor.execute(CycleContext::default()).await.unwrap());

    assert!(report.drain_timed_out);
    assert_eq!(report.completed, 3);
    assert_eq!(report.abandoned, 1);
    assert!(!report.is_clean());
    assert_eq!(executor.job().end_calls.load(Ordering::SeqCst), 1);
    assert!(!executor.is_running());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        executor.job().cancelled_items.load(Ordering::SeqCst),
        1,
        "abandoned item should see its cancellation token fire"
    );

    // Abandoned items are not carried over; the next cycle takes a fresh snapshot
    let next = executor.execute(CycleContext::default()).await.unwrap();
    assert!(!next.is_skipped());
    assert_eq!(executor.job().snapshot_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stragglers_block_the_next_cycle_until_they_return() {
    // The item sleeps through its cancellation token
    let job = RecordingJob::with_items(1).work(Duration::from_millis(400));
    let executor = Arc::new(
        CycleExecutor::new(
            job,
            CycleConfig {
                max_worker_threads: 1,
                drain_timeout: Duration::from_millis(50),
                idle_timeout: Duration::from_millis(500),
            },
        )
        .unwrap(),
    );

    let first = completed(executor.execute(CycleContext::new("first")).await.unwrap());
    assert!(first.drain_timed_out);
    assert_eq!(first.abandoned, 1);
    assert!(!executor.is_running());
    assert_eq!(executor.items_in_flight(), 1);

    let second = executor.execute(CycleContext::new("second")).await.unwrap();
    assert!(second.is_skipped(), "straggler still running, trigger must be skipped");
    assert_eq!(executor.job().snapshot_calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.job().peak(), 1);

    tokio::time::timeout(Duration::from_secs(2), async {
        while executor.items_in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("straggler should eventually return");

    let third = executor.execute(CycleContext::new("third")).await.unwrap();
    assert!(!third.is_skipped());
    assert_eq!(executor.job().peak(), 1, "items of two cycles must never overlap");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_default_drain_timeout_does_not_cut_long_cycles() {
    // 12 items x 300ms over 3 workers is four waves, ~1.2s against a 1s drain timeout
    let job = RecordingJob::with_items(12).work(Duration::from_millis(300));
    let executor = Arc::new(
        CycleExecutor::new(
            job,
            CycleConfig {
                max_worker_threads: 3,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let report = completed(executor.execute(CycleContext::default()).await.unwrap());

    assert!(!report.drain_timed_out);
    assert_eq!(report.completed, 12);
    assert_eq!(report.abandoned, 0);
    assert!(report.elapsed_ms >= 1000);
    assert!(executor.job().peak() <= 3);
}

// ---------------------------------------------------------------------------
// Configuration and events
// ---------------------------------------------------------------------------

#[test]
fn test_invalid_config_rejected() {
    let result = CycleExecutor::new(
        RecordingJob::default(),
        CycleConfig {
            drain_timeout: Duration::ZERO,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_config_update_applies_to_next_cycle() {
    let executor = executor(
        RecordingJob::with_items(4).work(Duration::from_millis(50)),
        1,
    );

    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(CycleContext::default()).await })
    };
    wait_until_running(&executor).await;

    executor.update_config(config(4)).await.unwrap();
    assert_eq!(executor.config().await.max_worker_threads, 4);

    completed(running.await.unwrap().unwrap());
    assert_eq!(executor.job().peak(), 1, "running cycle keeps its settings");

    executor.job().reset_peak();
    completed(executor.execute(CycleContext::default()).await.unwrap());
    assert!(executor.job().peak() > 1, "next cycle uses the new bound");
}

#[tokio::test]
async fn test_update_config_rejects_invalid() {
    let executor = executor(RecordingJob::default(), 2);
    let bad = CycleConfig {
        idle_timeout: Duration::ZERO,
        ..Default::default()
    };
    assert!(executor.update_config(bad).await.is_err());
    assert_eq!(executor.config().await.max_worker_threads, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_describe_the_cycle() {
    let mut job = RecordingJob::with_items(3);
    job.failing.insert(1);
    let executor = executor(job, 2);
    let mut events = executor.subscribe();

    executor.execute(CycleContext::new("evt")).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(matches!(
        &received[0],
        CycleEvent::CycleStarted { cycle_id, trigger } if *cycle_id == CycleId(1) && trigger == "evt"
    ));
    assert!(matches!(
        &received[1],
        CycleEvent::Dispatching { items: 3, .. }
    ));
    assert!(received.iter().any(|e| matches!(
        e,
        CycleEvent::ItemFailed { index: 1, .. }
    )));
    match received.last().unwrap() {
        CycleEvent::CycleCompleted { report } => {
            assert_eq!(report.completed, 2);
            assert_eq!(report.failed, 1);
        }
        other => panic!("expected completion event, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_and_failure_events() {
    let job = RecordingJob::with_items(1).work(Duration::from_millis(200));
    let executor = executor(job, 1);
    let mut events = executor.subscribe();

    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(CycleContext::new("a")).await })
    };
    wait_until_running(&executor).await;
    executor.execute(CycleContext::new("b")).await.unwrap();
    running.await.unwrap().unwrap();

    executor.job().fail_snapshot.store(true, Ordering::SeqCst);
    executor.execute(CycleContext::new("c")).await.unwrap_err();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(received.iter().any(|e| matches!(
        e,
        CycleEvent::CycleSkipped { trigger } if trigger == "b"
    )));
    assert!(matches!(
        received.last().unwrap(),
        CycleEvent::CycleFailed { code, .. } if code == "snapshot_failed"
    ));
}
