//! Test jobs used by the scenario tests

use async_trait::async_trait;
use cycle_runner::{CycleContext, CycleJob, Error, Result};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Job that "extracts" a list of feed URLs
///
/// Records hook calls, processed URLs and the highest number of concurrent
/// `process_item` invocations it observed.
pub struct FeedJob {
    feeds: Vec<String>,
    latency: Duration,
    broken: HashSet<String>,
    pub starts: AtomicUsize,
    pub snapshots: AtomicUsize,
    pub ends: AtomicUsize,
    pub processed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    /// Number of `process_item` calls that were running when `on_end` started
    pub in_flight_at_end: AtomicUsize,
}

impl FeedJob {
    /// Job over `count` feeds that each take `latency` to process
    pub fn new(count: usize, latency: Duration) -> Self {
        Self {
            feeds: (0..count)
                .map(|n| format!("https://feeds.example.com/{n}.xml"))
                .collect(),
            latency,
            broken: HashSet::new(),
            starts: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
            processed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            in_flight_at_end: AtomicUsize::new(0),
        }
    }

    /// Mark the feed at `index` as failing extraction
    pub fn with_broken_feed(mut self, index: usize) -> Self {
        self.broken.insert(self.feeds[index].clone());
        self
    }

    /// Highest concurrency observed so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of feeds processed successfully
    pub fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }
}

#[async_trait]
impl CycleJob for FeedJob {
    type Item = String;

    async fn on_start(&self, _ctx: &CycleContext) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<String>> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(self.feeds.clone())
    }

    async fn process_item(&self, url: String, cancel: CancellationToken) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = tokio::select! {
            _ = tokio::time::sleep(self.latency) => {
                if self.broken.contains(&url) {
                    Err(Error::job(format!("no items matched in {url}")))
                } else {
                    self.processed.lock().unwrap().push(url);
                    Ok(())
                }
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn on_end(&self) -> Result<()> {
        self.in_flight_at_end
            .store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "feed-job"
    }
}
