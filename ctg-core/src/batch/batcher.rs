//! The ingest batcher: per-key accumulation, multi-trigger flush, and
//! bounded hand-off to a sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BatcherConfig;

use super::clock::Clock;
use super::types::{Batch, BatchKey, InvalidSample, Metric, OpenBatch, Point, RawSample, Sink};

/// Bound on the flush hand-off queue. A full queue drops the batch.
const FLUSH_QUEUE_CAPACITY: usize = 100;

/// Per-batch deadline for the downstream sink call.
const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on waiting for the flush queue to drain during shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Monotonic loss-visibility counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub received: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub out_of_order: u64,
}

/// Accumulates valid samples into one open batch per `(session, metric)`
/// and flushes on size, span, or wall-clock staleness.
///
/// All inter-task hand-off is bounded; on overflow the newest batch is
/// dropped and counted. See module docs for the loss model.
pub struct Batcher {
    cfg: BatcherConfig,
    clock: Arc<dyn Clock>,
    batches: Mutex<HashMap<BatchKey, OpenBatch>>,
    stats: Mutex<BatcherStats>,
    flush_tx: mpsc::Sender<Batch>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Batcher {
    /// Create the batcher and spawn its flush consumer and timer tasks.
    pub fn spawn(cfg: BatcherConfig, sink: Arc<dyn Sink>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let batcher = Arc::new(Self {
            cfg,
            clock,
            batches: Mutex::new(HashMap::new()),
            stats: Mutex::new(BatcherStats::default()),
            flush_tx,
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let consumer = tokio::spawn(flush_worker(flush_rx, sink, stop_rx.clone()));
        let timer = tokio::spawn(timer_flusher(Arc::clone(&batcher), stop_rx));
        batcher.tasks.lock().unwrap().extend([consumer, timer]);

        batcher
    }

    /// Validate and insert one sample.
    ///
    /// Invalid samples are counted and dropped; the stream always
    /// continues, so nothing is returned to the caller.
    pub fn add(&self, sample: &RawSample) {
        let metric = match validate(sample) {
            Ok(metric) => metric,
            Err(reason) => {
                self.bump(|stats| stats.dropped += 1);
                warn!(session = %sample.session_id, %reason, "invalid sample dropped");
                return;
            }
        };

        let key = BatchKey {
            session_id: sample.session_id.clone(),
            metric,
        };
        let point = Point {
            ts_ms: sample.ts_ms,
            value: sample.value,
        };

        let mut batches = self.batches.lock().unwrap();
        let open = batches
            .entry(key.clone())
            .or_insert_with(|| OpenBatch::new(key.clone()));

        if !open.points.is_empty() {
            // Age relative to the newest point already in the batch, not
            // wall clock: a dormant key judges staleness against itself.
            let age_ms = open.t1_ms as i64 - point.ts_ms as i64;

            if age_ms > self.cfg.drop_too_old_ms {
                self.bump(|stats| stats.dropped += 1);
                info!(
                    session = %key.session_id,
                    metric = key.metric.label(),
                    age_ms,
                    "sample too old, dropped"
                );
                return;
            }

            if age_ms > 0 {
                // Every late arrival is visible in the counter; the
                // tolerance only decides how loudly we say so.
                self.bump(|stats| stats.out_of_order += 1);
                if age_ms > self.cfg.out_of_order_tolerance_ms {
                    warn!(
                        session = %key.session_id,
                        metric = key.metric.label(),
                        age_ms,
                        "out-of-order sample beyond tolerance, accepted"
                    );
                } else {
                    debug!(
                        session = %key.session_id,
                        metric = key.metric.label(),
                        age_ms,
                        "out-of-order sample accepted"
                    );
                }
            }

            if open.span_with(point.ts_ms) > self.cfg.batch_max_span_ms {
                self.flush_locked(open);
            }
        }

        open.push(point);
        self.bump(|stats| stats.received += 1);

        if open.points.len() >= self.cfg.batch_max_samples {
            self.flush_locked(open);
        }
    }

    /// Snapshot of the loss-visibility counters.
    #[must_use]
    pub fn stats(&self) -> BatcherStats {
        *self.stats.lock().unwrap()
    }

    /// Flush everything, drain the hand-off queue, stop the tasks, and
    /// emit the final stats line.
    pub async fn stop(&self) {
        info!("stopping batcher");

        self.flush_open_batches();

        // Let the consumer work the queue down before tearing it out from
        // under it, within a bounded grace period.
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while self.flush_tx.capacity() < FLUSH_QUEUE_CAPACITY {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!("flush queue did not drain before shutdown grace elapsed");
        }

        let _ = self.stop_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            dropped = stats.dropped,
            flushed = stats.flushed,
            out_of_order = stats.out_of_order,
            "batcher stopped"
        );
    }

    fn flush_open_batches(&self) {
        let mut batches = self.batches.lock().unwrap();
        for open in batches.values_mut() {
            self.flush_locked(open);
        }
    }

    /// Flush stale batches against the wall clock. An idle key must not
    /// linger just because no new sample arrives to trigger it.
    fn flush_stale(&self) {
        let now_ms = self.clock.now_ms();
        let mut batches = self.batches.lock().unwrap();
        for open in batches.values_mut() {
            if !open.points.is_empty() && now_ms - open.last_added_ms > self.cfg.flush_interval_ms {
                self.flush_locked(open);
            }
        }
    }

    /// Clone the open batch onto the flush queue and reset it for reuse.
    /// Caller holds the batches lock.
    fn flush_locked(&self, open: &mut OpenBatch) {
        if open.points.is_empty() {
            return;
        }

        let batch = open.snapshot();
        open.reset();

        match self.flush_tx.try_send(batch) {
            Ok(()) => self.bump(|stats| stats.flushed += 1),
            Err(_) => {
                self.bump(|stats| stats.dropped += 1);
                warn!("flush queue full, batch dropped");
            }
        }
    }

    fn bump(&self, update: impl FnOnce(&mut BatcherStats)) {
        update(&mut self.stats.lock().unwrap());
    }
}

fn validate(sample: &RawSample) -> Result<Metric, InvalidSample> {
    if sample.session_id.is_empty() {
        return Err(InvalidSample::EmptySessionId);
    }
    let metric = sample.metric.ok_or(InvalidSample::UnknownMetric)?;
    if sample.ts_ms == 0 {
        return Err(InvalidSample::ZeroTimestamp);
    }
    if !sample.value.is_finite() {
        return Err(InvalidSample::NonFiniteValue(sample.value));
    }
    Ok(metric)
}

/// Dequeues flushed batches and feeds the sink, one batch at a time with
/// a per-batch deadline.
async fn flush_worker(
    mut flush_rx: mpsc::Receiver<Batch>,
    sink: Arc<dyn Sink>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = flush_rx.recv() => match maybe {
                Some(batch) => {
                    match tokio::time::timeout(SINK_TIMEOUT, sink.consume(batch)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(%err, "sink failed to consume batch"),
                        Err(_) => error!("sink call exceeded deadline"),
                    }
                }
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }
}

/// Periodically flushes batches that have gone stale by wall clock.
async fn timer_flusher(batcher: Arc<Batcher>, mut stop_rx: watch::Receiver<bool>) {
    let period = Duration::from_millis(batcher.cfg.flush_interval_ms.max(1) as u64);
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => batcher.flush_stale(),
            _ = stop_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::clock::ManualClock;
    use super::*;

    /// Collects every consumed batch for inspection.
    #[derive(Default)]
    struct CollectSink {
        batches: Mutex<Vec<Batch>>,
    }

    impl CollectSink {
        fn batches(&self) -> Vec<Batch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Sink for CollectSink {
        async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn config(max_samples: usize, max_span_ms: i64) -> BatcherConfig {
        BatcherConfig {
            batch_max_samples: max_samples,
            batch_max_span_ms: max_span_ms,
            flush_interval_ms: 500,
            out_of_order_tolerance_ms: 250,
            drop_too_old_ms: 30_000,
        }
    }

    fn fhr(ts_ms: u64, value: f32) -> RawSample {
        RawSample::new("s1", ts_ms, Metric::Fhr, value)
    }

    async fn settle() {
        // Paused-clock tests: yields until every task is idle.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_by_size() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let batcher = Batcher::spawn(config(3, 30_000), sink.clone(), clock);

        for (ts, value) in [(1000, 120.0), (1100, 121.0), (1200, 122.0), (1300, 123.0), (1400, 124.0)] {
            batcher.add(&fhr(ts, value));
        }
        settle().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.t0_ms, 1000);
        assert_eq!(batch.t1_ms, 1200);
        let values: Vec<f32> = batch.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![120.0, 121.0, 122.0]);

        // Two points remain open for the next flush.
        let stats = batcher.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.flushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_next_insert_would_exceed_span() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let batcher = Batcher::spawn(config(100, 1000), sink.clone(), clock);

        for (ts, value) in [(1000, 120.0), (1500, 121.0), (2100, 122.0)] {
            batcher.add(&fhr(ts, value));
        }
        settle().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].points.len(), 2);
        assert_eq!(batches[0].span_ms(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_within_tolerance_is_counted_and_kept() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let cfg = BatcherConfig {
            out_of_order_tolerance_ms: 500,
            ..config(100, 30_000)
        };
        let batcher = Batcher::spawn(cfg, sink.clone(), clock);

        for (ts, value) in [(1000, 120.0), (1500, 121.0), (1200, 122.0)] {
            batcher.add(&fhr(ts, value));
        }
        // 1200 arrives 300 ms behind the head: counted, still accepted.
        assert_eq!(batcher.stats().out_of_order, 1);
        assert_eq!(batcher.stats().received, 3);

        batcher.stop().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let values: Vec<f32> = batches[0].points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![120.0, 121.0, 122.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_samples_older_than_the_cutoff() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let cfg = BatcherConfig {
            drop_too_old_ms: 2000,
            out_of_order_tolerance_ms: 500,
            ..config(100, 30_000)
        };
        let batcher = Batcher::spawn(cfg, sink.clone(), clock);

        batcher.add(&fhr(5000, 120.0));
        batcher.add(&fhr(6000, 121.0));
        batcher.add(&fhr(1000, 122.0)); // 5000 ms behind the head

        let stats = batcher.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);

        batcher.stop().await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let values: Vec<f32> = batches[0].points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![120.0, 121.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_an_idle_batch() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let cfg = BatcherConfig {
            flush_interval_ms: 100,
            ..config(100, 30_000)
        };
        let batcher = Batcher::spawn(cfg, sink.clone(), Arc::clone(&clock) as Arc<dyn Clock>);

        batcher.add(&fhr(1000, 120.0));

        // No further samples arrive; wall clock moves past the interval.
        clock.set(1300);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].points.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_batch_independently_per_metric() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let batcher = Batcher::spawn(config(2, 30_000), sink.clone(), clock);

        batcher.add(&RawSample::new("s1", 1000, Metric::Fhr, 120.0));
        batcher.add(&RawSample::new("s1", 1100, Metric::Uc, 50.0));
        batcher.add(&RawSample::new("s1", 1200, Metric::Fhr, 121.0));
        batcher.add(&RawSample::new("s1", 1300, Metric::Uc, 51.0));
        settle().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().any(|b| b.key.metric == Metric::Fhr));
        assert!(batches.iter().any(|b| b.key.metric == Metric::Uc));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_samples_are_counted_not_batched() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let batcher = Batcher::spawn(config(100, 30_000), sink.clone(), clock);

        batcher.add(&RawSample {
            session_id: String::new(),
            ts_ms: 1000,
            metric: Some(Metric::Fhr),
            value: 120.0,
        });
        batcher.add(&RawSample {
            session_id: "s1".to_string(),
            ts_ms: 1000,
            metric: None,
            value: 120.0,
        });
        batcher.add(&fhr(0, 120.0));
        batcher.add(&fhr(1000, f32::NAN));
        batcher.add(&fhr(1000, f32::INFINITY));

        let stats = batcher.stats();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.dropped, 5);

        batcher.stop().await;
        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_open_batches_and_reports_totals() {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(ManualClock::new(1000));
        let batcher = Batcher::spawn(config(100, 30_000), sink.clone(), clock);

        batcher.add(&fhr(1000, 120.0));
        batcher.add(&fhr(1100, 121.0));
        batcher.stop().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].points.len(), 2);

        let stats = batcher.stats();
        // received == flushed points + dropped + points still open (none).
        assert_eq!(stats.received, 2);
        assert_eq!(stats.flushed, 1);
        assert_eq!(stats.dropped, 0);
    }
}
