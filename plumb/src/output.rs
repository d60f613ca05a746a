//! Outputs: sinks and the runners that feed them.
//!
//! A [`Sink`] consumes metrics. Each configured sink is owned by an
//! [`OutputRunner`], which filters and renames metrics on their way in,
//! holds them in a bounded [`Buffer`] and writes them to the sink in batches.
//! A failed write returns its batch to the front of the buffer. Retrying is
//! the caller's business: the scheduler simply writes again on the next flush.
//!
//! ## Metrics
//!
//! `metrics_added`: Metrics admitted to the buffer
//! `metrics_filtered`: Metrics rejected by the filter
//! `metrics_dropped`: Metrics lost to buffer overflow
//! `metrics_written`: Metrics accepted by the sink
//! `write_errors`: Failed sink writes
//! `buffer_size`: Metrics currently buffered
//! `buffer_limit`: Buffer capacity
//! `write_time_ns`: Duration of the last write
//!

use std::{
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use plumb_metric::Metric;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::{
    buffer::{Batch, Buffer},
    error::{BoxError, ErrorKind},
    filter::Filter,
    rename::Rename,
};

pub mod discard;
pub mod file;

/// Errors produced by [`OutputRunner`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sink could not be connected.
    #[error("failed to connect output {name}: {source}")]
    Connect {
        /// Output name
        name: String,
        /// Sink error
        #[source]
        source: BoxError,
    },
    /// The sink rejected a batch.
    #[error("failed to write to output {name}: {source}")]
    Write {
        /// Output name
        name: String,
        /// Sink error
        #[source]
        source: BoxError,
    },
    /// The sink failed to close.
    #[error("failed to close output {name}: {source}")]
    Close {
        /// Output name
        name: String,
        /// Sink error
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connect { .. } => ErrorKind::FatalConfig,
            Error::Write { .. } | Error::Close { .. } => ErrorKind::TransientWrite,
        }
    }
}

#[async_trait]
/// A consumer of metrics.
///
/// Writes may be retried after a failure, so a sink must tolerate seeing a
/// metric more than once. A sink must not keep references to the slice it is
/// handed.
pub trait Sink: Send {
    /// Prepare the sink. Called once before the first write.
    async fn connect(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Write `metrics`, oldest first.
    async fn write(&mut self, metrics: &[Metric]) -> Result<(), BoxError>;

    /// Release the sink. Called once after the last write.
    async fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// The largest batch this sink accepts, if it has a limit. Read once,
    /// when the runner is built.
    fn max_batch_size(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone)]
/// How an [`OutputRunner`] treats its metrics.
pub struct Settings {
    /// The plugin name
    pub name: String,
    /// The ID assigned to this output
    pub id: Option<String>,
    /// Maximum metrics per sink write
    pub metric_batch_size: usize,
    /// Maximum metrics buffered
    pub metric_buffer_limit: usize,
    /// Name transforms applied to admitted metrics
    pub rename: Rename,
    /// Selection and trimming of admitted metrics
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What became of a metric handed to [`OutputRunner::add_metric`].
pub enum Admission {
    /// Buffered, with the given number of older metrics dropped to make room.
    Buffered {
        /// Metrics dropped by overflow
        dropped: u64,
    },
    /// Rejected by the filter.
    Filtered,
}

impl Admission {
    /// Classify the outcome, if it was not a clean admission.
    #[must_use]
    pub fn kind(self) -> Option<ErrorKind> {
        match self {
            Admission::Buffered { dropped: 0 } => None,
            Admission::Buffered { .. } => Some(ErrorKind::Overflow),
            Admission::Filtered => Some(ErrorKind::FilterReject),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    added: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    errors: AtomicU64,
    buffer_size: AtomicU64,
    write_time_ns: AtomicU64,
    /// Drops already reported by [`OutputRunner::report_overflow`].
    reported_drops: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A snapshot of an [`OutputRunner`]'s internal statistics.
pub struct Stats {
    /// Metrics admitted to the buffer
    pub added: u64,
    /// Metrics rejected by the filter
    pub filtered: u64,
    /// Metrics lost to buffer overflow
    pub dropped: u64,
    /// Metrics accepted by the sink
    pub written: u64,
    /// Failed sink writes
    pub errors: u64,
    /// Metrics currently buffered
    pub buffer_size: u64,
    /// Buffer capacity
    pub buffer_limit: u64,
    /// Duration of the last write
    pub write_time: Duration,
}

/// Couples one sink to its buffer.
pub struct OutputRunner {
    name: String,
    id: Option<String>,
    labels: Vec<(String, String)>,
    rename: Rename,
    filter: Filter,
    batch_size: usize,
    buffer_limit: usize,
    buffer: Mutex<Buffer>,
    sink: AsyncMutex<Box<dyn Sink>>,
    batch_ready: Notify,
    counters: Counters,
}

impl std::fmt::Debug for OutputRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRunner")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("batch_size", &self.batch_size)
            .field("buffer_limit", &self.buffer_limit)
            .finish_non_exhaustive()
    }
}

impl OutputRunner {
    /// Create a runner writing to `sink`.
    ///
    /// The batch size is the smaller of the configured size and the sink's
    /// own limit, and at least one.
    #[must_use]
    pub fn new(settings: Settings, sink: Box<dyn Sink>) -> Self {
        let mut batch_size = settings.metric_batch_size;
        if let Some(limit) = sink.max_batch_size() {
            batch_size = batch_size.min(limit);
        }
        let batch_size = batch_size.max(1);

        let mut labels = vec![
            ("component".to_string(), "output".to_string()),
            ("component_name".to_string(), settings.name.clone()),
        ];
        if let Some(id) = &settings.id {
            labels.push(("id".to_string(), id.clone()));
        }

        let buffer = Buffer::new(settings.metric_buffer_limit);
        let buffer_limit = buffer.capacity();
        gauge!("buffer_limit", &labels).set(buffer_limit as f64);

        Self {
            name: settings.name,
            id: settings.id,
            labels,
            rename: settings.rename,
            filter: settings.filter,
            batch_size,
            buffer_limit,
            buffer: Mutex::new(buffer),
            sink: AsyncMutex::new(sink),
            batch_ready: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// The plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured ID, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The effective batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Filter, rename and buffer `metric`.
    ///
    /// Wakes [`OutputRunner::batch_ready`] waiters whenever the buffer reaches
    /// a multiple of the batch size.
    pub fn add_metric(&self, metric: Metric) -> Admission {
        let Some(mut metric) = self.filter.apply(metric) else {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            counter!("metrics_filtered", &self.labels).increment(1);
            return Admission::Filtered;
        };
        self.rename.apply(&mut metric);

        let (dropped, len) = {
            let mut buffer = self.buffer();
            let dropped = buffer.add(metric);
            self.counters
                .dropped
                .fetch_max(buffer.dropped(), Ordering::Relaxed);
            (dropped, buffer.len())
        };

        self.counters.added.fetch_add(1, Ordering::Relaxed);
        counter!("metrics_added", &self.labels).increment(1);
        if dropped > 0 {
            counter!("metrics_dropped", &self.labels).increment(dropped);
        }
        self.set_buffer_size(len);

        if len % self.batch_size == 0 {
            self.batch_ready.notify_one();
        }
        Admission::Buffered { dropped }
    }

    /// Wait until [`OutputRunner::add_metric`] fills a batch.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await;
    }

    /// Connect the sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the sink fails to connect.
    pub async fn connect(&self) -> Result<(), Error> {
        self.sink
            .lock()
            .await
            .connect()
            .await
            .map_err(|source| Error::Connect {
                name: self.name.clone(),
                source,
            })
    }

    /// Write everything buffered when called, one batch at a time.
    ///
    /// Stops at the first failed batch, which returns to the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] carrying the sink's error unchanged.
    pub async fn write(&self) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        let mut remaining = self.buffer().len();
        while remaining > 0 {
            let batch = self.buffer().batch(self.batch_size.min(remaining));
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());
            self.send(&mut **sink, batch).await?;
        }
        Ok(())
    }

    /// Write a single batch, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] carrying the sink's error unchanged.
    pub async fn write_batch(&self) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        let batch = self.buffer().batch(self.batch_size);
        if batch.is_empty() {
            return Ok(());
        }
        self.send(&mut **sink, batch).await
    }

    async fn send(&self, sink: &mut dyn Sink, batch: Batch) -> Result<(), Error> {
        let count = batch.len() as u64;
        let start = Instant::now();
        let result = sink.write(batch.metrics()).await;
        let elapsed = start.elapsed();

        let write_time_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.counters
            .write_time_ns
            .store(write_time_ns, Ordering::Relaxed);
        gauge!("write_time_ns", &self.labels).set(write_time_ns as f64);

        let (evicted, len) = {
            let mut buffer = self.buffer();
            let before = buffer.dropped();
            if result.is_ok() {
                buffer.accept(batch);
            } else {
                // Returning the batch may push newer arrivals out.
                buffer.reject(batch);
            }
            self.counters
                .dropped
                .fetch_max(buffer.dropped(), Ordering::Relaxed);
            (buffer.dropped() - before, buffer.len())
        };
        if evicted > 0 {
            counter!("metrics_dropped", &self.labels).increment(evicted);
        }
        self.set_buffer_size(len);

        match result {
            Ok(()) => {
                self.counters.written.fetch_add(count, Ordering::Relaxed);
                counter!("metrics_written", &self.labels).increment(count);
                debug!(
                    output = self.name,
                    count,
                    elapsed_ms = elapsed.as_millis(),
                    "wrote batch"
                );
                Ok(())
            }
            Err(source) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                counter!("write_errors", &self.labels).increment(1);
                warn!(output = self.name, count, "write failed: {source}");
                Err(Error::Write {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Close the sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Close`] if the sink fails to close.
    pub async fn close(&self) -> Result<(), Error> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|source| Error::Close {
                name: self.name.clone(),
                source,
            })
    }

    /// Warn once about overflow drops seen since the previous call.
    ///
    /// Returns the number of new drops.
    pub fn report_overflow(&self) -> u64 {
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        let reported = self.counters.reported_drops.swap(dropped, Ordering::Relaxed);
        let fresh = dropped.saturating_sub(reported);
        if fresh > 0 {
            warn!(
                output = self.name,
                dropped = fresh,
                total = dropped,
                limit = self.buffer_limit,
                "metric buffer overflow, oldest metrics dropped"
            );
        }
        fresh
    }

    fn set_buffer_size(&self, len: usize) {
        self.counters
            .buffer_size
            .store(len as u64, Ordering::Relaxed);
        gauge!("buffer_size", &self.labels).set(len as f64);
    }

    /// A snapshot of this runner's statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            added: c.added.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            buffer_size: c.buffer_size.load(Ordering::Relaxed),
            buffer_limit: self.buffer_limit as u64,
            write_time: Duration::from_nanos(c.write_time_ns.load(Ordering::Relaxed)),
        }
    }
}


#[cfg(test)]
mod tests {
    use metrics::Key;
    use metrics_util::{
        CompositeKey, MetricKind,
        debugging::{DebugValue, DebuggingRecorder},
    };
    use rustc_hash::FxHashMap;

    use super::{test::*, *};
    use crate::filter;

    fn runner(sink: &MockSink, batch: usize, limit: usize) -> OutputRunner {
        OutputRunner::new(settings(batch, limit), Box::new(sink.clone()))
    }

    #[tokio::test]
    async fn retry_after_one_failure_keeps_order() {
        let sink = MockSink::default();
        let runner = runner(&sink, 10, 100);
        for v in 1..=5 {
            runner.add_metric(metric("metric", v));
        }

        sink.fail_next(1);
        let err = runner.write().await.expect_err("write should fail");
        assert_eq!(err.kind(), ErrorKind::TransientWrite);
        assert!(sink.written().is_empty());

        runner.write().await.expect("write should succeed");
        assert_eq!(values(&sink.written()), [1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn retry_across_interleaved_adds_keeps_order() {
        let sink = MockSink::default();
        let runner = runner(&sink, 5, 100);

        let mut next = 1;
        for _ in 0..3 {
            for _ in 0..5 {
                runner.add_metric(metric("metric", next));
                next += 1;
            }
            sink.fail_next(1);
            runner.write().await.expect_err("write should fail");
        }
        for _ in 0..5 {
            runner.add_metric(metric("metric", next));
            next += 1;
        }
        runner.write().await.expect("write should succeed");

        assert_eq!(values(&sink.written()), (1..=20).collect::<Vec<_>>());
        assert_eq!(sink.batches(), [5, 5, 5, 5]);
        let stats = runner.stats();
        assert_eq!(stats.written, 20);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.buffer_size, 0);
    }

    #[tokio::test]
    async fn failed_write_after_single_batch_keeps_order() {
        let sink = MockSink::default();
        let runner = runner(&sink, 2, 100);
        for v in 1..=6 {
            runner.add_metric(metric("metric", v));
        }

        runner.write_batch().await.expect("one batch");
        assert_eq!(values(&sink.written()), [1, 2]);
        assert_eq!(runner.stats().buffer_size, 4);

        sink.fail_next(1);
        runner.write().await.expect_err("write should fail");
        assert_eq!(runner.stats().buffer_size, 4);

        for v in 7..=8 {
            runner.add_metric(metric("metric", v));
        }
        runner.write().await.expect("write should succeed");
        assert_eq!(values(&sink.written()), (1..=8).collect::<Vec<_>>());
        assert_eq!(sink.batches(), [2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_is_reported_once() {
        let sink = MockSink::default();
        let runner = runner(&sink, 10, 5);
        let mut dropped = 0;
        for v in 1..=8 {
            if let Admission::Buffered { dropped: d } = runner.add_metric(metric("metric", v)) {
                dropped += d;
            }
        }
        assert_eq!(dropped, 3);
        assert_eq!(runner.report_overflow(), 3);
        assert_eq!(runner.report_overflow(), 0);

        runner.write().await.expect("write should succeed");
        assert_eq!(values(&sink.written()), [4, 5, 6, 7, 8]);
        assert_eq!(runner.stats().dropped, 3);
    }

    #[tokio::test]
    async fn sink_limit_caps_batch_size() {
        let sink = MockSink {
            max_batch: Some(3),
            ..MockSink::default()
        };
        let runner = runner(&sink, 10, 100);
        assert_eq!(runner.batch_size(), 3);

        for v in 1..=7 {
            runner.add_metric(metric("metric", v));
        }
        runner.write().await.expect("write should succeed");
        assert_eq!(sink.batches(), [3, 3, 1]);
    }

    #[tokio::test]
    async fn filtered_metrics_are_counted_not_buffered() {
        let sink = MockSink::default();
        let config = filter::Config {
            name_drop: vec!["debug_*".to_string()],
            ..filter::Config::default()
        };
        let mut settings = settings(10, 100);
        settings.filter = Filter::new(&config).expect("valid filter");
        settings.rename = Rename::new(Some("X".to_string()), Some("pre_".to_string()), None);
        let runner = OutputRunner::new(settings, Box::new(sink.clone()));

        assert_eq!(
            runner.add_metric(metric("debug_trace", 1)),
            Admission::Filtered
        );
        assert_eq!(
            Admission::Filtered.kind(),
            Some(ErrorKind::FilterReject)
        );
        runner.add_metric(metric("m", 2));
        runner.write().await.expect("write should succeed");

        let written = sink.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].name(), "X");
        let stats = runner.stats();
        assert_eq!((stats.added, stats.filtered, stats.written), (1, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_wakes_the_flusher() {
        let sink = MockSink::default();
        let runner = runner(&sink, 3, 100);
        runner.add_metric(metric("metric", 1));
        runner.add_metric(metric("metric", 2));

        let not_yet =
            tokio::time::timeout(Duration::from_millis(10), runner.batch_ready()).await;
        assert!(not_yet.is_err());

        runner.add_metric(metric("metric", 3));
        tokio::time::timeout(Duration::from_millis(10), runner.batch_ready())
            .await
            .expect("batch ready");
    }

    #[tokio::test]
    async fn connect_and_close_reach_the_sink() {
        let sink = MockSink::default();
        let runner = runner(&sink, 3, 100);
        runner.connect().await.expect("connects");
        runner.close().await.expect("closes");
        let shared = sink.shared.lock().unwrap();
        assert!(shared.connected && shared.closed);
    }

    #[test]
    fn statistics_are_exported() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let sink = MockSink::default();

        metrics::with_local_recorder(&recorder, || {
            let runner = OutputRunner::new(
                Settings {
                    id: Some("primary".to_string()),
                    ..settings(10, 2)
                },
                Box::new(sink.clone()),
            );
            for v in 1..=3 {
                runner.add_metric(metric("metric", v));
            }
        });

        let snapshot: FxHashMap<CompositeKey, DebugValue> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key, value))
            .collect();
        let labels = vec![
            metrics::Label::new("component", "output"),
            metrics::Label::new("component_name", "mock"),
            metrics::Label::new("id", "primary"),
        ];
        let get = |kind, name: &'static str| {
            snapshot
                .get(&CompositeKey::new(kind, Key::from_parts(name, labels.clone())))
                .map(|value| match value {
                    DebugValue::Counter(v) => DebugValue::Counter(*v),
                    DebugValue::Gauge(v) => DebugValue::Gauge(*v),
                    DebugValue::Histogram(v) => DebugValue::Histogram(v.clone()),
                })
        };

        assert_eq!(get(MetricKind::Counter, "metrics_added"), Some(DebugValue::Counter(3)));
        assert_eq!(get(MetricKind::Counter, "metrics_dropped"), Some(DebugValue::Counter(1)));
        assert!(matches!(
            get(MetricKind::Gauge, "buffer_size"),
            Some(DebugValue::Gauge(size)) if size.into_inner() == 2.0
        ));
    }
}
