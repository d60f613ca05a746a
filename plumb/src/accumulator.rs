//! The accumulator every source writes through.
//!
//! An [`Accumulator`] turns raw measurements into [`Metric`] instances, stamps
//! them with a truncated timestamp, passes them through the owner's
//! [`MetricMaker`] and sends them down a bounded channel. It is cheap to clone
//! and every clone feeds the same channel, so a source may hand clones to its
//! own workers. Metrics sent through a single clone arrive in send order.

use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use plumb_metric::{FieldValue, Metric, MetricKind, Timestamp};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BoxError;

/// Finishes a metric on its way out of an [`Accumulator`].
///
/// Returning `None` drops the metric.
pub trait MetricMaker: Send + Sync {
    /// Rename, tag or filter `metric`.
    fn make_metric(&self, metric: Metric) -> Option<Metric>;
}

/// The default timestamp precision for a gather interval: the time unit
/// (s, ms, us or ns) of the same order as `interval`, never coarser than one
/// second.
#[must_use]
pub fn default_precision(interval: Duration) -> Duration {
    const UNITS: [Duration; 3] = [
        Duration::from_secs(1),
        Duration::from_millis(1),
        Duration::from_micros(1),
    ];
    if interval.is_zero() {
        return UNITS[0];
    }
    UNITS
        .into_iter()
        .find(|unit| interval >= *unit)
        .unwrap_or(Duration::from_nanos(1))
}

/// The ingestion point of a single source.
#[derive(Clone)]
pub struct Accumulator {
    sender: mpsc::Sender<Metric>,
    precision: Duration,
    maker: Option<Arc<dyn MetricMaker>>,
    errors: Arc<Mutex<Vec<BoxError>>>,
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("precision", &self.precision)
            .field("maker", &self.maker.is_some())
            .finish_non_exhaustive()
    }
}

impl Accumulator {
    /// Create an accumulator sending into `sender` with nanosecond precision
    /// and no maker.
    #[must_use]
    pub fn new(sender: mpsc::Sender<Metric>) -> Self {
        Self {
            sender,
            precision: Duration::from_nanos(1),
            maker: None,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Route every metric through `maker` before sending.
    #[must_use]
    pub fn with_maker(mut self, maker: Arc<dyn MetricMaker>) -> Self {
        self.maker = Some(maker);
        self
    }

    /// Builder form of [`Accumulator::set_precision`].
    #[must_use]
    pub fn with_precision(mut self, precision: Duration) -> Self {
        self.set_precision(precision);
        self
    }

    /// Truncate timestamps of metrics built here to multiples of `precision`.
    ///
    /// Precision is clamped between one nanosecond and one second.
    pub fn set_precision(&mut self, precision: Duration) {
        self.precision = precision.clamp(Duration::from_nanos(1), Duration::from_secs(1));
    }

    /// The timestamp precision in effect.
    #[must_use]
    pub fn precision(&self) -> Duration {
        self.precision
    }

    /// Build and send an untyped metric.
    ///
    /// A missing timestamp means now. A measurement that cannot form a metric,
    /// an empty name or no fields, is recorded through
    /// [`Accumulator::add_error`] instead.
    pub async fn add_fields<F, T>(
        &self,
        measurement: &str,
        fields: F,
        tags: T,
        timestamp: Option<Timestamp>,
    ) where
        F: IntoIterator<Item = (String, FieldValue)>,
        T: IntoIterator<Item = (String, String)>,
    {
        self.add_typed(measurement, fields, tags, timestamp, MetricKind::Untyped)
            .await;
    }

    /// As [`Accumulator::add_fields`], typed as a gauge.
    pub async fn add_gauge<F, T>(
        &self,
        measurement: &str,
        fields: F,
        tags: T,
        timestamp: Option<Timestamp>,
    ) where
        F: IntoIterator<Item = (String, FieldValue)>,
        T: IntoIterator<Item = (String, String)>,
    {
        self.add_typed(measurement, fields, tags, timestamp, MetricKind::Gauge)
            .await;
    }

    /// As [`Accumulator::add_fields`], typed as a counter.
    pub async fn add_counter<F, T>(
        &self,
        measurement: &str,
        fields: F,
        tags: T,
        timestamp: Option<Timestamp>,
    ) where
        F: IntoIterator<Item = (String, FieldValue)>,
        T: IntoIterator<Item = (String, String)>,
    {
        self.add_typed(measurement, fields, tags, timestamp, MetricKind::Counter)
            .await;
    }

    /// As [`Accumulator::add_fields`], typed as a summary.
    pub async fn add_summary<F, T>(
        &self,
        measurement: &str,
        fields: F,
        tags: T,
        timestamp: Option<Timestamp>,
    ) where
        F: IntoIterator<Item = (String, FieldValue)>,
        T: IntoIterator<Item = (String, String)>,
    {
        self.add_typed(measurement, fields, tags, timestamp, MetricKind::Summary)
            .await;
    }

    /// As [`Accumulator::add_fields`], typed as a histogram.
    pub async fn add_histogram<F, T>(
        &self,
        measurement: &str,
        fields: F,
        tags: T,
        timestamp: Option<Timestamp>,
    ) where
        F: IntoIterator<Item = (String, FieldValue)>,
        T: IntoIterator<Item = (String, String)>,
    {
        self.add_typed(measurement, fields, tags, timestamp, MetricKind::Histogram)
            .await;
    }

    async fn add_typed<F, T>(
        &self,
        measurement: &str,
        fields: F,
        tags: T,
        timestamp: Option<Timestamp>,
        kind: MetricKind,
    ) where
        F: IntoIterator<Item = (String, FieldValue)>,
        T: IntoIterator<Item = (String, String)>,
    {
        let timestamp = timestamp
            .unwrap_or_else(Timestamp::now)
            .truncate(self.precision);
        match Metric::new(measurement, fields, timestamp) {
            Ok(metric) => {
                self.add_metric(metric.with_tags(tags).with_kind(kind))
                    .await;
            }
            Err(err) => self.add_error(Box::new(err)),
        }
    }

    /// Send an already built metric. Its timestamp is kept as is.
    pub async fn add_metric(&self, metric: Metric) {
        let metric = match &self.maker {
            Some(maker) => match maker.make_metric(metric) {
                Some(metric) => metric,
                None => return,
            },
            None => metric,
        };
        if self.sender.send(metric).await.is_err() {
            debug!("accumulator receiver closed, metric discarded");
        }
    }

    /// Record a non-fatal error against the current gather.
    pub fn add_error(&self, error: BoxError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    /// Remove and return every error recorded so far, across all clones.
    #[must_use]
    pub fn take_errors(&self) -> Vec<BoxError> {
        mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, i64)]) -> Vec<(String, FieldValue)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), FieldValue::Int(*v)))
            .collect()
    }

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    struct Prefixer;

    impl MetricMaker for Prefixer {
        fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
            if metric.name() == "skip" {
                return None;
            }
            metric.add_prefix("src_");
            Some(metric)
        }
    }

    #[test]
    fn default_precision_tracks_interval() {
        assert_eq!(default_precision(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(default_precision(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(
            default_precision(Duration::from_millis(250)),
            Duration::from_millis(1)
        );
        assert_eq!(
            default_precision(Duration::from_millis(1)),
            Duration::from_millis(1)
        );
        assert_eq!(
            default_precision(Duration::from_micros(999)),
            Duration::from_micros(1)
        );
        assert_eq!(
            default_precision(Duration::from_micros(7)),
            Duration::from_micros(1)
        );
        assert_eq!(
            default_precision(Duration::from_nanos(500)),
            Duration::from_nanos(1)
        );
    }

    #[tokio::test]
    async fn timestamps_are_truncated_to_precision() {
        let (tx, mut rx) = mpsc::channel(8);
        let acc = Accumulator::new(tx).with_precision(Duration::from_secs(1));

        acc.add_gauge(
            "cpu",
            fields(&[("v", 1)]),
            tags(&[("host", "a")]),
            Some(Timestamp::from_nanos(5_999_999_999)),
        )
        .await;

        let metric = rx.recv().await.expect("metric sent");
        assert_eq!(metric.timestamp(), Timestamp::from_secs(5));
        assert_eq!(metric.kind(), MetricKind::Gauge);
        assert_eq!(metric.tag("host"), Some("a"));
    }

    #[tokio::test]
    async fn missing_timestamp_means_now() {
        let (tx, mut rx) = mpsc::channel(8);
        let acc = Accumulator::new(tx);
        let before = Timestamp::now();
        acc.add_fields("m", fields(&[("v", 1)]), tags(&[]), None).await;
        let after = Timestamp::now();

        let metric = rx.recv().await.expect("metric sent");
        assert!(metric.timestamp() >= before && metric.timestamp() <= after);
    }

    #[tokio::test]
    async fn precision_is_clamped() {
        let (tx, _rx) = mpsc::channel(1);
        let mut acc = Accumulator::new(tx).with_precision(Duration::from_secs(60));
        assert_eq!(acc.precision(), Duration::from_secs(1));
        acc.set_precision(Duration::ZERO);
        assert_eq!(acc.precision(), Duration::from_nanos(1));
    }

    #[tokio::test]
    async fn maker_renames_and_drops() {
        let (tx, mut rx) = mpsc::channel(8);
        let acc = Accumulator::new(tx).with_maker(Arc::new(Prefixer));

        acc.add_counter("skip", fields(&[("v", 1)]), tags(&[]), None)
            .await;
        acc.add_counter("kept", fields(&[("v", 2)]), tags(&[]), None)
            .await;
        drop(acc);

        let metric = rx.recv().await.expect("metric sent");
        assert_eq!(metric.name(), "src_kept");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_measurements_become_errors() {
        let (tx, mut rx) = mpsc::channel(8);
        let acc = Accumulator::new(tx);
        let worker = acc.clone();

        worker.add_fields("", fields(&[("v", 1)]), tags(&[]), None).await;
        acc.add_summary("m", fields(&[]), tags(&[]), None).await;
        acc.add_error("source timed out".into());

        let errors = acc.take_errors();
        assert_eq!(errors.len(), 3);
        assert!(acc.take_errors().is_empty());

        drop((acc, worker));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_one_ordered_channel() {
        let (tx, mut rx) = mpsc::channel(64);
        let acc = Accumulator::new(tx);
        let worker = acc.clone();
        let handle = tokio::spawn(async move {
            for v in 0..10 {
                worker
                    .add_histogram("w", fields(&[("v", v)]), tags(&[]), None)
                    .await;
            }
        });
        handle.await.expect("worker panicked");
        drop(acc);

        let mut seen = Vec::new();
        while let Some(metric) = rx.recv().await {
            seen.push(metric.field("v").cloned());
        }
        let expected: Vec<_> = (0..10).map(|v| Some(FieldValue::Int(v))).collect();
        assert_eq!(seen, expected);
    }
}
