//! Windowed aggregation.
//!
//! An [`Aggregator`] folds the metrics of one period into derived metrics. A
//! [`RunningAggregator`] owns one, along with the period it is currently
//! collecting: metrics stamped inside `[start - grace, end + delay)` are
//! handed to the aggregator, others are counted as dropped. Once the clock
//! passes `end + delay` the aggregator is pushed and reset, and the window
//! moves forward by one period.
//!
//! All configured aggregators share one stage task sitting between the
//! processors and the outputs. Originals pass through the stage unless an
//! aggregator that saw them asks for them to be dropped.
//!
//! ## Metrics
//!
//! `metrics_aggregated`: Metrics handed to the aggregator
//! `metrics_filtered`: Metrics rejected by the filter
//! `metrics_dropped`: Metrics stamped outside the current window
//! `metrics_pushed`: Metrics emitted by the aggregator
//!

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use metrics::counter;
use plumb_metric::{Metric, Timestamp};
use plumb_tick::Clock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{accumulator::Accumulator, filter::Filter, rename::Rename};

pub mod final_value;
pub mod merge;

/// Errors produced by [`RunningAggregator`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The aggregation period was zero.
    #[error("aggregation period must be greater than zero")]
    ZeroPeriod,
}

/// Accumulates metrics across a window and derives new ones from them.
pub trait Aggregator: Send {
    /// Observe `metric`.
    fn add(&mut self, metric: &Metric);

    /// Emit the derived metrics. `now` is the wall-clock time of the push.
    fn push(&mut self, now: Timestamp) -> Vec<Metric>;

    /// Forget the state of the window just pushed. Aggregators that retain
    /// state across windows keep it here.
    fn reset(&mut self);
}

#[derive(Debug, Clone)]
/// How a [`RunningAggregator`] treats its metrics.
pub struct Settings {
    /// The plugin name
    pub name: String,
    /// The ID assigned to this aggregator
    pub id: Option<String>,
    /// Length of a window
    pub period: Duration,
    /// Time past the end of a window still accepted before pushing
    pub delay: Duration,
    /// Time before the start of a window still accepted
    pub grace: Duration,
    /// Withhold originals seen by this aggregator from the outputs
    pub drop_original: bool,
    /// Name transforms applied to pushed metrics
    pub rename: Rename,
    /// Tags added to pushed metrics that do not already carry them
    pub tags: Vec<(String, String)>,
    /// Selection and trimming of incoming metrics
    pub filter: Filter,
}

#[derive(Debug, Default)]
struct Counters {
    aggregated: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A snapshot of a [`RunningAggregator`]'s statistics.
pub struct Stats {
    /// Metrics handed to the aggregator
    pub aggregated: u64,
    /// Metrics rejected by the filter
    pub filtered: u64,
    /// Metrics stamped outside the current window
    pub dropped: u64,
    /// Metrics emitted by the aggregator
    pub pushed: u64,
}

/// Couples one aggregator to its window.
pub struct RunningAggregator {
    name: String,
    labels: Vec<(String, String)>,
    aggregator: Box<dyn Aggregator>,
    period: Duration,
    delay: Duration,
    grace: Duration,
    drop_original: bool,
    rename: Rename,
    tags: Vec<(String, String)>,
    filter: Filter,
    period_start: Timestamp,
    period_end: Timestamp,
    counters: Counters,
}

impl std::fmt::Debug for RunningAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningAggregator")
            .field("name", &self.name)
            .field("period_start", &self.period_start)
            .field("period_end", &self.period_end)
            .field("drop_original", &self.drop_original)
            .finish_non_exhaustive()
    }
}

impl RunningAggregator {
    /// Create a runner whose first window opens at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroPeriod`] if the configured period is zero.
    pub fn new(
        settings: Settings,
        aggregator: Box<dyn Aggregator>,
        start: Timestamp,
    ) -> Result<Self, Error> {
        if settings.period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        let mut labels = vec![
            ("component".to_string(), "aggregator".to_string()),
            ("component_name".to_string(), settings.name.clone()),
        ];
        if let Some(id) = &settings.id {
            labels.push(("id".to_string(), id.clone()));
        }
        Ok(Self {
            name: settings.name,
            labels,
            aggregator,
            period: settings.period,
            delay: settings.delay,
            grace: settings.grace,
            drop_original: settings.drop_original,
            rename: settings.rename,
            tags: settings.tags,
            filter: settings.filter,
            period_start: start,
            period_end: start.saturating_add(settings.period),
            counters: Counters::default(),
        })
    }

    /// The plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current window as `(start, end)`.
    #[must_use]
    pub fn window(&self) -> (Timestamp, Timestamp) {
        (self.period_start, self.period_end)
    }

    /// When the current window is due to be pushed.
    #[must_use]
    pub fn push_deadline(&self) -> Timestamp {
        self.period_end.saturating_add(self.delay)
    }

    /// Offer `metric` to the aggregator.
    ///
    /// Metrics stamped between the window start less grace and the push
    /// deadline, both inclusive, are aggregated. Others are counted as
    /// dropped.
    ///
    /// Returns whether the original should be withheld from the outputs. A
    /// metric the filter does not select is never withheld.
    pub fn add(&mut self, metric: &Metric) -> bool {
        if !self.filter.select(metric) {
            return false;
        }
        let mut metric = metric.clone();
        self.filter.modify(&mut metric);
        if metric.fields().is_empty() {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            counter!("metrics_filtered", &self.labels).increment(1);
            return self.drop_original;
        }

        let ts = metric.timestamp();
        if ts < self.period_start.saturating_sub(self.grace) || ts > self.push_deadline() {
            debug!(
                aggregator = self.name,
                metric = metric.name(),
                timestamp = %ts,
                "metric outside aggregation window"
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("metrics_dropped", &self.labels).increment(1);
            return self.drop_original;
        }

        self.aggregator.add(&metric);
        self.counters.aggregated.fetch_add(1, Ordering::Relaxed);
        counter!("metrics_aggregated", &self.labels).increment(1);
        self.drop_original
    }

    /// Push the aggregator, reset it and advance the window past `now`.
    ///
    /// The returned metrics carry the runner's name transforms and tags.
    pub fn push(&mut self, now: Timestamp) -> Vec<Metric> {
        let mut out = self.aggregator.push(now);
        self.aggregator.reset();
        for metric in &mut out {
            self.rename.apply(metric);
            for (key, value) in &self.tags {
                if !metric.has_tag(key) {
                    metric.add_tag(key.clone(), value.clone());
                }
            }
        }
        let pushed = out.len() as u64;
        self.counters.pushed.fetch_add(pushed, Ordering::Relaxed);
        counter!("metrics_pushed", &self.labels).increment(pushed);

        // Windows that elapsed while nobody pushed are skipped, not replayed.
        self.period_start = self.period_end;
        self.period_end = self.period_start.saturating_add(self.period);
        while self.push_deadline() <= now {
            self.period_start = self.period_end;
            self.period_end = self.period_start.saturating_add(self.period);
        }
        out
    }

    /// A snapshot of this runner's statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            aggregated: c.aggregated.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            pushed: c.pushed.load(Ordering::Relaxed),
        }
    }
}

fn timestamp<C: Clock>(clock: &C) -> Timestamp {
    Timestamp::from(clock.now())
}

/// Run every aggregator over `input` until it closes, then push them all one
/// last time.
pub(crate) async fn run_stage<C>(
    clock: C,
    mut aggregators: Vec<RunningAggregator>,
    mut input: mpsc::Receiver<Metric>,
    output: Accumulator,
) where
    C: Clock + Send + Sync,
{
    loop {
        let now = timestamp(&clock);
        let wait = aggregators
            .iter()
            .map(RunningAggregator::push_deadline)
            .min()
            .map_or(Duration::MAX, |deadline| deadline.duration_since(now));

        tokio::select! {
            maybe = input.recv() => {
                let Some(metric) = maybe else { break };
                let mut withhold = false;
                for aggregator in &mut aggregators {
                    withhold |= aggregator.add(&metric);
                }
                if !withhold {
                    output.add_metric(metric).await;
                }
            }
            () = clock.wait(wait) => {
                let now = timestamp(&clock);
                for aggregator in &mut aggregators {
                    if aggregator.push_deadline() <= now {
                        for metric in aggregator.push(now) {
                            output.add_metric(metric).await;
                        }
                    }
                }
            }
        }
    }

    let now = timestamp(&clock);
    for aggregator in &mut aggregators {
        for metric in aggregator.push(now) {
            output.add_metric(metric).await;
        }
    }
    info!("aggregator stage drained");
}
