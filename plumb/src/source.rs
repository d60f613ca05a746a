//! Sources: the producers of metrics.
//!
//! A [`Source`] gathers metrics into an [`Accumulator`] once per tick. Each
//! configured source is owned by a [`SourceRunner`], which binds it to an
//! accumulator whose metrics are renamed, tagged and filtered on the way out,
//! in that order, and which keeps the source's gather statistics.
//!
//! ## Metrics
//!
//! `gathers`: Completed gather calls
//! `metrics_gathered`: Metrics that left the source's accumulator
//! `gather_errors`: Errors returned from or recorded during a gather
//! `gather_time_ns`: Duration of the last gather
//!

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use plumb_metric::Metric;
use plumb_tick::{Clock, Ticker};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    accumulator::{Accumulator, MetricMaker, default_precision},
    error::BoxError,
    filter::Filter,
    rename::Rename,
};

pub mod constant;

#[async_trait]
/// A producer of metrics.
pub trait Source: Send {
    /// Gather metrics into `acc`.
    ///
    /// Called once per tick. Errors that do not end the gather belong in
    /// [`Accumulator::add_error`]; a returned error is recorded the same way.
    /// Either way the source is gathered again on the next tick.
    async fn gather(&mut self, acc: &Accumulator) -> Result<(), BoxError>;
}

#[derive(Debug, Clone)]
/// How a [`SourceRunner`] treats its metrics.
pub struct Settings {
    /// The plugin name
    pub name: String,
    /// The ID assigned to this source
    pub id: Option<String>,
    /// Time between gathers
    pub interval: Duration,
    /// Timestamp precision; `None` derives it from `interval`
    pub precision: Option<Duration>,
    /// Name transforms applied to every metric
    pub rename: Rename,
    /// Tags added to every metric that does not already carry them
    pub tags: Vec<(String, String)>,
    /// Agent-wide tags, applied after `tags` and with the same rule
    pub global_tags: Vec<(String, String)>,
    /// Selection and trimming, applied last
    pub filter: Filter,
}

#[derive(Debug, Default)]
struct Counters {
    gathers: AtomicU64,
    metrics_gathered: AtomicU64,
    errors: AtomicU64,
    gather_time_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A snapshot of a [`SourceRunner`]'s gather statistics.
pub struct Stats {
    /// Completed gather calls
    pub gathers: u64,
    /// Metrics that left the accumulator
    pub metrics_gathered: u64,
    /// Errors returned from or recorded during a gather
    pub errors: u64,
    /// Duration of the last gather
    pub gather_time: Duration,
}

struct SourceMaker {
    rename: Rename,
    tags: Vec<(String, String)>,
    global_tags: Vec<(String, String)>,
    filter: Filter,
    counters: Arc<Counters>,
    labels: Vec<(String, String)>,
}

impl MetricMaker for SourceMaker {
    fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
        self.rename.apply(&mut metric);
        for (key, value) in self.tags.iter().chain(&self.global_tags) {
            if !metric.has_tag(key) {
                metric.add_tag(key.clone(), value.clone());
            }
        }
        let metric = self.filter.apply(metric)?;
        self.counters.metrics_gathered.fetch_add(1, Ordering::Relaxed);
        counter!("metrics_gathered", &self.labels).increment(1);
        Some(metric)
    }
}

/// Binds one source to its accumulator.
pub struct SourceRunner {
    name: String,
    id: Option<String>,
    labels: Vec<(String, String)>,
    interval: Duration,
    source: Box<dyn Source>,
    accumulator: Accumulator,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SourceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRunner")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("accumulator", &self.accumulator)
            .finish_non_exhaustive()
    }
}

impl SourceRunner {
    /// Create a runner gathering `source` into `sender`.
    #[must_use]
    pub fn new(settings: Settings, source: Box<dyn Source>, sender: mpsc::Sender<Metric>) -> Self {
        let mut labels = vec![
            ("component".to_string(), "source".to_string()),
            ("component_name".to_string(), settings.name.clone()),
        ];
        if let Some(id) = &settings.id {
            labels.push(("id".to_string(), id.clone()));
        }

        let counters = Arc::new(Counters::default());
        let maker = SourceMaker {
            rename: settings.rename,
            tags: settings.tags,
            global_tags: settings.global_tags,
            filter: settings.filter,
            counters: Arc::clone(&counters),
            labels: labels.clone(),
        };
        let precision = settings
            .precision
            .filter(|p| !p.is_zero())
            .unwrap_or_else(|| default_precision(settings.interval));
        let accumulator = Accumulator::new(sender)
            .with_maker(Arc::new(maker))
            .with_precision(precision);

        Self {
            name: settings.name,
            id: settings.id,
            labels,
            interval: settings.interval,
            source,
            accumulator,
            counters,
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

    /// The accumulator this runner gathers into.
    #[must_use]
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Gather once, returning the number of errors seen.
    pub async fn gather(&mut self) -> u64 {
        let start = Instant::now();
        if let Err(err) = self.source.gather(&self.accumulator).await {
            self.accumulator.add_error(err);
        }
        let elapsed = start.elapsed();

        let errors = self.accumulator.take_errors();
        for err in &errors {
            warn!(source = self.name, id = ?self.id, "gather error: {err}");
        }
        let errors = errors.len() as u64;

        let gather_time_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.counters.gathers.fetch_add(1, Ordering::Relaxed);
        self.counters.errors.fetch_add(errors, Ordering::Relaxed);
        self.counters
            .gather_time_ns
            .store(gather_time_ns, Ordering::Relaxed);
        counter!("gathers", &self.labels).increment(1);
        counter!("gather_errors", &self.labels).increment(errors);
        gauge!("gather_time_ns", &self.labels).set(gather_time_ns as f64);

        errors
    }

    /// Gather on every tick of `ticker` until `shutdown` fires.
    ///
    /// A gather in flight when the signal arrives runs to completion.
    pub(crate) async fn run<C>(mut self, mut ticker: Ticker<C>, shutdown: plumb_signal::Watcher)
    where
        C: Clock + Send + Sync,
    {
        debug!(source = self.name, interval = ?self.interval, "source started");
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.gather().await;
                }
                () = &mut shutdown_wait => {
                    info!(source = self.name, "shutdown signal received");
                    break;
                }
            }
        }
    }

    /// A snapshot of this runner's statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            gathers: c.gathers.load(Ordering::Relaxed),
            metrics_gathered: c.metrics_gathered.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            gather_time: Duration::from_nanos(c.gather_time_ns.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use plumb_metric::{FieldValue, Timestamp};

    use super::*;
    use crate::filter;

    /// Emits the given metrics, records `soft` errors and fails if `hard`.
    struct Scripted {
        metrics: Vec<Metric>,
        soft: usize,
        hard: bool,
    }

    #[async_trait]
    impl Source for Scripted {
        async fn gather(&mut self, acc: &Accumulator) -> Result<(), BoxError> {
            for metric in &self.metrics {
                acc.add_metric(metric.clone()).await;
            }
            for _ in 0..self.soft {
                acc.add_error("partial failure".into());
            }
            if self.hard {
                return Err("gather failed".into());
            }
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings {
            name: "scripted".to_string(),
            id: None,
            interval: Duration::from_secs(10),
            precision: None,
            rename: Rename::default(),
            tags: Vec::new(),
            global_tags: Vec::new(),
            filter: Filter::default(),
        }
    }

    fn cpu() -> Metric {
        Metric::new("cpu", [("value", 42)], Timestamp::from_secs(1)).expect("valid metric")
    }

    fn pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    async fn gather_one(settings: Settings, metric: Metric) -> Option<Metric> {
        let (tx, mut rx) = mpsc::channel(8);
        let source = Scripted {
            metrics: vec![metric],
            soft: 0,
            hard: false,
        };
        let mut runner = SourceRunner::new(settings, Box::new(source), tx);
        runner.gather().await;
        drop(runner);
        rx.recv().await
    }

    #[tokio::test]
    async fn filter_runs_after_global_tags() {
        let mut settings = settings();
        settings.global_tags = pairs(&[("a", "x"), ("b", "y")]);
        settings.filter = Filter::new(&filter::Config {
            tag_include: vec!["b".to_string()],
            ..filter::Config::default()
        })
        .expect("valid filter");

        let metric = gather_one(settings, cpu()).await.expect("metric kept");
        assert_eq!(metric.tags().len(), 1);
        assert_eq!(metric.tag("b"), Some("y"));
    }

    #[tokio::test]
    async fn tags_never_overwrite_metric_tags() {
        let mut settings = settings();
        settings.tags = pairs(&[("host", "source"), ("dc", "east")]);
        settings.global_tags = pairs(&[("host", "global"), ("dc", "west"), ("env", "prod")]);

        let metric = gather_one(settings, cpu().with_tag("host", "metric"))
            .await
            .expect("metric kept");
        assert_eq!(metric.tag("host"), Some("metric"));
        assert_eq!(metric.tag("dc"), Some("east"));
        assert_eq!(metric.tag("env"), Some("prod"));
    }

    #[tokio::test]
    async fn name_transforms_apply() {
        let mut settings = settings();
        settings.rename = Rename::new(None, Some("foobar_".to_string()), Some("_sfx".to_string()));
        let metric = gather_one(settings, cpu()).await.expect("metric kept");
        assert_eq!(metric.name(), "foobar_cpu_sfx");

        let mut settings = self::settings();
        settings.rename = Rename::new(Some("foobar".to_string()), None, None);
        let metric = gather_one(settings, cpu()).await.expect("metric kept");
        assert_eq!(metric.name(), "foobar");
        assert_eq!(metric.field("value"), Some(&FieldValue::Int(42)));
    }

    #[tokio::test]
    async fn filtered_out_metrics_are_not_sent() {
        let mut settings = settings();
        settings.tags = pairs(&[("foo", "bar")]);
        settings.filter = Filter::new(&filter::Config {
            name_pass: vec!["foobar".to_string()],
            ..filter::Config::default()
        })
        .expect("valid filter");
        assert!(gather_one(settings, cpu()).await.is_none());
    }

    #[tokio::test]
    async fn errors_are_counted_and_do_not_stop_the_source() {
        let (tx, mut rx) = mpsc::channel(8);
        let source = Scripted {
            metrics: vec![cpu()],
            soft: 2,
            hard: true,
        };
        let mut runner = SourceRunner::new(settings(), Box::new(source), tx);

        assert_eq!(runner.gather().await, 3);
        assert_eq!(runner.gather().await, 3);
        let stats = runner.stats();
        assert_eq!(stats.gathers, 2);
        assert_eq!(stats.errors, 6);
        assert_eq!(stats.metrics_gathered, 2);

        drop(runner);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn precision_derives_from_interval() {
        let (tx, _rx) = mpsc::channel(1);
        let source = Scripted {
            metrics: Vec::new(),
            soft: 0,
            hard: false,
        };
        let mut settings = settings();
        settings.interval = Duration::from_millis(250);
        let runner = SourceRunner::new(settings.clone(), Box::new(source), tx.clone());
        assert_eq!(runner.accumulator().precision(), Duration::from_millis(1));

        settings.precision = Some(Duration::from_micros(1));
        let source = Scripted {
            metrics: Vec::new(),
            soft: 0,
            hard: false,
        };
        let runner = SourceRunner::new(settings, Box::new(source), tx);
        assert_eq!(runner.accumulator().precision(), Duration::from_micros(1));
    }

    #[tokio::test(start_paused = true)]
    async fn run_gathers_until_shutdown() {
        let (tx, mut rx) = mpsc::channel(64);
        let source = Scripted {
            metrics: vec![cpu()],
            soft: 0,
            hard: false,
        };
        let runner = SourceRunner::new(settings(), Box::new(source), tx);
        let ticker = Ticker::new(plumb_tick::Config {
            interval: Duration::from_secs(10),
            jitter: Duration::ZERO,
            aligned: false,
        })
        .expect("valid ticker");
        let (watcher, broadcaster) = plumb_signal::signal("test");
        let handle = tokio::spawn(runner.run(ticker, watcher));

        for _ in 0..3 {
            rx.recv().await.expect("gathered");
        }
        broadcaster.signal_and_wait().await;
        handle.await.expect("runner panicked");
        while rx.recv().await.is_some() {}
    }
}
