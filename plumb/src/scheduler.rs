//! The pipeline scheduler.
//!
//! Builds every configured plugin against a [`Registry`] and wires them into
//! a chain of channels:
//!
//! ```text
//! sources -> processors -> aggregators -> fan-out -> outputs
//! ```
//!
//! Every source gathers on its own ticker and every output flushes on its
//! own, so a slow plugin delays nobody but itself. Shutdown runs in phases.
//! Sources stop first and any gather in flight completes. The channels then
//! drain stage by stage, the flush loops stop, and one final flush writes
//! whatever is still buffered before each sink is closed.

use std::sync::Arc;

use plumb_metric::{Metric, Timestamp};
use plumb_tick::{Clock, RealClock, Ticker};
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    accumulator::Accumulator,
    aggregator::{self, RunningAggregator},
    config::Config,
    error::ErrorKind,
    filter::{self, Filter},
    output::{self, OutputRunner},
    processor::{self, Processor},
    registry::{self, Registry},
    rename::Rename,
    source::{self, SourceRunner},
};

/// Capacity of every channel between pipeline stages.
const CHANNEL_SIZE: usize = 100;

/// Errors produced by [`Scheduler`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A plugin is unknown or rejected its options.
    #[error(transparent)]
    Registry(#[from] registry::Error),
    /// A filter failed to compile.
    #[error(transparent)]
    Filter(#[from] filter::Error),
    /// An aggregator window could not be set up.
    #[error(transparent)]
    Aggregator(#[from] aggregator::Error),
    /// A ticker could not be set up.
    #[error(transparent)]
    Tick(#[from] plumb_tick::Error),
    /// An output failed to connect.
    #[error(transparent)]
    Output(#[from] output::Error),
    /// A shutdown watcher could not be registered.
    #[error(transparent)]
    Registration(#[from] plumb_signal::RegisterError),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Output(err) => err.kind(),
            Error::Registry(_)
            | Error::Filter(_)
            | Error::Aggregator(_)
            | Error::Tick(_)
            | Error::Registration(_) => ErrorKind::FatalConfig,
        }
    }
}

fn sorted(tags: &FxHashMap<String, String>) -> Vec<(String, String)> {
    let mut tags: Vec<(String, String)> = tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    tags.sort();
    tags
}

#[derive(Debug)]
struct ScheduledSource<C> {
    runner: SourceRunner,
    ticker: Ticker<C>,
}

struct Stage {
    name: String,
    processor: Arc<dyn Processor>,
    settings: processor::Settings,
}

#[derive(Debug)]
struct ScheduledOutput<C> {
    runner: Arc<OutputRunner>,
    ticker: Ticker<C>,
}

/// Owns a fully built pipeline until it is run.
pub struct Scheduler<C = RealClock> {
    clock: C,
    head: mpsc::Receiver<Metric>,
    sources: Vec<ScheduledSource<C>>,
    processors: Vec<Stage>,
    aggregators: Vec<RunningAggregator>,
    outputs: Vec<ScheduledOutput<C>>,
}

impl<C> std::fmt::Debug for Scheduler<C>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let processors: Vec<&str> = self.processors.iter().map(|s| s.name.as_str()).collect();
        f.debug_struct("Scheduler")
            .field("clock", &self.clock)
            .field("sources", &self.sources)
            .field("processors", &processors)
            .field("aggregators", &self.aggregators)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Scheduler<RealClock> {
    /// Build the pipeline described by `config` against the real clock.
    ///
    /// # Errors
    ///
    /// Returns an error if any plugin is unknown to `registry`, rejects its
    /// options or carries a filter that does not compile.
    pub fn new(config: &Config, registry: &Registry) -> Result<Self, Error> {
        Self::with_clock(config, registry, RealClock)
    }
}

impl<C> Scheduler<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Build the pipeline described by `config`, timing it with `clock`.
    ///
    /// # Errors
    ///
    /// Returns an error if any plugin is unknown to `registry`, rejects its
    /// options or carries a filter that does not compile.
    pub fn with_clock(config: &Config, registry: &Registry, clock: C) -> Result<Self, Error> {
        let agent = &config.agent;
        let (sender, head) = mpsc::channel(CHANNEL_SIZE);
        let global_tags = sorted(&agent.global_tags);

        let mut sources = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            let plugin = registry.source(&source.plugin, &source.options)?;
            let interval = source.interval.unwrap_or(agent.interval);
            let settings = source::Settings {
                name: source.plugin.clone(),
                id: source.id.clone(),
                interval,
                precision: Some(source.precision.unwrap_or(agent.precision)),
                rename: Rename::new(
                    source.name_override.clone(),
                    source.name_prefix.clone(),
                    source.name_suffix.clone(),
                ),
                tags: sorted(&source.tags),
                global_tags: global_tags.clone(),
                filter: Filter::new(&source.filter)?,
            };
            let ticker = Ticker::with_clock(
                plumb_tick::Config {
                    interval,
                    jitter: source.collection_jitter.unwrap_or(agent.collection_jitter),
                    aligned: agent.round_interval,
                },
                clock.clone(),
                rand::rng().random(),
            )?;
            sources.push(ScheduledSource {
                runner: SourceRunner::new(settings, plugin, sender.clone()),
                ticker,
            });
        }
        // Only sources hold the head of the pipeline open.
        drop(sender);

        let mut processors = Vec::with_capacity(config.processors.len());
        for stage in &config.processors {
            processors.push(Stage {
                name: stage.plugin.clone(),
                processor: registry.processor(&stage.plugin, &stage.options)?,
                settings: stage.settings(),
            });
        }

        let now = Timestamp::from(clock.now());
        let mut aggregators = Vec::with_capacity(config.aggregators.len());
        for aggregator in &config.aggregators {
            let plugin = registry.aggregator(&aggregator.plugin, &aggregator.options)?;
            let start = if agent.round_interval {
                now.truncate(aggregator.period)
            } else {
                now
            };
            let settings = aggregator::Settings {
                name: aggregator.plugin.clone(),
                id: aggregator.id.clone(),
                period: aggregator.period,
                delay: aggregator.delay,
                grace: aggregator.grace,
                drop_original: aggregator.drop_original,
                rename: Rename::new(
                    aggregator.name_override.clone(),
                    aggregator.name_prefix.clone(),
                    aggregator.name_suffix.clone(),
                ),
                tags: sorted(&aggregator.tags),
                filter: Filter::new(&aggregator.filter)?,
            };
            aggregators.push(RunningAggregator::new(settings, plugin, start)?);
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        for output in &config.outputs {
            let sink = registry.sink(&output.plugin, &output.options)?;
            let settings = output::Settings {
                name: output.plugin.clone(),
                id: output.id.clone(),
                metric_batch_size: output.batch_size(agent),
                metric_buffer_limit: output.buffer_limit(agent),
                rename: Rename::new(
                    output.name_override.clone(),
                    output.name_prefix.clone(),
                    output.name_suffix.clone(),
                ),
                filter: Filter::new(&output.filter)?,
            };
            let ticker = Ticker::with_clock(
                plumb_tick::Config {
                    interval: output.flush_interval.unwrap_or(agent.flush_interval),
                    jitter: output.flush_jitter.unwrap_or(agent.flush_jitter),
                    aligned: false,
                },
                clock.clone(),
                rand::rng().random(),
            )?;
            outputs.push(ScheduledOutput {
                runner: Arc::new(OutputRunner::new(settings, sink)),
                ticker,
            });
        }

        Ok(Self {
            clock,
            head,
            sources,
            processors,
            aggregators,
            outputs,
        })
    }

    /// The output runners, in configured order.
    pub fn outputs(&self) -> impl Iterator<Item = &Arc<OutputRunner>> {
        self.outputs.iter().map(|output| &output.runner)
    }

    /// Run the pipeline until `shutdown` fires, then wind it down.
    ///
    /// # Errors
    ///
    /// Returns an error if a sink fails to connect, in which case nothing
    /// runs and the sinks already connected are closed. Failures after
    /// startup are logged and counted, never returned.
    pub async fn run(self, shutdown: plumb_signal::Watcher) -> Result<(), Error> {
        let Self {
            clock,
            head,
            sources,
            processors,
            aggregators,
            outputs,
        } = self;

        for (connected, output) in outputs.iter().enumerate() {
            if let Err(err) = output.runner.connect().await {
                for output in &outputs[..connected] {
                    if let Err(close_err) = output.runner.close().await {
                        warn!(output = output.runner.name(), "{close_err}");
                    }
                }
                return Err(err.into());
            }
        }
        let runners: Vec<Arc<OutputRunner>> =
            outputs.iter().map(|o| Arc::clone(&o.runner)).collect();

        let mut stages: Vec<JoinHandle<()>> = Vec::new();
        let mut input = head;
        for Stage {
            name,
            processor,
            settings,
        } in processors
        {
            let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
            stages.push(tokio::spawn(processor::run_stage(
                name,
                processor,
                settings,
                input,
                Accumulator::new(tx),
            )));
            input = rx;
        }
        if !aggregators.is_empty() {
            let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
            stages.push(tokio::spawn(aggregator::run_stage(
                clock,
                aggregators,
                input,
                Accumulator::new(tx),
            )));
            input = rx;
        }
        stages.push(tokio::spawn(fan_out(input, runners.clone())));

        let (flush_watcher, flush_broadcast) = plumb_signal::signal("flush");
        let mut flushers = Vec::with_capacity(outputs.len());
        for ScheduledOutput { runner, ticker } in outputs {
            flushers.push(tokio::spawn(flush_loop(
                runner,
                ticker,
                flush_watcher.register()?,
            )));
        }
        drop(flush_watcher);

        let (source_watcher, source_broadcast) = plumb_signal::signal("sources");
        let mut gatherers = Vec::with_capacity(sources.len());
        for ScheduledSource { runner, ticker } in sources {
            gatherers.push(tokio::spawn(runner.run(ticker, source_watcher.register()?)));
        }
        drop(source_watcher);
        info!(
            sources = gatherers.len(),
            stages = stages.len(),
            outputs = runners.len(),
            "pipeline running"
        );

        shutdown.recv().await;
        info!("shutdown signal received, stopping sources");
        source_broadcast.signal_and_wait().await;
        join_all("source", gatherers).await;

        info!("sources stopped, draining pipeline");
        join_all("pipeline stage", stages).await;

        info!("pipeline drained, stopping flush loops");
        flush_broadcast.signal_and_wait().await;
        join_all("flush", flushers).await;

        for runner in &runners {
            if let Err(err) = runner.write().await {
                warn!(output = runner.name(), "final flush incomplete: {err}");
            }
            runner.report_overflow();
            if let Err(err) = runner.close().await {
                warn!(output = runner.name(), "{err}");
            }
        }
        info!("final flush complete");
        Ok(())
    }
}

async fn join_all(what: &'static str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            error!("Could not join the spawned {what} task: {err}");
        }
    }
}

/// Hand every metric to every output, until `input` closes.
async fn fan_out(mut input: mpsc::Receiver<Metric>, outputs: Vec<Arc<OutputRunner>>) {
    while let Some(metric) = input.recv().await {
        if let Some((last, rest)) = outputs.split_last() {
            for output in rest {
                output.add_metric(metric.clone());
            }
            last.add_metric(metric);
        }
    }
}

/// Flush `output` on every tick of `ticker` and whenever a batch fills, until
/// `shutdown` fires.
async fn flush_loop<C>(
    output: Arc<OutputRunner>,
    mut ticker: Ticker<C>,
    shutdown: plumb_signal::Watcher,
) where
    C: Clock + Send + Sync,
{
    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        // Write failures are logged and counted by the runner and retried on
        // the next flush.
        tokio::select! {
            _ = ticker.tick() => {
                let _ = output.write().await;
            }
            () = output.batch_ready() => {
                let _ = output.write_batch().await;
            }
            () = &mut shutdown_wait => {
                info!(output = output.name(), "shutdown signal received");
                break;
            }
        }
        output.report_overflow();
    }
}
