//! Per-metric transforms.
//!
//! A [`Processor`] maps one metric to any number of metrics. Configured
//! processors run one after another, each as its own stage task fed by the
//! previous stage's channel. A stage with more than one worker hands its
//! metrics to a [`Parallel`] dispatcher, so a slow transform is spread over
//! blocking threads, in order or not as configured.

use std::sync::Arc;

use plumb_metric::Metric;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{accumulator::Accumulator, parallel::Parallel};

pub mod clone;
pub mod tags;

/// A transform of one metric into zero or more metrics.
///
/// Implementations must not depend on pipeline state and may block.
pub trait Processor: Send + Sync + 'static {
    /// Transform `metric`.
    fn apply(&self, metric: Metric) -> Vec<Metric>;
}

impl<F> Processor for F
where
    F: Fn(Metric) -> Vec<Metric> + Send + Sync + 'static,
{
    fn apply(&self, metric: Metric) -> Vec<Metric> {
        self(metric)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a processor stage runs.
pub struct Settings {
    /// Concurrent transforms. One or zero applies the processor inline.
    pub workers: usize,
    /// Whether a parallel stage preserves input order.
    pub ordered: bool,
    /// Metrics a parallel stage holds between input and output.
    pub queue_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 1,
            ordered: true,
            queue_size: 1_000,
        }
    }
}

/// Run one processor stage until `input` closes, sending results to `output`.
pub(crate) async fn run_stage(
    name: String,
    processor: Arc<dyn Processor>,
    settings: Settings,
    mut input: mpsc::Receiver<Metric>,
    output: Accumulator,
) {
    if settings.workers > 1 {
        let mut parallel = if settings.ordered {
            Parallel::ordered(processor, output, settings.workers, settings.queue_size)
        } else {
            Parallel::unordered(processor, output, settings.workers, settings.queue_size)
        };
        while let Some(metric) = input.recv().await {
            parallel.enqueue(metric).await;
        }
        parallel.stop().await;
    } else {
        while let Some(metric) = input.recv().await {
            for metric in processor.apply(metric) {
                output.add_metric(metric).await;
            }
        }
    }
    debug!(processor = name, "processor stage drained");
}
