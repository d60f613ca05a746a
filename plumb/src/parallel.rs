//! Concurrent dispatch of a [`Processor`] over many metrics.
//!
//! A [`Parallel`] dispatcher owns a pool of worker tasks. Each worker pulls
//! the next metric from a shared queue, runs the processor on the blocking
//! thread pool and passes the result to a single emitter task, which sends it
//! to the output [`Accumulator`].
//!
//! The ordered emitter restores input order: every metric is numbered on
//! enqueue and results that finish early wait in a reorder buffer until all
//! earlier results have been sent. The unordered emitter sends results as
//! they arrive.
//!
//! At most `queue_size` metrics are between [`Parallel::enqueue`] and the
//! output at any time, which bounds the reorder buffer. A transform that never
//! returns stalls an ordered dispatcher once the queue fills.

use std::{collections::BTreeMap, sync::Arc};

use plumb_metric::Metric;
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc},
    task::{self, JoinHandle, JoinSet},
};
use tracing::{debug, error};

use crate::{accumulator::Accumulator, processor::Processor};

#[derive(Debug)]
struct Job {
    seq: u64,
    metric: Metric,
    permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Done {
    seq: u64,
    metrics: Vec<Metric>,
    permit: OwnedSemaphorePermit,
}

/// A pool of workers applying one processor.
#[derive(Debug)]
pub struct Parallel {
    jobs: mpsc::Sender<Job>,
    permits: Arc<Semaphore>,
    next_seq: u64,
    workers: JoinSet<()>,
    emitter: JoinHandle<()>,
}

impl Parallel {
    /// A dispatcher whose output follows enqueue order.
    #[must_use]
    pub fn ordered(
        processor: Arc<dyn Processor>,
        output: Accumulator,
        workers: usize,
        queue_size: usize,
    ) -> Self {
        Self::spawn(processor, workers, queue_size, |done| {
            tokio::spawn(emit_ordered(done, output))
        })
    }

    /// A dispatcher whose output follows completion order.
    #[must_use]
    pub fn unordered(
        processor: Arc<dyn Processor>,
        output: Accumulator,
        workers: usize,
        queue_size: usize,
    ) -> Self {
        Self::spawn(processor, workers, queue_size, |done| {
            tokio::spawn(emit_unordered(done, output))
        })
    }

    fn spawn<E>(
        processor: Arc<dyn Processor>,
        workers: usize,
        queue_size: usize,
        emitter: E,
    ) -> Self
    where
        E: FnOnce(mpsc::Receiver<Done>) -> JoinHandle<()>,
    {
        let workers = workers.max(1);
        let queue_size = queue_size.max(1);

        let (jobs, job_rx) = mpsc::channel(queue_size);
        let (done_tx, done_rx) = mpsc::channel(queue_size);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(work(
                Arc::clone(&job_rx),
                Arc::clone(&processor),
                done_tx.clone(),
            ));
        }
        // The emitter ends once every worker has dropped its sender.
        drop(done_tx);

        Self {
            jobs,
            permits: Arc::new(Semaphore::new(queue_size)),
            next_seq: 0,
            workers: pool,
            emitter: emitter(done_rx),
        }
    }

    /// Queue `metric` for transformation, waiting while the dispatcher is
    /// full.
    pub async fn enqueue(&mut self, metric: Metric) {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            // The semaphore is never closed.
            return;
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.jobs.send(Job { seq, metric, permit }).await.is_err() {
            error!("parallel workers are gone, metric discarded");
        }
    }

    /// Stop accepting metrics and wait until every queued metric has been
    /// transformed and sent to the output.
    pub async fn stop(self) {
        let Self {
            jobs,
            mut workers,
            emitter,
            ..
        } = self;
        drop(jobs);
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                error!("parallel worker failed: {err}");
            }
        }
        if let Err(err) = emitter.await {
            error!("parallel emitter failed: {err}");
        }
        debug!("parallel dispatcher stopped");
    }
}

async fn work(
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    processor: Arc<dyn Processor>,
    done: mpsc::Sender<Done>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(Job { seq, metric, permit }) = job else {
            break;
        };

        let processor = Arc::clone(&processor);
        let metrics = match task::spawn_blocking(move || processor.apply(metric)).await {
            Ok(metrics) => metrics,
            Err(err) => {
                // An empty result keeps the sequence moving.
                error!(seq, "transform failed: {err}");
                Vec::new()
            }
        };
        if done.send(Done { seq, metrics, permit }).await.is_err() {
            break;
        }
    }
}

async fn emit_ordered(mut done: mpsc::Receiver<Done>, output: Accumulator) {
    let mut pending: BTreeMap<u64, Done> = BTreeMap::new();
    let mut next: u64 = 0;
    while let Some(result) = done.recv().await {
        pending.insert(result.seq, result);
        while let Some(ready) = pending.remove(&next) {
            for metric in ready.metrics {
                output.add_metric(metric).await;
            }
            drop(ready.permit);
            next += 1;
        }
    }
    if !pending.is_empty() {
        error!(
            stranded = pending.len(),
            "parallel emitter closed with results out of sequence"
        );
    }
}

async fn emit_unordered(mut done: mpsc::Receiver<Done>, output: Accumulator) {
    while let Some(result) = done.recv().await {
        for metric in result.metrics {
            output.add_metric(metric).await;
        }
        drop(result.permit);
    }
}
