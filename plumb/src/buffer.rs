//! The bounded metric buffer behind every output.
//!
//! Metrics wait here between the pipeline and a sink. The buffer holds at most
//! `capacity` metrics and drops the oldest to admit new ones. Writes happen in
//! batches: [`Buffer::batch`] hands out the oldest metrics without removing
//! them, and the write outcome either [accepts](Buffer::accept) them, removing
//! them for good, or [rejects](Buffer::reject) them, leaving them at the front
//! for the next attempt.
//!
//! Metrics handed out in a batch may be pushed out of the buffer by new
//! arrivals while the write is in flight. They are set aside rather than
//! counted as dropped: an accepted batch was delivered, and a rejected batch
//! returns to the front, evicting the newest metrics if it no longer fits.

use std::collections::VecDeque;

use plumb_metric::Metric;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    metric: Metric,
}

/// Metrics handed out by [`Buffer::batch`] for a single write attempt.
///
/// Must be returned to the buffer that produced it through
/// [`Buffer::accept`] or [`Buffer::reject`].
#[derive(Debug)]
#[must_use]
pub struct Batch {
    seqs: Vec<u64>,
    metrics: Vec<Metric>,
}

impl Batch {
    /// The metrics to write, oldest first.
    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// The number of metrics in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether this batch holds no metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// A bounded, drop-oldest, order preserving queue of metrics.
#[derive(Debug)]
pub struct Buffer {
    entries: VecDeque<Entry>,
    capacity: usize,
    next_seq: u64,
    /// Sequence numbers of every metric out in a batch.
    in_flight: FxHashSet<u64>,
    /// In-flight metrics evicted by overflow, kept until their batch resolves.
    displaced: Vec<Entry>,
    dropped: u64,
}

impl Buffer {
    /// Create a buffer holding at most `capacity` metrics. A capacity of zero
    /// is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::new(),
            capacity,
            next_seq: 0,
            in_flight: FxHashSet::default(),
            displaced: Vec::new(),
            dropped: 0,
        }
    }

    /// Append `metric`, evicting the oldest metric if the buffer is full.
    ///
    /// Returns the number of metrics dropped to make room, zero or one.
    pub fn add(&mut self, metric: Metric) -> u64 {
        let mut dropped = 0;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                if self.in_flight.contains(&oldest.seq) {
                    self.displaced.push(oldest);
                } else {
                    dropped += 1;
                }
            }
        }
        self.dropped += dropped;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(Entry { seq, metric });
        dropped
    }

    /// Append every metric of `metrics` in order.
    ///
    /// Returns the number of metrics dropped to make room.
    pub fn add_all<I>(&mut self, metrics: I) -> u64
    where
        I: IntoIterator<Item = Metric>,
    {
        metrics.into_iter().map(|metric| self.add(metric)).sum()
    }

    /// Hand out up to `n` of the oldest metrics not already in a batch.
    ///
    /// The metrics stay in the buffer until the batch is accepted.
    pub fn batch(&mut self, n: usize) -> Batch {
        let mut seqs = Vec::with_capacity(n.min(self.entries.len()));
        let mut metrics = Vec::with_capacity(seqs.capacity());
        for entry in &self.entries {
            if metrics.len() >= n {
                break;
            }
            if self.in_flight.contains(&entry.seq) {
                continue;
            }
            seqs.push(entry.seq);
            metrics.push(entry.metric.clone());
        }
        self.in_flight.extend(seqs.iter().copied());
        Batch { seqs, metrics }
    }

    /// Remove the metrics of a successfully written batch.
    pub fn accept(&mut self, batch: Batch) {
        let seqs = self.resolve(&batch);
        self.entries.retain(|entry| !seqs.contains(&entry.seq));
        self.displaced.retain(|entry| !seqs.contains(&entry.seq));
    }

    /// Return the metrics of a failed batch to the front of the buffer, in
    /// their original order.
    ///
    /// Metrics of the batch that overflow evicted while it was in flight are
    /// reinstated. If that takes the buffer over capacity the newest metrics
    /// are dropped.
    pub fn reject(&mut self, batch: Batch) {
        let seqs = self.resolve(&batch);

        let (returning, displaced): (Vec<Entry>, Vec<Entry>) = self
            .displaced
            .drain(..)
            .partition(|entry| seqs.contains(&entry.seq));
        self.displaced = displaced;
        // Entries stay sorted by sequence number, so a displaced metric goes
        // back exactly where it was.
        for entry in returning {
            let idx = self.entries.partition_point(|held| held.seq < entry.seq);
            self.entries.insert(idx, entry);
        }

        while self.entries.len() > self.capacity {
            let Some(newest) = self.entries.pop_back() else {
                break;
            };
            if self.in_flight.contains(&newest.seq) {
                self.displaced.push(newest);
            } else {
                self.dropped += 1;
            }
        }
    }

    fn resolve(&mut self, batch: &Batch) -> FxHashSet<u64> {
        let seqs: FxHashSet<u64> = batch.seqs.iter().copied().collect();
        for seq in &seqs {
            self.in_flight.remove(seq);
        }
        seqs
    }

    /// The number of metrics held, excluding any displaced by overflow while
    /// in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The maximum number of metrics held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total metrics dropped by overflow since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
