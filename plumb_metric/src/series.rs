//! Series grouping
//!
//! Aggregators observe fields one at a time but emit whole metrics. The
//! [`SeriesGrouper`] collects field observations keyed by series and
//! timestamp, merging fields of the same key into one [`Metric`].

use rustc_hash::FxHashMap;

use crate::{Error, FieldValue, Metric, Tag, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesId {
    name: String,
    tags: Vec<Tag>,
    timestamp: Timestamp,
}

impl SeriesId {
    fn of(metric: &Metric) -> Self {
        Self {
            name: metric.name().to_string(),
            tags: metric.tags().to_vec(),
            timestamp: metric.timestamp(),
        }
    }
}

/// Merges field observations into one metric per (name, tags, timestamp).
///
/// Entries are emitted in the order their key was first seen. A field key
/// observed twice for the same entry keeps the last value.
#[derive(Debug, Default)]
pub struct SeriesGrouper {
    index: FxHashMap<SeriesId, usize>,
    entries: Vec<Metric>,
}

impl SeriesGrouper {
    /// Create an empty grouper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single field observation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyName`] if `name` is empty.
    pub fn add<K, V, I>(
        &mut self,
        name: &str,
        tags: I,
        timestamp: Timestamp,
        field_key: &str,
        field_value: impl Into<FieldValue>,
    ) -> Result<(), Error>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let metric = Metric::new(name, [(field_key, field_value)], timestamp)?.with_tags(tags);
        self.add_metric(&metric);
        Ok(())
    }

    /// Record every field of `metric`.
    ///
    /// The first metric seen for a key decides the kind of the merged entry.
    pub fn add_metric(&mut self, metric: &Metric) {
        let id = SeriesId::of(metric);
        if let Some(&idx) = self.index.get(&id) {
            let entry = &mut self.entries[idx];
            for field in metric.fields() {
                entry.add_field(field.key.clone(), field.value.clone());
            }
            return;
        }
        self.index.insert(id, self.entries.len());
        self.entries.push(metric.clone());
    }

    /// The merged metrics, one per key, in first-seen order.
    #[must_use]
    pub fn metrics(&self) -> Vec<Metric> {
        self.entries.clone()
    }

    /// Discard all state.
    pub fn reset(&mut self) {
        self.index.clear();
        self.entries.clear();
    }

    /// The number of distinct keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no observation has been recorded since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_TAGS: [(&str, &str); 0] = [];

    #[test]
    fn fields_of_one_series_merge() {
        let t = Timestamp::from_secs(10);
        let mut grouper = SeriesGrouper::new();
        grouper.add("cpu", NO_TAGS, t, "user", 1.0).expect("valid name");
        grouper.add("cpu", NO_TAGS, t, "idle", 2.0).expect("valid name");

        let metrics = grouper.metrics();
        assert_eq!(metrics.len(), 1);
        let cpu = &metrics[0];
        assert_eq!(cpu.name(), "cpu");
        assert_eq!(cpu.timestamp(), t);
        assert_eq!(cpu.field("user"), Some(&FieldValue::Float(1.0)));
        assert_eq!(cpu.field("idle"), Some(&FieldValue::Float(2.0)));
        assert_eq!(cpu.fields().len(), 2);
    }

    #[test]
    fn last_write_wins_within_a_key() {
        let t = Timestamp::from_secs(10);
        let mut grouper = SeriesGrouper::new();
        grouper.add("cpu", NO_TAGS, t, "user", 1.0).expect("valid name");
        grouper.add("cpu", NO_TAGS, t, "user", 5.0).expect("valid name");

        let metrics = grouper.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].field("user"), Some(&FieldValue::Float(5.0)));
    }

    #[test]
    fn tags_and_timestamps_split_entries_in_first_seen_order() {
        let mut grouper = SeriesGrouper::new();
        let t0 = Timestamp::from_secs(0);
        let t1 = Timestamp::from_secs(1);
        grouper.add("cpu", [("host", "b")], t0, "v", 1).expect("valid name");
        grouper.add("cpu", [("host", "a")], t0, "v", 2).expect("valid name");
        grouper.add("cpu", [("host", "b")], t1, "v", 3).expect("valid name");
        grouper.add("cpu", [("host", "a")], t0, "w", 4).expect("valid name");

        let metrics = grouper.metrics();
        let seen: Vec<(Option<&str>, Timestamp, usize)> = metrics
            .iter()
            .map(|m| (m.tag("host"), m.timestamp(), m.fields().len()))
            .collect();
        assert_eq!(
            seen,
            [(Some("b"), t0, 1), (Some("a"), t0, 2), (Some("b"), t1, 1)]
        );
    }

    #[test]
    fn tag_order_does_not_split_a_series() {
        let t = Timestamp::EPOCH;
        let mut grouper = SeriesGrouper::new();
        grouper
            .add("m", [("a", "1"), ("b", "2")], t, "x", 1)
            .expect("valid name");
        grouper
            .add("m", [("b", "2"), ("a", "1")], t, "y", 2)
            .expect("valid name");
        assert_eq!(grouper.len(), 1);
    }

    #[test]
    fn reset_empties_the_grouper() {
        let mut grouper = SeriesGrouper::new();
        grouper
            .add("m", NO_TAGS, Timestamp::EPOCH, "x", 1)
            .expect("valid name");
        assert_eq!(grouper.metrics().len(), 1);
        grouper.reset();
        assert!(grouper.is_empty());
        assert!(grouper.metrics().is_empty());
    }

    #[test]
    fn empty_name_is_an_error() {
        let mut grouper = SeriesGrouper::new();
        assert_eq!(
            grouper.add("", NO_TAGS, Timestamp::EPOCH, "x", 1),
            Err(Error::EmptyName)
        );
    }
}
