//! The `merge` aggregator.
//!
//! Folds metrics of the same series and timestamp into a single multi-field
//! metric. Usually run with `drop_original` set.

use plumb_metric::{Metric, SeriesGrouper, Timestamp};
use serde::Deserialize;

use crate::aggregator::Aggregator;

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Merge`]
pub struct Config {}

#[derive(Debug, Default)]
/// The merge aggregator.
pub struct Merge {
    grouper: SeriesGrouper,
}

impl Aggregator for Merge {
    fn add(&mut self, metric: &Metric) {
        self.grouper.add_metric(metric);
    }

    fn push(&mut self, _now: Timestamp) -> Vec<Metric> {
        self.grouper.metrics()
    }

    fn reset(&mut self) {
        self.grouper.reset();
    }
}

#[cfg(test)]
mod tests {
    use plumb_metric::FieldValue;

    use super::*;

    fn metric(name: &str, host: &str, secs: i64, field: &str, value: f64) -> Metric {
        Metric::new(name, [(field, value)], Timestamp::from_secs(secs))
            .expect("valid metric")
            .with_tag("host", host)
    }

    #[test]
    fn merges_fields_of_one_series() {
        let mut merge = Merge::default();
        merge.add(&metric("cpu", "a", 0, "user", 1.0));
        merge.add(&metric("cpu", "a", 0, "idle", 2.0));
        merge.add(&metric("cpu", "b", 0, "user", 3.0));
        merge.add(&metric("cpu", "a", 10, "user", 4.0));

        let out = merge.push(Timestamp::EPOCH);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].tag("host"), Some("a"));
        assert_eq!(out[0].field("user"), Some(&FieldValue::Float(1.0)));
        assert_eq!(out[0].field("idle"), Some(&FieldValue::Float(2.0)));
        assert_eq!(out[1].tag("host"), Some("b"));
        assert_eq!(out[2].timestamp(), Timestamp::from_secs(10));
    }

    #[test]
    fn reset_clears_the_window() {
        let mut merge = Merge::default();
        merge.add(&metric("cpu", "a", 0, "user", 1.0));
        merge.reset();
        assert!(merge.push(Timestamp::EPOCH).is_empty());
    }
}
