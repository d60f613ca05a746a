//! The `final` aggregator.
//!
//! Remembers the latest metric of every series across windows. Once a series
//! has been silent for longer than `series_timeout`, measured from the
//! timestamp of its latest metric, that metric is emitted with every field
//! key suffixed `_final` and the series is forgotten.

use std::time::Duration;

use plumb_metric::{Metric, Timestamp};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::aggregator::Aggregator;

fn default_series_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Final`]
pub struct Config {
    /// Silence after which a series counts as finished.
    #[serde(default = "default_series_timeout", with = "humantime_serde")]
    pub series_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            series_timeout: default_series_timeout(),
        }
    }
}

#[derive(Debug)]
struct Latest {
    /// Order in which the series was first seen.
    seq: u64,
    metric: Metric,
}

#[derive(Debug)]
/// The final aggregator.
pub struct Final {
    series_timeout: Duration,
    cache: FxHashMap<u64, Latest>,
    next_seq: u64,
}

impl Final {
    /// Create a new [`Final`] aggregator.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            series_timeout: config.series_timeout,
            cache: FxHashMap::default(),
            next_seq: 0,
        }
    }
}

impl Aggregator for Final {
    fn add(&mut self, metric: &Metric) {
        let key = metric.series_key();
        if let Some(latest) = self.cache.get_mut(&key) {
            latest.metric = metric.clone();
            return;
        }
        self.cache.insert(
            key,
            Latest {
                seq: self.next_seq,
                metric: metric.clone(),
            },
        );
        self.next_seq += 1;
    }

    fn push(&mut self, now: Timestamp) -> Vec<Metric> {
        let timeout = self.series_timeout;
        let keys: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, latest)| now.duration_since(latest.metric.timestamp()) > timeout)
            .map(|(key, _)| *key)
            .collect();
        let mut expired: Vec<Latest> = keys
            .iter()
            .filter_map(|key| self.cache.remove(key))
            .collect();
        expired.sort_by_key(|latest| latest.seq);

        expired
            .into_iter()
            .filter_map(|Latest { metric, .. }| {
                let fields = metric
                    .fields()
                    .iter()
                    .map(|field| (format!("{}_final", field.key), field.value.clone()));
                let tags = metric
                    .tags()
                    .iter()
                    .map(|tag| (tag.key.clone(), tag.value.clone()));
                Metric::new(metric.name(), fields, metric.timestamp())
                    .ok()
                    .map(|m| m.with_tags(tags))
            })
            .collect()
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use plumb_metric::FieldValue;

    use super::*;

    fn metric(host: &str, secs: i64, value: i64) -> Metric {
        Metric::new("cpu", [("time_idle", value)], Timestamp::from_secs(secs))
            .expect("valid metric")
            .with_tag("host", host)
    }

    fn final_agg() -> Final {
        Final::new(Config {
            series_timeout: Duration::from_secs(30),
        })
    }

    #[test]
    fn emits_last_value_after_timeout() {
        let mut agg = final_agg();
        agg.add(&metric("a", 0, 42));
        agg.add(&metric("a", 10, 43));

        assert!(agg.push(Timestamp::from_secs(40)).is_empty());
        agg.reset();

        let out = agg.push(Timestamp::from_secs(41));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "cpu");
        assert_eq!(out[0].tag("host"), Some("a"));
        assert_eq!(out[0].timestamp(), Timestamp::from_secs(10));
        assert_eq!(out[0].field("time_idle_final"), Some(&FieldValue::Int(43)));
        assert!(out[0].field("time_idle").is_none());

        assert!(agg.push(Timestamp::from_secs(1_000)).is_empty());
    }

    #[test]
    fn expired_series_come_out_in_first_seen_order() {
        let mut agg = final_agg();
        for host in ["c", "a", "b"] {
            agg.add(&metric(host, 0, 1));
        }
        agg.add(&metric("c", 5, 2));

        let hosts: Vec<_> = agg
            .push(Timestamp::from_secs(100))
            .iter()
            .map(|m| m.tag("host").map(str::to_string))
            .collect();
        assert_eq!(
            hosts,
            [Some("c".to_string()), Some("a".to_string()), Some("b".to_string())]
        );
    }

    #[test]
    fn default_timeout_is_five_minutes() {
        let config: Config = serde_yaml::from_str("{}").expect("valid yaml");
        assert_eq!(config.series_timeout, Duration::from_secs(300));
        let config: Config = serde_yaml::from_str("series_timeout: 1m").expect("valid yaml");
        assert_eq!(config.series_timeout, Duration::from_secs(60));
    }
}
