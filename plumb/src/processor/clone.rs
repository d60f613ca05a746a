//! The `clone` processor.
//!
//! Emits a renamed, retagged copy of every metric followed by the untouched
//! original.

use plumb_metric::Metric;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{processor::Processor, rename::Rename};

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(default)]
/// Configuration for [`Cloner`]
pub struct Config {
    /// Name of the copy, replacing prefix and suffix.
    pub name_override: Option<String>,
    /// Prepended to the name of the copy.
    pub name_prefix: Option<String>,
    /// Appended to the name of the copy.
    pub name_suffix: Option<String>,
    /// Tags set on the copy, replacing existing values.
    pub tags: FxHashMap<String, String>,
}

#[derive(Debug)]
/// The clone processor.
pub struct Cloner {
    rename: Rename,
    tags: Vec<(String, String)>,
}

impl Cloner {
    /// Create a new [`Cloner`] processor.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut tags: Vec<(String, String)> = config.tags.into_iter().collect();
        tags.sort();
        Self {
            rename: Rename::new(config.name_override, config.name_prefix, config.name_suffix),
            tags,
        }
    }
}

impl Processor for Cloner {
    fn apply(&self, metric: Metric) -> Vec<Metric> {
        let mut copy = metric.clone();
        self.rename.apply(&mut copy);
        for (key, value) in &self.tags {
            copy.add_tag(key.clone(), value.clone());
        }
        vec![copy, metric]
    }
}
