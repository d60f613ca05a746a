//! The `tags` processor.
//!
//! Sets and removes tags on every metric passing through.

use plumb_metric::Metric;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::processor::Processor;

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Tags`]
pub struct Config {
    /// Tags to set.
    #[serde(default)]
    pub set: FxHashMap<String, String>,
    /// Tag keys to remove, applied before `set`.
    #[serde(default)]
    pub remove: Vec<String>,
    /// Whether `set` replaces a value the metric already carries.
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            set: FxHashMap::default(),
            remove: Vec::new(),
            overwrite: default_overwrite(),
        }
    }
}

#[derive(Debug)]
/// The tags processor.
pub struct Tags {
    set: Vec<(String, String)>,
    remove: Vec<String>,
    overwrite: bool,
}

impl Tags {
    /// Create a new [`Tags`] processor.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut set: Vec<(String, String)> = config.set.into_iter().collect();
        set.sort();
        Self {
            set,
            remove: config.remove,
            overwrite: config.overwrite,
        }
    }
}

impl Processor for Tags {
    fn apply(&self, mut metric: Metric) -> Vec<Metric> {
        for key in &self.remove {
            metric.remove_tag(key);
        }
        for (key, value) in &self.set {
            if self.overwrite || !metric.has_tag(key) {
                metric.add_tag(key.clone(), value.clone());
            }
        }
        vec![metric]
    }
}
