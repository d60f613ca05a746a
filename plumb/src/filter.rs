//! Metric selection and trimming.
//!
//! Every source, aggregator and output carries a [`Filter`]. Selection looks
//! at the metric name, then at tag values: a metric that fails either is
//! rejected whole. A selected metric is then trimmed: fields and tags outside
//! the configured globs are removed and tags are renamed. A metric trimmed to
//! no fields is rejected as well.
//!
//! All patterns are shell-style globs. An empty list is no constraint.

use globset::{Glob, GlobSet, GlobSetBuilder};
use plumb_metric::Metric;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::ErrorKind;

/// Errors produced by [`Filter`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A pattern failed to compile.
    #[error("invalid glob {pattern:?}: {source}")]
    Glob {
        /// The offending pattern
        pattern: String,
        /// Underlying glob error
        #[source]
        source: globset::Error,
    },
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalConfig
    }
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(default)]
/// Configuration for [`Filter`]
pub struct Config {
    /// Keep only metrics whose name matches one of these globs.
    pub name_pass: Vec<String>,
    /// Reject metrics whose name matches one of these globs.
    pub name_drop: Vec<String>,
    /// Keep only metrics carrying a tag, named by key, whose value matches one
    /// of the globs.
    pub tag_pass: FxHashMap<String, Vec<String>>,
    /// Reject metrics carrying a tag, named by key, whose value matches one of
    /// the globs.
    pub tag_drop: FxHashMap<String, Vec<String>>,
    /// Keep only fields whose key matches one of these globs.
    pub field_pass: Vec<String>,
    /// Remove fields whose key matches one of these globs.
    pub field_drop: Vec<String>,
    /// Keep only tags whose key matches one of these globs.
    pub tag_include: Vec<String>,
    /// Remove tags whose key matches one of these globs.
    pub tag_exclude: Vec<String>,
    /// Rename tags, old key to new key. A renamed tag replaces any tag already
    /// carrying the new key.
    pub tag_rename: FxHashMap<String, String>,
}

fn compile(patterns: &[String]) -> Result<Option<GlobSet>, Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| Error::Glob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|source| Error::Glob {
        pattern: patterns.join(","),
        source,
    })?;
    Ok(Some(set))
}

fn compile_tags(
    patterns: &FxHashMap<String, Vec<String>>,
) -> Result<Vec<(String, GlobSet)>, Error> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for (key, values) in patterns {
        if let Some(set) = compile(values)? {
            compiled.push((key.clone(), set));
        }
    }
    // Deterministic evaluation order, independent of map iteration.
    compiled.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(compiled)
}

fn any_tag_matches(metric: &Metric, patterns: &[(String, GlobSet)]) -> bool {
    patterns.iter().any(|(key, values)| {
        metric
            .tag(key)
            .is_some_and(|value| values.is_match(value))
    })
}

/// A compiled [`Config`].
#[derive(Debug, Clone, Default)]
pub struct Filter {
    name_pass: Option<GlobSet>,
    name_drop: Option<GlobSet>,
    tag_pass: Vec<(String, GlobSet)>,
    tag_drop: Vec<(String, GlobSet)>,
    field_pass: Option<GlobSet>,
    field_drop: Option<GlobSet>,
    tag_include: Option<GlobSet>,
    tag_exclude: Option<GlobSet>,
    tag_rename: Vec<(String, String)>,
}

impl Filter {
    /// Compile `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Glob`] if any pattern is not a valid glob.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let mut tag_rename: Vec<(String, String)> = config
            .tag_rename
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();
        tag_rename.sort();

        Ok(Self {
            name_pass: compile(&config.name_pass)?,
            name_drop: compile(&config.name_drop)?,
            tag_pass: compile_tags(&config.tag_pass)?,
            tag_drop: compile_tags(&config.tag_drop)?,
            field_pass: compile(&config.field_pass)?,
            field_drop: compile(&config.field_drop)?,
            tag_include: compile(&config.tag_include)?,
            tag_exclude: compile(&config.tag_exclude)?,
            tag_rename,
        })
    }

    /// Whether this filter can change or reject anything at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.name_pass.is_some()
            || self.name_drop.is_some()
            || !self.tag_pass.is_empty()
            || !self.tag_drop.is_empty()
            || self.field_pass.is_some()
            || self.field_drop.is_some()
            || self.tag_include.is_some()
            || self.tag_exclude.is_some()
            || !self.tag_rename.is_empty()
    }

    /// Whether `metric` passes the name and tag value filters.
    #[must_use]
    pub fn select(&self, metric: &Metric) -> bool {
        let name = metric.name();
        if let Some(pass) = &self.name_pass {
            if !pass.is_match(name) {
                return false;
            }
        }
        if let Some(drop) = &self.name_drop {
            if drop.is_match(name) {
                return false;
            }
        }
        if !self.tag_pass.is_empty() && !any_tag_matches(metric, &self.tag_pass) {
            return false;
        }
        if any_tag_matches(metric, &self.tag_drop) {
            return false;
        }
        true
    }

    /// Trim fields and tags of `metric` and apply tag renames.
    pub fn modify(&self, metric: &mut Metric) {
        if let Some(pass) = &self.field_pass {
            metric.retain_fields(|field| pass.is_match(&field.key));
        }
        if let Some(drop) = &self.field_drop {
            metric.retain_fields(|field| !drop.is_match(&field.key));
        }
        if let Some(include) = &self.tag_include {
            metric.retain_tags(|tag| include.is_match(&tag.key));
        }
        if let Some(exclude) = &self.tag_exclude {
            metric.retain_tags(|tag| !exclude.is_match(&tag.key));
        }
        for (from, to) in &self.tag_rename {
            if let Some(value) = metric.remove_tag(from) {
                metric.add_tag(to.clone(), value);
            }
        }
    }

    /// Select and trim `metric`, returning it if it survives.
    #[must_use]
    pub fn apply(&self, mut metric: Metric) -> Option<Metric> {
        if !self.is_active() {
            return Some(metric);
        }
        if !self.select(&metric) {
            return None;
        }
        self.modify(&mut metric);
        if metric.fields().is_empty() {
            return None;
        }
        Some(metric)
    }
}
