//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Configuration errors are
//! fatal and surface here, before anything runs.
//!
//! A configuration is a single YAML document or a directory of them. In a
//! directory every `.yaml` file is read in file name order and composed:
//! plugin lists are appended, while `agent` and `telemetry` may each appear in
//! at most one file.

use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::{error::ErrorKind, filter, processor};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Two plugins of the same class share an ID.
    #[error("Duplicate {section} ID found: {id}")]
    DuplicateId {
        /// Configuration section
        section: &'static str,
        /// The repeated ID
        id: String,
    },
    /// An interval or period was zero.
    #[error("{what} must be greater than zero")]
    Zero {
        /// The offending setting
        what: String,
    },
    /// An output's buffer cannot hold a single batch.
    #[error(
        "metric_buffer_limit {limit} of output {plugin} is smaller than its metric_batch_size {batch}"
    )]
    BufferBelowBatch {
        /// Output plugin name
        plugin: String,
        /// Configured buffer limit
        limit: usize,
        /// Configured batch size
        batch: usize,
    },
    /// Error when no config files found in directory
    #[error("No .yaml config files found in directory: {0}")]
    NoConfigFiles(PathBuf),
    /// Error when `agent` is defined in multiple config files
    #[error("agent cannot be defined in multiple config files")]
    ConflictingAgent,
    /// Error when telemetry is defined in multiple config files
    #[error("Telemetry cannot be defined in multiple config files")]
    ConflictingTelemetry,
    /// Error getting metadata for config path
    #[error("Failed to get metadata for config path {path:?}: {source}")]
    Metadata {
        /// Config path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error reading directory entries
    #[error("Failed to read directory entries from {path:?}: {source}")]
    ReadDir {
        /// Directory path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The path is neither a file nor a directory.
    #[error("Config path {0:?} is neither a file nor a directory")]
    NotAFile(PathBuf),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalConfig
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1_000
}

fn default_buffer_limit() -> usize {
    10_000
}

fn default_workers() -> usize {
    1
}

fn default_queue_size() -> usize {
    1_000
}

fn default_period() -> Duration {
    Duration::from_secs(30)
}

fn default_delay() -> Duration {
    Duration::from_millis(100)
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Agent-wide settings
    #[serde(default)]
    pub agent: Agent,
    /// Where to expose plumb's own telemetry, if anywhere
    pub telemetry: Option<Telemetry>,
    /// Metric producers
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Per-metric transforms, applied in order
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    /// Windowed aggregations
    #[serde(default)]
    pub aggregators: Vec<AggregatorConfig>,
    /// Metric consumers
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Agent-wide settings, the defaults every plugin falls back on.
pub struct Agent {
    /// Time between gathers
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Align gathers to multiples of `interval`
    #[serde(default = "default_true")]
    pub round_interval: bool,
    /// Upper bound of the random delay added to every gather
    #[serde(default, with = "humantime_serde")]
    pub collection_jitter: Duration,
    /// Time between flushes
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Upper bound of the random delay added to every flush
    #[serde(default, with = "humantime_serde")]
    pub flush_jitter: Duration,
    /// Timestamp precision; zero derives it from `interval`
    #[serde(default, with = "humantime_serde")]
    pub precision: Duration,
    /// Maximum metrics per sink write
    #[serde(default = "default_batch_size")]
    pub metric_batch_size: usize,
    /// Maximum metrics buffered per output
    #[serde(default = "default_buffer_limit")]
    pub metric_buffer_limit: usize,
    /// Tags added to every gathered metric that does not already carry them
    #[serde(default)]
    pub global_tags: FxHashMap<String, String>,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            round_interval: true,
            collection_jitter: Duration::ZERO,
            flush_interval: default_interval(),
            flush_jitter: Duration::ZERO,
            precision: Duration::ZERO,
            metric_batch_size: default_batch_size(),
            metric_buffer_limit: default_buffer_limit(),
            global_tags: FxHashMap::default(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Exposes plumb's own statistics for scraping at a prometheus endpoint.
pub struct Telemetry {
    /// Address and port for prometheus exporter
    pub addr: SocketAddr,
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of one source.
pub struct SourceConfig {
    /// Registered plugin name
    pub plugin: String,
    /// The ID assigned to this source
    pub id: Option<String>,
    /// Overrides [`Agent::interval`]
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    /// Overrides [`Agent::collection_jitter`]
    #[serde(default, with = "humantime_serde")]
    pub collection_jitter: Option<Duration>,
    /// Overrides [`Agent::precision`]
    #[serde(default, with = "humantime_serde")]
    pub precision: Option<Duration>,
    /// Replaces the name of every metric
    pub name_override: Option<String>,
    /// Prepended to the name of every metric
    pub name_prefix: Option<String>,
    /// Appended to the name of every metric
    pub name_suffix: Option<String>,
    /// Tags added to every metric that does not already carry them
    #[serde(default)]
    pub tags: FxHashMap<String, String>,
    /// Selection and trimming of gathered metrics
    #[serde(default)]
    pub filter: filter::Config,
    /// Plugin options
    #[serde(default)]
    pub options: serde_yaml::Value,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of one processor.
pub struct ProcessorConfig {
    /// Registered plugin name
    pub plugin: String,
    /// The ID assigned to this processor
    pub id: Option<String>,
    /// Concurrent transforms; more than one runs the processor in parallel
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Whether a parallel processor preserves input order
    #[serde(default = "default_true")]
    pub ordered: bool,
    /// Metrics a parallel processor holds between input and output
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Plugin options
    #[serde(default)]
    pub options: serde_yaml::Value,
}

impl ProcessorConfig {
    /// The stage settings of this processor.
    #[must_use]
    pub fn settings(&self) -> processor::Settings {
        processor::Settings {
            workers: self.workers,
            ordered: self.ordered,
            queue_size: self.queue_size,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of one aggregator.
pub struct AggregatorConfig {
    /// Registered plugin name
    pub plugin: String,
    /// The ID assigned to this aggregator
    pub id: Option<String>,
    /// Length of a window
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
    /// Time past the end of a window still accepted before pushing
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,
    /// Time before the start of a window still accepted
    #[serde(default, with = "humantime_serde")]
    pub grace: Duration,
    /// Withhold originals seen by this aggregator from the outputs
    #[serde(default)]
    pub drop_original: bool,
    /// Replaces the name of every pushed metric
    pub name_override: Option<String>,
    /// Prepended to the name of every pushed metric
    pub name_prefix: Option<String>,
    /// Appended to the name of every pushed metric
    pub name_suffix: Option<String>,
    /// Tags added to every pushed metric that does not already carry them
    #[serde(default)]
    pub tags: FxHashMap<String, String>,
    /// Selection and trimming of incoming metrics
    #[serde(default)]
    pub filter: filter::Config,
    /// Plugin options
    #[serde(default)]
    pub options: serde_yaml::Value,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of one output.
pub struct OutputConfig {
    /// Registered plugin name
    pub plugin: String,
    /// The ID assigned to this output
    pub id: Option<String>,
    /// Overrides [`Agent::flush_interval`]
    #[serde(default, with = "humantime_serde")]
    pub flush_interval: Option<Duration>,
    /// Overrides [`Agent::flush_jitter`]
    #[serde(default, with = "humantime_serde")]
    pub flush_jitter: Option<Duration>,
    /// Overrides [`Agent::metric_batch_size`]
    pub metric_batch_size: Option<usize>,
    /// Overrides [`Agent::metric_buffer_limit`]
    pub metric_buffer_limit: Option<usize>,
    /// Replaces the name of every metric
    pub name_override: Option<String>,
    /// Prepended to the name of every metric
    pub name_prefix: Option<String>,
    /// Appended to the name of every metric
    pub name_suffix: Option<String>,
    /// Selection and trimming of metrics on their way in
    #[serde(default)]
    pub filter: filter::Config,
    /// Plugin options
    #[serde(default)]
    pub options: serde_yaml::Value,
}

impl OutputConfig {
    /// The effective batch size under `agent`.
    #[must_use]
    pub fn batch_size(&self, agent: &Agent) -> usize {
        self.metric_batch_size.unwrap_or(agent.metric_batch_size)
    }

    /// The effective buffer limit under `agent`.
    #[must_use]
    pub fn buffer_limit(&self, agent: &Agent) -> usize {
        self.metric_buffer_limit.unwrap_or(agent.metric_buffer_limit)
    }
}

/// Partial configuration used for composing a directory of config files.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    agent: Option<Agent>,
    telemetry: Option<Telemetry>,
    #[serde(default)]
    sources: Vec<SourceConfig>,
    #[serde(default)]
    processors: Vec<ProcessorConfig>,
    #[serde(default)]
    aggregators: Vec<AggregatorConfig>,
    #[serde(default)]
    outputs: Vec<OutputConfig>,
}

impl PartialConfig {
    fn merge(mut self, overlay: PartialConfig) -> Result<Self, Error> {
        if self.agent.is_some() && overlay.agent.is_some() {
            return Err(Error::ConflictingAgent);
        }
        if self.telemetry.is_some() && overlay.telemetry.is_some() {
            return Err(Error::ConflictingTelemetry);
        }
        self.agent = self.agent.or(overlay.agent);
        self.telemetry = self.telemetry.or(overlay.telemetry);
        self.sources.extend(overlay.sources);
        self.processors.extend(overlay.processors);
        self.aggregators.extend(overlay.aggregators);
        self.outputs.extend(overlay.outputs);
        Ok(self)
    }
}

impl From<PartialConfig> for Config {
    fn from(partial: PartialConfig) -> Self {
        Self {
            agent: partial.agent.unwrap_or_default(),
            telemetry: partial.telemetry,
            sources: partial.sources,
            processors: partial.processors,
            aggregators: partial.aggregators,
            outputs: partial.outputs,
        }
    }
}

fn check_duplicate_ids<'a, I>(section: &'static str, ids: I) -> Result<(), Error>
where
    I: IntoIterator<Item = Option<&'a String>>,
{
    let mut seen = FxHashSet::default();
    for id in ids.into_iter().flatten() {
        if !seen.insert(id) {
            return Err(Error::DuplicateId {
                section,
                id: id.clone(),
            });
        }
    }
    Ok(())
}

fn nonzero(value: Duration, what: impl FnOnce() -> String) -> Result<(), Error> {
    if value.is_zero() {
        return Err(Error::Zero { what: what() });
    }
    Ok(())
}

impl Config {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid configuration.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings serde cannot.
    ///
    /// Plugin names are not checked here; that happens when the pipeline is
    /// built against a registry.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate IDs within a section, zero intervals or
    /// periods, zero batch sizes and buffers smaller than a batch.
    pub fn validate(&self) -> Result<(), Error> {
        check_duplicate_ids("source", self.sources.iter().map(|s| s.id.as_ref()))?;
        check_duplicate_ids("processor", self.processors.iter().map(|p| p.id.as_ref()))?;
        check_duplicate_ids("aggregator", self.aggregators.iter().map(|a| a.id.as_ref()))?;
        check_duplicate_ids("output", self.outputs.iter().map(|o| o.id.as_ref()))?;

        nonzero(self.agent.interval, || "agent.interval".to_string())?;
        nonzero(self.agent.flush_interval, || "agent.flush_interval".to_string())?;
        for source in &self.sources {
            if let Some(interval) = source.interval {
                nonzero(interval, || format!("interval of source {}", source.plugin))?;
            }
        }
        for processor in &self.processors {
            if processor.queue_size == 0 {
                return Err(Error::Zero {
                    what: format!("queue_size of processor {}", processor.plugin),
                });
            }
        }
        for aggregator in &self.aggregators {
            nonzero(aggregator.period, || {
                format!("period of aggregator {}", aggregator.plugin)
            })?;
        }
        for output in &self.outputs {
            if let Some(interval) = output.flush_interval {
                nonzero(interval, || format!("flush_interval of output {}", output.plugin))?;
            }
            let batch = output.batch_size(&self.agent);
            let limit = output.buffer_limit(&self.agent);
            if batch == 0 {
                return Err(Error::Zero {
                    what: format!("metric_batch_size of output {}", output.plugin),
                });
            }
            if limit < batch {
                return Err(Error::BufferBelowBatch {
                    plugin: output.plugin.clone(),
                    limit,
                    batch,
                });
            }
        }
        Ok(())
    }
}

/// Load configuration from a path, a file or a directory of files.
///
/// # Errors
///
/// Returns an error if:
///
/// * Path does not exist or cannot be read
/// * No .yaml files found in directory
/// * Config files contain invalid YAML
/// * `agent` or `telemetry` defined in multiple files
/// * [`Config::validate`] fails on the composed configuration
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let metadata = fs::metadata(path).map_err(|source| Error::Metadata {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;

    if metadata.is_file() {
        let contents = read(path)?;
        Config::parse(&contents)
    } else if metadata.is_dir() {
        let config = load_directory_configs(path)?;
        config.validate()?;
        Ok(config)
    } else {
        Err(Error::NotAFile(path.to_path_buf()))
    }
}

fn read(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

fn load_directory_configs(dir: &Path) -> Result<Config, Error> {
    let read_dir_error = |source| Error::ReadDir {
        path: dir.to_path_buf(),
        source: Box::new(source),
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_dir_error)? {
        let path = entry.map_err(read_dir_error)?.path();
        let is_yaml_file = path.is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some("yaml")
            && !path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with('.'));
        if is_yaml_file {
            paths.push(path);
        }
    }
    // Processors run in configured order, so files compose in name order.
    paths.sort();

    let mut merged: Option<PartialConfig> = None;
    for path in &paths {
        let partial: PartialConfig = serde_yaml::from_str(&read(path)?)?;
        merged = Some(match merged {
            None => partial,
            Some(acc) => acc.merge(partial)?,
        });
    }
    merged
        .map(Config::from)
        .ok_or_else(|| Error::NoConfigFiles(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use proptest::prelude::*;

    use super::*;

    const FULL: &str = r#"
agent:
  interval: 5s
  round_interval: false
  collection_jitter: 1s
  flush_interval: 2s
  precision: 1ms
  metric_batch_size: 10
  metric_buffer_limit: 100
  global_tags:
    dc: east
telemetry:
  addr: "127.0.0.1:9000"
  global_labels:
    agent: plumb
sources:
  - plugin: constant
    id: heartbeat
    interval: 1s
    name_prefix: plumb_
    tags:
      role: agent
    filter:
      field_drop: ["debug*"]
    options:
      measurement: up
      fields:
        value: 1
processors:
  - plugin: tags
    workers: 4
    ordered: false
    options:
      set:
        pipeline: main
aggregators:
  - plugin: final
    period: 1m
    drop_original: true
    options:
      series_timeout: 2m
outputs:
  - plugin: file
    metric_batch_size: 5
    options:
      path: "-"
  - plugin: discard
"#;

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let config = Config::parse(FULL)?;
        assert_eq!(config.agent.interval, Duration::from_secs(5));
        assert!(!config.agent.round_interval);
        assert_eq!(config.agent.precision, Duration::from_millis(1));
        assert_eq!(config.agent.flush_jitter, Duration::ZERO);
        assert_eq!(
            config.telemetry.as_ref().map(|t| t.addr),
            Some("127.0.0.1:9000".parse::<SocketAddr>().expect("valid addr"))
        );

        let source = &config.sources[0];
        assert_eq!(source.id.as_deref(), Some("heartbeat"));
        assert_eq!(source.interval, Some(Duration::from_secs(1)));
        assert_eq!(source.collection_jitter, None);
        assert_eq!(source.filter.field_drop, ["debug*"]);

        let processor = &config.processors[0];
        assert_eq!(
            processor.settings(),
            processor::Settings {
                workers: 4,
                ordered: false,
                queue_size: 1_000,
            }
        );

        let aggregator = &config.aggregators[0];
        assert_eq!(aggregator.period, Duration::from_secs(60));
        assert_eq!(aggregator.delay, Duration::from_millis(100));
        assert!(aggregator.drop_original);

        assert_eq!(config.outputs[0].batch_size(&config.agent), 5);
        assert_eq!(config.outputs[1].batch_size(&config.agent), 10);
        assert_eq!(config.outputs[1].options, serde_yaml::Value::Null);
        Ok(())
    }

    #[test]
    fn empty_document_takes_defaults() -> Result<(), Error> {
        let config = Config::parse("{}")?;
        assert_eq!(config.agent, Agent::default());
        assert!(config.telemetry.is_none());
        assert!(config.sources.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("agent:\n  intervall: 5s\n").is_err());
        assert!(Config::parse("outputs:\n  - plugin: discard\n    flush: 1s\n").is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let yaml = "outputs:\n  - plugin: discard\n    id: a\n  - plugin: file\n    id: a\n";
        let err = Config::parse(yaml).expect_err("duplicate accepted");
        assert!(matches!(err, Error::DuplicateId { section: "output", .. }));
        assert!(err.kind().is_fatal());

        let yaml = "sources:\n  - plugin: constant\n    id: a\n\
                    outputs:\n  - plugin: discard\n    id: a\n";
        assert!(Config::parse(yaml).is_ok());
    }

    #[test]
    fn buffer_must_hold_a_batch() {
        let yaml = "outputs:\n  - plugin: discard\n    metric_batch_size: 10\n    metric_buffer_limit: 5\n";
        assert!(matches!(
            Config::parse(yaml),
            Err(Error::BufferBelowBatch { limit: 5, batch: 10, .. })
        ));
        let yaml = "outputs:\n  - plugin: discard\n    metric_batch_size: 0\n";
        assert!(matches!(Config::parse(yaml), Err(Error::Zero { .. })));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(matches!(
            Config::parse("agent:\n  interval: 0s\n"),
            Err(Error::Zero { .. })
        ));
        assert!(matches!(
            Config::parse("aggregators:\n  - plugin: merge\n    period: 0s\n"),
            Err(Error::Zero { .. })
        ));
    }

    fn write(dir: &Path, name: &str, contents: &str) -> Result<(), Error> {
        let mut file = fs::File::create(dir.join(name))?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    #[test]
    fn load_single_file_works() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir()?;
        write(temp_dir.path(), "plumb.yaml", FULL)?;
        let config = load_config_from_path(&temp_dir.path().join("plumb.yaml"))?;
        assert_eq!(config, Config::parse(FULL)?);
        Ok(())
    }

    #[test]
    fn load_directory_composes_in_name_order() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir()?;
        write(temp_dir.path(), "20-second.yaml", "processors:\n  - plugin: clone\n")?;
        write(
            temp_dir.path(),
            "10-first.yaml",
            "agent:\n  interval: 1s\nprocessors:\n  - plugin: tags\n",
        )?;
        write(temp_dir.path(), ".hidden.yaml", "telemetry: nonsense\n")?;
        write(temp_dir.path(), "notes.txt", "not yaml at all: [")?;

        let config = load_config_from_path(temp_dir.path())?;
        assert_eq!(config.agent.interval, Duration::from_secs(1));
        let plugins: Vec<&str> = config.processors.iter().map(|p| p.plugin.as_str()).collect();
        assert_eq!(plugins, ["tags", "clone"]);
        Ok(())
    }

    #[test]
    fn load_directory_rejects_conflicts() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir()?;
        write(temp_dir.path(), "a.yaml", "agent:\n  interval: 1s\n")?;
        write(temp_dir.path(), "b.yaml", "agent:\n  interval: 2s\n")?;
        assert!(matches!(
            load_config_from_path(temp_dir.path()),
            Err(Error::ConflictingAgent)
        ));
        Ok(())
    }

    #[test]
    fn load_directory_validates_the_composition() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir()?;
        write(temp_dir.path(), "a.yaml", "outputs:\n  - plugin: discard\n    id: x\n")?;
        write(temp_dir.path(), "b.yaml", "outputs:\n  - plugin: file\n    id: x\n")?;
        assert!(matches!(
            load_config_from_path(temp_dir.path()),
            Err(Error::DuplicateId { .. })
        ));
        Ok(())
    }

    #[test]
    fn empty_directory_returns_error() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir()?;
        assert!(matches!(
            load_config_from_path(temp_dir.path()),
            Err(Error::NoConfigFiles(_))
        ));
        Ok(())
    }

    #[test]
    fn name_override_wins_in_either_declaration_order() {
        for yaml in [
            "sources:\n  - plugin: constant\n    name_override: X\n    name_prefix: pre_\n    name_suffix: _suf\n",
            "sources:\n  - plugin: constant\n    name_prefix: pre_\n    name_suffix: _suf\n    name_override: X\n",
        ] {
            let config = Config::parse(yaml).expect("valid config");
            let source = &config.sources[0];
            let rename = crate::rename::Rename::new(
                source.name_override.clone(),
                source.name_prefix.clone(),
                source.name_suffix.clone(),
            );
            let mut metric = plumb_metric::Metric::new(
                "m",
                [("v", 1)],
                plumb_metric::Timestamp::EPOCH,
            )
            .expect("valid metric");
            rename.apply(&mut metric);
            assert_eq!(metric.name(), "X");
        }
    }

    proptest! {
        #[test]
        fn duplicate_ids_always_rejected(id in "[a-z]{1,8}", before in 0usize..3, after in 0usize..3) {
            let mut yaml = String::from("sources:\n");
            for n in 0..before {
                yaml.push_str(&format!("  - plugin: constant\n    id: before{n}\n"));
            }
            yaml.push_str(&format!("  - plugin: constant\n    id: {id}\n"));
            for n in 0..after {
                yaml.push_str(&format!("  - plugin: constant\n    id: after{n}\n"));
            }
            yaml.push_str(&format!("  - plugin: constant\n    id: {id}\n"));
            let is_duplicate = matches!(Config::parse(&yaml), Err(Error::DuplicateId { .. }));
            prop_assert!(is_duplicate);
        }
    }
}
