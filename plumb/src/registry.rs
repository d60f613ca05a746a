//! The plugin registry.
//!
//! Maps plugin names to constructors for sources, sinks, processors and
//! aggregators. A [`Registry`] is built once, handed to the scheduler and
//! consulted only while the pipeline is being assembled; nothing about it is
//! global.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;

use crate::{
    aggregator::{self, Aggregator},
    error::{BoxError, ErrorKind},
    output::{self, Sink},
    processor::{self, Processor},
    source::{self, Source},
};

/// Errors produced by [`Registry`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No plugin of this name is registered.
    #[error("unknown {kind} plugin {name:?}")]
    UnknownPlugin {
        /// Plugin class
        kind: &'static str,
        /// Requested name
        name: String,
    },
    /// The plugin rejected its options.
    #[error("invalid options for {kind} plugin {name:?}: {source}")]
    Options {
        /// Plugin class
        kind: &'static str,
        /// Plugin name
        name: String,
        /// Underlying error
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalConfig
    }
}

type Factory<T> = Box<dyn Fn(&serde_yaml::Value) -> Result<T, BoxError> + Send + Sync>;

/// Deserialize plugin options. Absent options read as an empty mapping.
///
/// # Errors
///
/// Returns an error if `value` does not match `T`.
pub fn options<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<T, BoxError> {
    let value = match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        other => other.clone(),
    };
    Ok(serde_yaml::from_value(value)?)
}

/// Constructors for every known plugin, by name.
#[derive(Default)]
pub struct Registry {
    sources: FxHashMap<String, Factory<Box<dyn Source>>>,
    sinks: FxHashMap<String, Factory<Box<dyn Sink>>>,
    processors: FxHashMap<String, Factory<Arc<dyn Processor>>>,
    aggregators: FxHashMap<String, Factory<Box<dyn Aggregator>>>,
}

fn sorted_names<T>(factories: &FxHashMap<String, T>) -> Vec<&str> {
    let mut names: Vec<&str> = factories.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sources", &sorted_names(&self.sources))
            .field("sinks", &sorted_names(&self.sinks))
            .field("processors", &sorted_names(&self.processors))
            .field("aggregators", &sorted_names(&self.aggregators))
            .finish()
    }
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every plugin that ships with plumb.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source("constant", |value| {
            let config: source::constant::Config = options(value)?;
            Ok(Box::new(source::constant::Constant::new(config)?))
        });
        registry.register_sink("discard", |value| {
            let _: output::discard::Config = options(value)?;
            Ok(Box::new(output::discard::Discard))
        });
        registry.register_sink("file", |value| {
            let config: output::file::Config = options(value)?;
            Ok(Box::new(output::file::File::new(config)))
        });
        registry.register_processor("clone", |value| {
            let config: processor::clone::Config = options(value)?;
            Ok(Arc::new(processor::clone::Cloner::new(config)))
        });
        registry.register_processor("tags", |value| {
            let config: processor::tags::Config = options(value)?;
            Ok(Arc::new(processor::tags::Tags::new(config)))
        });
        registry.register_aggregator("merge", |value| {
            let _: aggregator::merge::Config = options(value)?;
            Ok(Box::new(aggregator::merge::Merge::default()))
        });
        registry.register_aggregator("final", |value| {
            let config: aggregator::final_value::Config = options(value)?;
            Ok(Box::new(aggregator::final_value::Final::new(config)))
        });
        registry
    }

    /// Register a source constructor, replacing any of the same name.
    pub fn register_source<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_yaml::Value) -> Result<Box<dyn Source>, BoxError> + Send + Sync + 'static,
    {
        self.sources.insert(name.to_string(), Box::new(factory));
    }

    /// Register a sink constructor, replacing any of the same name.
    pub fn register_sink<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_yaml::Value) -> Result<Box<dyn Sink>, BoxError> + Send + Sync + 'static,
    {
        self.sinks.insert(name.to_string(), Box::new(factory));
    }

    /// Register a processor constructor, replacing any of the same name.
    pub fn register_processor<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_yaml::Value) -> Result<Arc<dyn Processor>, BoxError> + Send + Sync + 'static,
    {
        self.processors.insert(name.to_string(), Box::new(factory));
    }

    /// Register an aggregator constructor, replacing any of the same name.
    pub fn register_aggregator<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_yaml::Value) -> Result<Box<dyn Aggregator>, BoxError> + Send + Sync + 'static,
    {
        self.aggregators.insert(name.to_string(), Box::new(factory));
    }

    /// Construct the source `name` from `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlugin`] for an unregistered name and
    /// [`Error::Options`] if the constructor fails.
    pub fn source(&self, name: &str, options: &serde_yaml::Value) -> Result<Box<dyn Source>, Error> {
        build(&self.sources, "source", name, options)
    }

    /// Construct the sink `name` from `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlugin`] for an unregistered name and
    /// [`Error::Options`] if the constructor fails.
    pub fn sink(&self, name: &str, options: &serde_yaml::Value) -> Result<Box<dyn Sink>, Error> {
        build(&self.sinks, "output", name, options)
    }

    /// Construct the processor `name` from `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlugin`] for an unregistered name and
    /// [`Error::Options`] if the constructor fails.
    pub fn processor(
        &self,
        name: &str,
        options: &serde_yaml::Value,
    ) -> Result<Arc<dyn Processor>, Error> {
        build(&self.processors, "processor", name, options)
    }

    /// Construct the aggregator `name` from `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlugin`] for an unregistered name and
    /// [`Error::Options`] if the constructor fails.
    pub fn aggregator(
        &self,
        name: &str,
        options: &serde_yaml::Value,
    ) -> Result<Box<dyn Aggregator>, Error> {
        build(&self.aggregators, "aggregator", name, options)
    }
}

fn build<T>(
    factories: &FxHashMap<String, Factory<T>>,
    kind: &'static str,
    name: &str,
    options: &serde_yaml::Value,
) -> Result<T, Error> {
    let factory = factories.get(name).ok_or_else(|| Error::UnknownPlugin {
        kind,
        name: name.to_string(),
    })?;
    factory(options).map_err(|source| Error::Options {
        kind,
        name: name.to_string(),
        source,
    })
}
