//! The `constant` source.
//!
//! Emits one configured metric on every gather. Useful as a heartbeat and for
//! exercising a pipeline end to end.

use async_trait::async_trait;
use plumb_metric::{FieldValue, MetricKind};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{accumulator::Accumulator, error::BoxError, source::Source};

/// Errors produced by [`Constant`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The measurement name was empty.
    #[error("measurement must not be empty")]
    EmptyMeasurement,
    /// No fields were configured.
    #[error("at least one field is required")]
    NoFields,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Constant`]
pub struct Config {
    /// Name of the emitted metric.
    pub measurement: String,
    /// Fields of the emitted metric.
    pub fields: FxHashMap<String, FieldValue>,
    /// Tags of the emitted metric.
    #[serde(default)]
    pub tags: FxHashMap<String, String>,
    /// Kind of the emitted metric.
    #[serde(default)]
    pub kind: MetricKind,
}

#[derive(Debug)]
/// The constant source.
pub struct Constant {
    measurement: String,
    fields: Vec<(String, FieldValue)>,
    tags: Vec<(String, String)>,
    kind: MetricKind,
}

impl Constant {
    /// Create a new [`Constant`] source.
    ///
    /// # Errors
    ///
    /// Returns an error if the measurement is empty or no fields are given.
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.measurement.is_empty() {
            return Err(Error::EmptyMeasurement);
        }
        if config.fields.is_empty() {
            return Err(Error::NoFields);
        }
        let mut fields: Vec<_> = config.fields.into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            measurement: config.measurement,
            fields,
            tags: config.tags.into_iter().collect(),
            kind: config.kind,
        })
    }
}

#[async_trait]
impl Source for Constant {
    async fn gather(&mut self, acc: &Accumulator) -> Result<(), BoxError> {
        let fields = self.fields.iter().cloned();
        let tags = self.tags.iter().cloned();
        match self.kind {
            MetricKind::Untyped => acc.add_fields(&self.measurement, fields, tags, None).await,
            MetricKind::Counter => acc.add_counter(&self.measurement, fields, tags, None).await,
            MetricKind::Gauge => acc.add_gauge(&self.measurement, fields, tags, None).await,
            MetricKind::Summary => acc.add_summary(&self.measurement, fields, tags, None).await,
            MetricKind::Histogram => {
                acc.add_histogram(&self.measurement, fields, tags, None)
                    .await;
            }
        }
        Ok(())
    }
}
