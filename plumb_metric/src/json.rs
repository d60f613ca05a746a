//! JSON form of a [`Metric`], meant to be written and read line by line.
//!
//! Each line is an object `{"name", "tags", "fields", "timestamp"}`. The
//! timestamp is an integer count of the serializer's unit since the Unix
//! epoch. JSON cannot represent NaN or infinities, so float fields holding
//! them are left out of the line.

use std::{collections::BTreeMap, io::Write, time::Duration};

use serde::Serialize;

use crate::{FieldValue, Metric};

/// JSON serializer errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO errors during write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
/// The structure of a serialized line.
pub struct Line<'a> {
    /// Metric name
    pub name: &'a str,
    /// Tags, sorted by key
    pub tags: BTreeMap<&'a str, &'a str>,
    /// Representable fields, sorted by key
    pub fields: BTreeMap<&'a str, &'a FieldValue>,
    /// Time since the Unix epoch in the serializer's unit
    pub timestamp: i64,
}

/// Turns metrics into JSON.
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    unit: Duration,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// The largest power of ten nanoseconds not greater than `unit`. Zero means
/// one second.
fn power_of_ten(unit: Duration) -> Duration {
    if unit.is_zero() {
        return Duration::from_secs(1);
    }
    let mut candidate = Duration::from_nanos(1);
    while candidate * 10 <= unit {
        candidate *= 10;
    }
    candidate
}

impl Serializer {
    /// Create a serializer writing timestamps in `unit`, rounded down to a
    /// power of ten nanoseconds.
    #[must_use]
    pub fn new(unit: Duration) -> Self {
        Self {
            unit: power_of_ten(unit),
        }
    }

    /// The effective timestamp unit.
    #[must_use]
    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Borrow `metric` as a [`Line`].
    #[must_use]
    pub fn line<'a>(&self, metric: &'a Metric) -> Line<'a> {
        let unit = i64::try_from(self.unit.as_nanos()).unwrap_or(i64::MAX);
        Line {
            name: metric.name(),
            tags: metric
                .tags()
                .iter()
                .map(|tag| (tag.key.as_str(), tag.value.as_str()))
                .collect(),
            fields: metric
                .fields()
                .iter()
                .filter(|field| !field.value.is_non_finite())
                .map(|field| (field.key.as_str(), &field.value))
                .collect(),
            timestamp: metric.timestamp().as_nanos().div_euclid(unit),
        }
    }

    /// Write each metric to `writer` as its own line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write_lines<W: Write>(&self, writer: &mut W, metrics: &[Metric]) -> Result<(), Error> {
        for metric in metrics {
            serde_json::to_writer(&mut *writer, &self.line(metric))?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}
