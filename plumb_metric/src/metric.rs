use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::OnceLock,
};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Errors produced when constructing a [`Metric`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The metric name was empty.
    #[error("metric name must not be empty")]
    EmptyName,
    /// The metric carried no fields.
    #[error("metric must carry at least one field")]
    NoFields,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// The kinds of metrics a [`Metric`] may represent.
pub enum MetricKind {
    /// No declared type.
    #[default]
    Untyped,
    /// A monotonically increasing value.
    Counter,
    /// A point-in-time value.
    Gauge,
    /// Pre-computed quantiles of a distribution.
    Summary,
    /// Bucketed counts of a distribution.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Untyped => "untyped",
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Summary => "summary",
            MetricKind::Histogram => "histogram",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
/// The value of a metric field.
pub enum FieldValue {
    /// A signed integer, 64 bits wide
    Int(i64),
    /// An unsigned integer, 64 bits wide
    Uint(u64),
    /// A floating point, 64 bits wide
    Float(f64),
    /// A boolean
    Bool(bool),
    /// A string
    String(String),
}

impl FieldValue {
    /// Get an f64 representation of this value, if it is numeric. Extremely
    /// large integers lose precision.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(int) => Some(*int as f64),
            FieldValue::Uint(uint) => Some(*uint as f64),
            FieldValue::Float(float) => Some(*float),
            FieldValue::Bool(_) | FieldValue::String(_) => None,
        }
    }

    /// Whether this is a float that is NaN or infinite.
    #[must_use]
    pub fn is_non_finite(&self) -> bool {
        matches!(self, FieldValue::Float(float) if !float.is_finite())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(int) => write!(f, "{int}"),
            FieldValue::Uint(uint) => write!(f, "{uint}"),
            FieldValue::Float(float) => write!(f, "{float}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::String(s) => f.write_str(s),
        }
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value.into())
                }
            }
        )*
    };
}

field_value_from! {
    i64 => Int,
    i32 => Int,
    u64 => Uint,
    u32 => Uint,
    f64 => Float,
    f32 => Float,
    bool => Bool,
    String => String,
    &str => String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A single tag of a [`Metric`].
pub struct Tag {
    /// Tag name
    pub key: String,
    /// Tag value
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
/// A single field of a [`Metric`].
pub struct Field {
    /// Field name
    pub key: String,
    /// Field value
    pub value: FieldValue,
}

/// One observation of a series.
///
/// Tags are kept sorted by key so iteration, hashing and serialization are
/// deterministic. Fields keep the order they were added in. Keys of both are
/// unique: adding an existing key replaces its value.
#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    tags: Vec<Tag>,
    fields: Vec<Field>,
    timestamp: Timestamp,
    kind: MetricKind,
    series_key: OnceLock<u64>,
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.tags == other.tags
            && self.fields == other.fields
            && self.timestamp == other.timestamp
            && self.kind == other.kind
    }
}

impl Metric {
    /// Construct an untyped metric with no tags.
    ///
    /// Duplicate field keys resolve to the last value given.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is empty or `fields` yields nothing.
    pub fn new<N, K, V, I>(name: N, fields: I, timestamp: Timestamp) -> Result<Self, Error>
    where
        N: Into<String>,
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        let mut metric = Self {
            name,
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
            kind: MetricKind::Untyped,
            series_key: OnceLock::new(),
        };
        for (key, value) in fields {
            metric.add_field(key, value);
        }
        if metric.fields.is_empty() {
            return Err(Error::NoFields);
        }
        Ok(metric)
    }

    /// Builder form of [`Metric::add_tag`].
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_tag(key, value);
        self
    }

    /// Builder form of [`Metric::add_tag`] over many tags.
    #[must_use]
    pub fn with_tags<K, V, I>(mut self, tags: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in tags {
            self.add_tag(key, value);
        }
        self
    }

    /// Builder form of [`Metric::set_kind`].
    #[must_use]
    pub fn with_kind(mut self, kind: MetricKind) -> Self {
        self.kind = kind;
        self
    }

    /// The metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the metric name. An empty name is ignored.
    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name.is_empty() {
            return;
        }
        self.name = name;
        self.series_key.take();
    }

    /// Prepend `prefix` to the metric name.
    pub fn add_prefix(&mut self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        self.name.insert_str(0, prefix);
        self.series_key.take();
    }

    /// Append `suffix` to the metric name.
    pub fn add_suffix(&mut self, suffix: &str) {
        if suffix.is_empty() {
            return;
        }
        self.name.push_str(suffix);
        self.series_key.take();
    }

    /// The tags, sorted by key.
    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn tag_index(&self, key: &str) -> Result<usize, usize> {
        self.tags.binary_search_by(|tag| tag.key.as_str().cmp(key))
    }

    /// The value of tag `key`, if present.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tag_index(key)
            .ok()
            .map(|idx| self.tags[idx].value.as_str())
    }

    /// Whether tag `key` is present.
    #[must_use]
    pub fn has_tag(&self, key: &str) -> bool {
        self.tag_index(key).is_ok()
    }

    /// Set tag `key` to `value`, replacing any existing value.
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.tag_index(&key) {
            Ok(idx) => self.tags[idx].value = value,
            Err(idx) => self.tags.insert(idx, Tag { key, value }),
        }
        self.series_key.take();
    }

    /// Remove tag `key`, returning its value.
    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        let idx = self.tag_index(key).ok()?;
        self.series_key.take();
        Some(self.tags.remove(idx).value)
    }

    /// Keep only the tags for which `keep` returns true.
    pub fn retain_tags<F>(&mut self, keep: F)
    where
        F: FnMut(&Tag) -> bool,
    {
        let before = self.tags.len();
        self.tags.retain(keep);
        if self.tags.len() != before {
            self.series_key.take();
        }
    }

    /// The fields, in the order they were added.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The value of field `key`, if present.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| &field.value)
    }

    /// Set field `key` to `value`, replacing any existing value in place.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|field| field.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { key, value }),
        }
    }

    /// Keep only the fields for which `keep` returns true.
    pub fn retain_fields<F>(&mut self, keep: F)
    where
        F: FnMut(&Field) -> bool,
    {
        self.fields.retain(keep);
    }

    /// The observation time.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Replace the observation time.
    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    /// The metric kind.
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Replace the metric kind.
    pub fn set_kind(&mut self, kind: MetricKind) {
        self.kind = kind;
    }

    /// Identity of the series this metric belongs to.
    ///
    /// Derived from the name and the sorted tag set only; fields, timestamp
    /// and kind do not contribute. Computed once and cached until the name or
    /// a tag changes.
    #[must_use]
    pub fn series_key(&self) -> u64 {
        *self.series_key.get_or_init(|| {
            let mut hasher = FxHasher::default();
            self.name.hash(&mut hasher);
            for tag in &self.tags {
                hasher.write_u8(b'\n');
                tag.key.hash(&mut hasher);
                hasher.write_u8(b'\n');
                tag.value.hash(&mut hasher);
            }
            hasher.finish()
        })
    }
}
