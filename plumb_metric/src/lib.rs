//! The plumb metric model
//!
//! Everything that moves through a plumb pipeline is a [`Metric`]: a name, a
//! sorted set of string tags, at least one typed field, a nanosecond
//! [`Timestamp`] and a [`MetricKind`]. Metrics that share a name and tag set
//! belong to the same series; [`Metric::series_key`] identifies it and
//! [`SeriesGrouper`] folds single-field observations of a series back into
//! multi-field metrics.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub mod json;
mod metric;
pub mod series;
mod timestamp;

pub use metric::{Error, Field, FieldValue, Metric, MetricKind, Tag};
pub use series::SeriesGrouper;
pub use timestamp::Timestamp;
