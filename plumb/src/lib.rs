//! The plumb metrics agent.
//!
//! This library supports the plumb binary found elsewhere in this project.
//! Sources gather metrics on their own schedules, processors transform them,
//! aggregators fold them over time windows and outputs buffer and write them
//! in batches. The [`scheduler::Scheduler`] builds that pipeline from a
//! [`config::Config`] and a [`registry::Registry`] of plugins and drives it
//! until shutdown.

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
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod accumulator;
pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
pub mod output;
pub mod parallel;
pub mod processor;
pub mod registry;
pub mod rename;
pub mod scheduler;
pub mod source;
