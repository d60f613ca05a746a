//! The `discard` sink. Accepts every write and keeps nothing.

use async_trait::async_trait;
use plumb_metric::Metric;
use serde::Deserialize;

use crate::{error::BoxError, output::Sink};

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Discard`]
pub struct Config {}

#[derive(Debug, Default, Clone, Copy)]
/// The discard sink.
pub struct Discard;

#[async_trait]
impl Sink for Discard {
    async fn write(&mut self, _metrics: &[Metric]) -> Result<(), BoxError> {
        Ok(())
    }
}
