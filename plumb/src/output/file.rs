//! The `file` sink.
//!
//! Appends every metric as a JSON line to a file, or to standard output when
//! the path is `-`.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use plumb_metric::{Metric, json::Serializer};
use serde::Deserialize;
use tokio::{
    fs::OpenOptions,
    io::{self, AsyncWrite, AsyncWriteExt},
};
use tracing::info;

use crate::{error::BoxError, output::Sink};

/// Errors produced by [`File`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failed.
    #[error(transparent)]
    Json(#[from] plumb_metric::json::Error),
    /// A write came before `connect`.
    #[error("file sink is not connected")]
    NotConnected,
}

fn default_path() -> PathBuf {
    PathBuf::from("-")
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`File`]
pub struct Config {
    /// Path to append to, `-` for standard output.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Unit of the serialized timestamp, rounded down to a power of ten.
    #[serde(default, with = "humantime_serde")]
    pub timestamp_units: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: default_path(),
            timestamp_units: None,
        }
    }
}

/// The file sink.
pub struct File {
    path: PathBuf,
    serializer: Serializer,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("serializer", &self.serializer)
            .field("connected", &self.writer.is_some())
            .finish()
    }
}

impl File {
    /// Create a new [`File`] sink. Nothing is opened until `connect`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            path: config.path,
            serializer: Serializer::new(config.timestamp_units.unwrap_or_default()),
            writer: None,
        }
    }

    fn is_stdout(&self) -> bool {
        self.path.as_os_str() == "-"
    }
}

#[async_trait]
impl Sink for File {
    async fn connect(&mut self) -> Result<(), BoxError> {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = if self.is_stdout() {
            Box::new(io::stdout())
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(Error::Io)?;
            info!(path = %self.path.display(), "file sink opened");
            Box::new(file)
        };
        self.writer = Some(writer);
        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> Result<(), BoxError> {
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        let mut payload = Vec::new();
        self.serializer
            .write_lines(&mut payload, metrics)
            .map_err(Error::Json)?;
        writer.write_all(&payload).await.map_err(Error::Io)?;
        writer.flush().await.map_err(Error::Io)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await.map_err(Error::Io)?;
            if !self.is_stdout() {
                writer.shutdown().await.map_err(Error::Io)?;
            }
        }
        Ok(())
    }
}
