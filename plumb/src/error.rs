//! Error classification shared by every plumb component.
//!
//! Each module carries its own `Error` enum. Recovery decisions are not made
//! by inspecting those enums or their messages but by their [`ErrorKind`].

use std::fmt;

/// Failures that cross a plugin boundary: sources, sinks and option parsing.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The closed set of failure classes in a plumb pipeline.
pub enum ErrorKind {
    /// A sink write failed. The batch goes back to its buffer and is retried
    /// on the next flush.
    TransientWrite,
    /// A buffer was full and dropped its oldest metrics. Counted, never
    /// raised.
    Overflow,
    /// A filter rejected a metric. Counted, never raised.
    FilterReject,
    /// The configuration cannot run. Raised before the scheduler starts.
    FatalConfig,
}

impl ErrorKind {
    /// Whether an error of this kind must stop the agent.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::FatalConfig)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransientWrite => "transient_write",
            ErrorKind::Overflow => "overflow",
            ErrorKind::FilterReject => "filter_reject",
            ErrorKind::FatalConfig => "fatal_config",
        };
        f.write_str(name)
    }
}
