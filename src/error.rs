//! Error types for the hybrid overlay node agent.

use std::time::Duration;

/// Result type alias used throughout the agent.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while programming the external bridge or talking to the
/// cluster.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device command ran and exited unsuccessfully.
    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// A device command could not be started at all.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A device command did not finish in time.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Local network metadata needed for bootstrap is missing or malformed.
    #[error("failed to read {what}: {reason}")]
    Metadata { what: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The cluster watch stream could not be established.
    #[error("watch failed: {0}")]
    Watch(String),
}

impl Error {
    /// True for device failures that only report the object is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Command { stderr, .. } => stderr.contains("already exists"),
            _ => false,
        }
    }

    pub(crate) fn metadata(what: impl Into<String>, reason: impl ToString) -> Self {
        Error::Metadata {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}
