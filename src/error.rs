//! Error types for the buckos-collector crate.

use std::path::PathBuf;
use thiserror::Error;

use crate::severity::Severity;

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while selecting hosts, collecting reports or
/// assembling the archive.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The inventory could not be fetched.
    #[error("Failed to fetch inventory: {0}")]
    Inventory(String),

    /// A host, cluster or datacenter pattern could not be compiled.
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Hosts requested by name that are not part of the fleet.
    #[error(
        "The following hosts are not listed as hypervisors: {}. \
         Known hypervisors can be listed using the list command",
        .0.join(",")
    )]
    UnknownHosts(Vec<String>),

    /// The staging area could not be prepared.
    #[error("Staging error: {0}")]
    Staging(String),

    /// A command exited unsuccessfully.
    #[error("Command failed on {host}: {command}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        stderr: String,
    },

    /// A command could not be spawned.
    #[error("Failed to execute {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// The report tool output did not name an artifact.
    #[error("Could not parse report output to determine filename")]
    ReportOutput,

    /// Archive assembly failed.
    #[error("Failed to create archive: {0}")]
    Archive(String),

    /// Failed to read or write a file or directory.
    #[error("Failed to access {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Severity this error contributes to the run when it escapes a phase.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Inventory(_) | Error::CommandFailed { .. } | Error::Spawn { .. } => {
                Severity::Warning
            }
            _ => Severity::Critical,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            path: PathBuf::new(),
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
