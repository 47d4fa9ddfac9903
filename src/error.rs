//! Unified error handling for the bakery crate
//!
//! Every fallible operation in the library returns [`Error`]. Callers key
//! their retry logic off the [`ErrorCategory`], and the HTTP layer maps each
//! category to a distinct status code.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bakery::error::{Error, ErrorCategory};
//!
//! fn handle(err: Error) {
//!     match err.category() {
//!         ErrorCategory::NotFound => eprintln!("missing: {err}"),
//!         _ if err.is_recoverable() => eprintln!("retry later: {err}"),
//!         _ => eprintln!("fatal: {err}"),
//!     }
//! }
//! ```

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::models::NodeStatus;

/// Kind of resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Node,
    Disk,
    Template,
    File,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Node => "node",
            Self::Disk => "disk",
            Self::Template => "template",
            Self::File => "file",
        };
        f.write_str(label)
    }
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unknown node, disk, template or file
    NotFound,
    /// Operation conflicts with the current state of a resource
    Conflict,
    /// Caller supplied an invalid value
    Validation,
    /// Partition mapping and mount failures
    Image,
    /// Database and filesystem errors
    Storage,
    /// External processes (power controller, copy, export reload)
    External,
    /// Invariant violations inside the crate
    Other,
}

/// Unified error type for the bakery crate
#[derive(Error, Debug)]
pub enum Error {
    /// Partition mapping failed or yielded fewer than two partitions
    #[error("Failed to map partitions of {}: {reason}", image.display())]
    Map { image: PathBuf, reason: String },

    /// Both filesystem types failed and the device was not already mounted
    #[error("Failed to mount {} on {}: {reason}", device.display(), target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        reason: String,
    },

    /// A recorded mount point could not be unmounted
    #[error("Failed to unmount {}: {reason}", target.display())]
    Unmount { target: PathBuf, reason: String },

    /// Disk size must be positive
    #[error("Invalid disk size {0} MiB: size must be larger than 0")]
    InvalidSize(i64),

    /// Unknown node, disk, template or file
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    /// Operation attempted against a node in the wrong status
    #[error("Cannot {operation} node {node} while it is {status}")]
    InvalidState {
        node: String,
        status: NodeStatus,
        operation: &'static str,
    },

    /// Attempt to remove a resource that is still in use
    #[error("{kind} {id} is protected: {reason}")]
    ProtectedResource {
        kind: ResourceKind,
        id: String,
        reason: String,
    },

    /// External power process failed or returned unexpected output
    #[error("Power action '{action}' failed for node {node}: {reason}")]
    PowerAction {
        node: String,
        action: String,
        reason: String,
    },

    /// Node store read/write failure
    #[error("Persistence error: {reason}")]
    Persistence {
        reason: String,
        #[source]
        cause: Option<rusqlite::Error>,
    },

    /// Bulk copy of a directory tree failed
    #[error("Failed to copy {} to {}: {reason}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    /// Export file could not be regenerated
    #[error("Failed to regenerate exports at {}: {reason}", path.display())]
    Export { path: PathBuf, reason: String },

    /// External command could not be spawned, timed out or exited non-zero
    #[error("Command '{program}' failed: {reason}")]
    Command { program: String, reason: String },

    /// Relative path escapes its disk folder
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Power request encoding
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a protected-resource error
    pub fn protected(kind: ResourceKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtectedResource {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a persistence error without an underlying database error
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Create a command error
    pub fn command(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            reason: reason.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidState { .. } | Self::ProtectedResource { .. } => ErrorCategory::Conflict,
            Self::InvalidSize(_) | Self::InvalidPath(_) | Self::Json(_) => {
                ErrorCategory::Validation
            }
            Self::Map { .. } | Self::Mount { .. } | Self::Unmount { .. } => ErrorCategory::Image,
            Self::Persistence { .. } | Self::Io(_) => ErrorCategory::Storage,
            Self::PowerAction { .. }
            | Self::Copy { .. }
            | Self::Export { .. }
            | Self::Command { .. } => ErrorCategory::External,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Unmount { .. }
            | Self::Mount { .. }
            | Self::PowerAction { .. }
            | Self::Copy { .. }
            | Self::Export { .. }
            | Self::Command { .. }
            | Self::Io(_) => true,
            Self::Map { .. }
            | Self::InvalidSize(_)
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::ProtectedResource { .. }
            | Self::Persistence { .. }
            | Self::InvalidPath(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence {
            reason: err.to_string(),
            cause: Some(err),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
