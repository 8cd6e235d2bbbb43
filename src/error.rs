//! Error types for docs-sandbox.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for sandbox provisioning and repo sync.
#[derive(Error, Debug)]
pub enum Error {
    /// A sandbox API call failed.
    #[error("sandbox {op} failed: {reason}")]
    Sandbox { op: &'static str, reason: String },

    /// The sandbox API answered with a non-success status.
    #[error("{method} {url} returned {status}: {body}")]
    Api {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// A local child process could not be spawned or waited on.
    #[error("process {program} failed: {reason}")]
    Process { program: String, reason: String },

    /// IO error on the local volume.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error talking to the sandbox API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The path is not usable as a volume root.
    #[error("invalid volume path: {0}")]
    InvalidPath(PathBuf),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested repository is not in the registry.
    #[error("unknown repository '{name}', valid: {valid}")]
    UnknownRepo { name: String, valid: String },
}

impl Error {
    /// Shorthand for a failed sandbox operation.
    pub fn sandbox(op: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Sandbox {
            op,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for docs-sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
