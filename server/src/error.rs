//! Error types shared across the session runtime.
//!
//! Each failure class from the runtime gets its own enum so callers can match
//! on what actually went wrong: a closed pipe is routine, a build failure is
//! reported back to the submitter verbatim, a probe failure is just logged.

use axum::http::StatusCode;
use thiserror::Error;

/// A [`crate::sessions::pipe::StreamPipe`] operation hit a closed pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe closed")]
    Closed,
}

/// Failure of a generic byte stream (pipe, process stdio, socket).
#[derive(Debug, Error)]
pub enum StreamError {
    /// End of stream, or the stream was closed underneath us.
    #[error("stream closed")]
    Closed,
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PipeError> for StreamError {
    fn from(_: PipeError) -> Self {
        Self::Closed
    }
}

/// Malformed or unsafe bundle archive.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("bundle has no manifest.json")]
    MissingManifest,
    #[error("invalid manifest.json: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unsafe path in bundle: {0}")]
    UnsafePath(String),
    #[error("bundle I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a submitted source bundle could not be turned into an artifact.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid source bundle: {0}")]
    Bundle(#[from] BundleError),
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
    /// Toolchain diagnostics, passed through untouched.
    #[error("{0}")]
    Failed(String),
    #[error("package {0} not found in bundle")]
    MissingPackage(String),
    #[error("build timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("build produced no executable")]
    NoArtifact,
    #[error("failed to run toolchain {0}: {1}")]
    Toolchain(String, std::io::Error),
    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// HTTP status used when this error is reported to the submitter.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Bundle(_) | Self::UnsupportedCommand(_) | Self::MissingPackage(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Failed(_) | Self::NoArtifact => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Toolchain(..) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The built program could not be launched.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid artifact: {0}")]
    Bundle(#[from] BundleError),
    #[error("artifact contains no runnable program")]
    NoProgram,
    #[error("failed to spawn program: {0}")]
    Spawn(std::io::Error),
    #[error("failed to prepare run directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("session closed before the program started")]
    SessionClosed,
}

/// A single port-discovery scan failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process introspection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Registry refused to allocate a session.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session limit reached (max {0})")]
    Full(usize),
}
