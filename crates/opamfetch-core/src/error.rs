//! Error types for the opam resolution and fetch pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Stable error codes, one per [`OpamError`] variant.
pub mod codes {
    pub const OPAM_OFFLINE: &str = "OPAM_OFFLINE";
    pub const OPAM_PACKAGE_NOT_FOUND: &str = "OPAM_PACKAGE_NOT_FOUND";
    pub const OPAM_NO_COMPATIBLE_VERSION: &str = "OPAM_NO_COMPATIBLE_VERSION";
    pub const OPAM_CHECKSUM_MISMATCH: &str = "OPAM_CHECKSUM_MISMATCH";
    pub const OPAM_PROCESS_FAILED: &str = "OPAM_PROCESS_FAILED";
    pub const OPAM_HTTP_ERROR: &str = "OPAM_HTTP_ERROR";
    pub const OPAM_PARSE_ERROR: &str = "OPAM_PARSE_ERROR";
    pub const OPAM_RANGE_INVALID: &str = "OPAM_RANGE_INVALID";
    pub const OPAM_ARCHIVE_ERROR: &str = "OPAM_ARCHIVE_ERROR";
    pub const OPAM_IO_ERROR: &str = "OPAM_IO_ERROR";
}

/// Errors surfaced by resolution and fetching.
#[derive(Error, Debug)]
pub enum OpamError {
    /// A network action was required but the network policy forbids it.
    #[error("Offline: {message}")]
    Offline { message: String },

    #[error("No package found: @opam/{name}")]
    PackageNotFound { name: String },

    #[error("No compatible version found: {name}@{range}{}{}",
        .peer.as_ref().map(|p| format!(" (ocaml {p})")).unwrap_or_default(),
        .path.as_ref().map(|p| format!(" required by {p}")).unwrap_or_default())]
    NoCompatibleVersion {
        name: String,
        range: String,
        /// Peer toolchain version the candidates were filtered against.
        peer: Option<String>,
        /// Dependency path leading to this request, when known.
        path: Option<String>,
    },

    /// Integrity failure. Never retried.
    #[error("Incorrect md5sum for {url} (expected {expected}, got {actual})")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Command failed: {command} (exit code {code:?}): {stderr}")]
    ProcessExecution {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Request to {url} failed: {message}")]
    Http {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid version range '{range}': {message}")]
    InvalidRange { range: String, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpamError {
    /// Get the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Offline { .. } => codes::OPAM_OFFLINE,
            Self::PackageNotFound { .. } => codes::OPAM_PACKAGE_NOT_FOUND,
            Self::NoCompatibleVersion { .. } => codes::OPAM_NO_COMPATIBLE_VERSION,
            Self::ChecksumMismatch { .. } => codes::OPAM_CHECKSUM_MISMATCH,
            Self::ProcessExecution { .. } => codes::OPAM_PROCESS_FAILED,
            Self::Http { .. } => codes::OPAM_HTTP_ERROR,
            Self::Parse { .. } => codes::OPAM_PARSE_ERROR,
            Self::InvalidRange { .. } => codes::OPAM_RANGE_INVALID,
            Self::Archive(_) => codes::OPAM_ARCHIVE_ERROR,
            Self::Io(_) => codes::OPAM_IO_ERROR,
        }
    }

    /// Whether this is an integrity failure that must not be retried or downgraded.
    #[must_use]
    pub fn is_security(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::Offline {
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive(message.into())
    }

    /// Attach the dependency path to a `NoCompatibleVersion` error.
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn with_path(self, dep_path: impl Into<String>) -> Self {
        match self {
            Self::NoCompatibleVersion {
                name, range, peer, ..
            } => Self::NoCompatibleVersion {
                name,
                range,
                peer,
                path: Some(dep_path.into()),
            },
            other => other,
        }
    }
}

impl From<reqwest::Error> for OpamError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(ToString::to_string).unwrap_or_default();
        let status = e.status().map(|s| s.as_u16());
        let message = if e.is_timeout() {
            format!("Request timed out: {e}")
        } else if e.is_connect() {
            format!("Connection failed: {e}")
        } else {
            e.to_string()
        };
        Self::Http {
            url,
            status,
            message,
        }
    }
}

impl From<serde_json::Error> for OpamError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse("<json>", e.to_string())
    }
}

pub type Result<T, E = OpamError> = std::result::Result<T, E>;
