//! Error taxonomy for the bundle pipeline.
//!
//! Every failure is attributed to a single target by the driver. Variants
//! carry the offending path or entry so a run summary can name it without
//! anyone reading logs.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub type Result<T, E = BundleError> = std::result::Result<T, E>;

/// Why a fetch attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Final HTTP status was outside 200..=299.
    Status(u16),
    /// Body length disagreed with the declared `Content-Length`.
    SizeMismatch { declared: u64, received: u64 },
    /// Body hashed to something other than the expected sha256.
    ChecksumMismatch { expected: String, actual: String },
    /// The transport itself failed (spawn error, connection reset, timeout).
    Transport(String),
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Status(code) => write!(f, "HTTP status {code}"),
            FetchFailure::SizeMismatch { declared, received } => write!(
                f,
                "size mismatch: Content-Length {declared}, received {received} bytes"
            ),
            FetchFailure::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            FetchFailure::Transport(reason) => write!(f, "transport error: {reason}"),
        }
    }
}

/// Errors produced by the pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Network or integrity failure, surfaced after retries are exhausted.
    #[error("fetch failed for {url} after {attempts} attempt(s): {failure}")]
    Fetch {
        url: String,
        attempts: u32,
        failure: FetchFailure,
    },

    /// Malformed, truncated or unsupported container.
    #[error("cannot extract {archive} (entry '{entry}'): {reason}")]
    Extract {
        archive: PathBuf,
        entry: String,
        reason: String,
    },

    /// A symlink would point at nothing in the tree it lives in.
    #[error("symlink '{link}' -> '{target}' does not resolve: {reason}")]
    DanglingLink {
        link: String,
        target: String,
        reason: String,
    },

    /// Two subtrees declare the same path with different content.
    #[error("conflicting content for '{path}': {first} vs {second}")]
    Conflict {
        path: String,
        first: String,
        second: String,
    },

    /// A built or published artifact does not hash to the recorded value.
    #[error("verification failed for {path}: expected {expected}, got {actual}")]
    Verify {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("target ran out of time during {stage}")]
    Timeout { stage: String },

    #[error("run cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("manifest {path} is malformed: {reason}")]
    Manifest { path: PathBuf, reason: String },
}

/// Coarse error classification reported in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Extract,
    DanglingLink,
    Conflict,
    Verify,
    Timeout,
    Cancelled,
    Io,
    Config,
    Manifest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Fetch => "FetchError",
            ErrorKind::Extract => "ExtractError",
            ErrorKind::DanglingLink => "DanglingLinkError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Verify => "VerifyError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "IoError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Manifest => "ManifestError",
        };
        f.write_str(name)
    }
}

impl BundleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundleError::Fetch { .. } => ErrorKind::Fetch,
            BundleError::Extract { .. } => ErrorKind::Extract,
            BundleError::DanglingLink { .. } => ErrorKind::DanglingLink,
            BundleError::Conflict { .. } => ErrorKind::Conflict,
            BundleError::Verify { .. } => ErrorKind::Verify,
            BundleError::Timeout { .. } => ErrorKind::Timeout,
            BundleError::Cancelled { .. } => ErrorKind::Cancelled,
            BundleError::Io { .. } => ErrorKind::Io,
            BundleError::Config(_) => ErrorKind::Config,
            BundleError::Manifest { .. } => ErrorKind::Manifest,
        }
    }

    /// The file, URL or tree entry the error is about, if there is one.
    pub fn path(&self) -> Option<String> {
        match self {
            BundleError::Fetch { url, .. } => Some(url.clone()),
            BundleError::Extract { archive, entry, .. } => {
                if entry.is_empty() {
                    Some(archive.display().to_string())
                } else {
                    Some(format!("{}:{}", archive.display(), entry))
                }
            }
            BundleError::DanglingLink { link, .. } => Some(link.clone()),
            BundleError::Conflict { path, .. } => Some(path.clone()),
            BundleError::Verify { path, .. }
            | BundleError::Io { path, .. }
            | BundleError::Manifest { path, .. } => Some(path.display().to_string()),
            BundleError::Timeout { .. } | BundleError::Cancelled { .. } => None,
            BundleError::Config(_) => None,
        }
    }

    pub(crate) fn extract(archive: &Path, entry: impl Into<String>, reason: impl fmt::Display) -> Self {
        BundleError::Extract {
            archive: archive.to_path_buf(),
            entry: entry.into(),
            reason: reason.to_string(),
        }
    }
}

/// Attach a path to a bare `io::Error`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
