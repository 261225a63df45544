//! Error types for model transfers, the registry and backend jobs.

use std::path::PathBuf;

/// Failure of a single checksum-verified download.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Connection, redirect or HTTP status failure.
    #[error("transfer of {url} failed: {message}")]
    Transfer { url: String, message: String },

    /// The streamed content does not hash to the expected digest.
    #[error("SHA256 mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// The partial or final file could not be written, moved or removed.
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub(crate) fn transfer(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Transfer {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Missing or malformed model manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A single entry failed boundary validation.
    #[error("manifest entry `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode registry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot determine the project directory: {0}")]
    NoProjectDir(std::io::Error),
}

/// Failure of an update check. Any of these aborts the whole check.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The configured remote manifest could not be fetched or parsed.
    #[error("remote manifest {url}: {message}")]
    RemoteFetch { url: String, message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("download queue is shut down")]
    Closed,
}

/// Errors of the backend job protocol.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Submission was rejected or the response carried no task id.
    #[error("job submit failed: {0}")]
    Submit(String),

    /// A status or cancel request returned a non-success status.
    #[error("job {task_id} status request failed: {message}")]
    Status { task_id: String, message: String },

    /// The backend reported a terminal error for the job.
    #[error("job failed: {0}")]
    Failed(String),

    /// Client stopped polling; the backend job may still be running.
    #[error("job {task_id} timed out after {attempts} polls, it may still be running")]
    Timeout { task_id: String, attempts: u32 },

    /// Operation parameters rejected before submission.
    #[error("invalid job parameters: {0}")]
    InvalidParams(String),

    /// Transport failure talking to the backend.
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
}
