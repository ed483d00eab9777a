use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while mirroring the card.
///
/// Which variants abort what is decided by the sync engine: `Transport`
/// only costs one file, `Fetch`/`Parse`/`Filesystem`/`Traversal` cost the
/// subtree they occurred in, `Cancelled` stops the whole run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Listing could not be retrieved (unreachable, timed out, non-2xx).
    #[error("failed to fetch listing {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Listing HTML did not have the expected shape.
    #[error("unrecognized listing at {url}: {reason}")]
    Parse { url: String, reason: String },

    /// A single file download failed.
    #[error("download of {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{action} {}: {source}", .path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote tree is not a finite tree (cycle or runaway depth).
    #[error("traversal stopped at {url}: {reason}")]
    Traversal { url: String, reason: String },

    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Setting up or tearing down the link to the card failed.
    #[error("{0}")]
    Network(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub(crate) fn fs(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
