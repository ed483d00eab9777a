use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// How existing local files are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    /// Download even when the local copy is not older than the remote.
    pub overwrite: bool,
    /// Never touch a file that already exists locally. Wins over `overwrite`.
    pub keep_old: bool,
}

/// What to do with one remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Download,
    /// Local copy exists and `keep_old` is set.
    KeepExisting,
    /// Local copy is at least as new as the remote one.
    UpToDate,
}

/// State of the local candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalState {
    pub exists: bool,
    /// Whole seconds since the epoch, 0 when absent.
    pub mtime: i64,
}

impl LocalState {
    pub const ABSENT: LocalState = LocalState {
        exists: false,
        mtime: 0,
    };

    /// Only regular files count as existing, like the card's own files.
    pub async fn probe(path: &Path) -> Self {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => LocalState {
                exists: true,
                mtime: meta.modified().map_or(0, epoch_secs),
            },
            _ => Self::ABSENT,
        }
    }
}

/// Decide whether a remote file with timestamp `remote_mtime` (0 = unknown)
/// should be fetched.
///
/// A missing local file counts as time zero, so an unknown remote timestamp
/// never triggers a download on its own; only `overwrite` does.
pub fn decide(policy: Policy, local: LocalState, remote_mtime: i64) -> Decision {
    if policy.keep_old && local.exists {
        return Decision::KeepExisting;
    }
    if policy.overwrite || local.mtime < remote_mtime {
        Decision::Download
    } else {
        Decision::UpToDate
    }
}

pub(crate) fn epoch_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
