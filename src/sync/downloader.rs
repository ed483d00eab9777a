use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use filetime::FileTime;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, SyncError};
use crate::ezshare::EzShareClient;

const TEMP_PREFIX: &str = ".ezshare-";
const TEMP_SUFFIX: &str = ".part";

/// Download `url` to `dest`, replacing any existing file atomically.
///
/// Returns the number of bytes written. On any error the destination is left
/// exactly as it was and no temp file remains.
pub async fn download_file(
    client: &EzShareClient,
    url: &Url,
    dest: &Path,
    remote_mtime: i64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let resp = client.open_download(url).await?;

    if resp.content_length() == Some(0) {
        tracing::warn!(path = %dest.display(), "remote file is empty");
        tokio::fs::File::create(dest)
            .await
            .map_err(|e| SyncError::fs("failed to create", dest, e))?;
        apply_mtime(dest, remote_mtime)?;
        return Ok(0);
    }

    write_atomically(
        dest,
        resp.bytes_stream(),
        remote_mtime,
        client.options().download_idle_timeout,
        cancel,
        url.as_str(),
    )
    .await
}

/// Stream `body` into a temp file next to `dest`, fsync it and rename it
/// over `dest`. The temp file is deleted on every failure path, including
/// cancellation and a stalled stream.
pub async fn write_atomically<S, B, E>(
    dest: &Path,
    body: S,
    remote_mtime: i64,
    idle_timeout: Duration,
    cancel: &CancellationToken,
    url: &str,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let dir = dest.parent().unwrap_or(Path::new("."));
    let transport_err = |reason: String| SyncError::Transport {
        url: url.to_string(),
        reason,
    };

    let tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| SyncError::fs("failed to create temp file in", dir, e))?;
    let (file, tmp_path) = tmp.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut body = std::pin::pin!(body);
    let mut written: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => return Err(transport_err(format!("stalled for {idle_timeout:?}"))),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(transport_err(e.to_string())),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let chunk = chunk.as_ref();
        file.write_all(chunk)
            .await
            .map_err(|e| SyncError::fs("failed to write", &*tmp_path, e))?;
        written += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| SyncError::fs("failed to flush", &*tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| SyncError::fs("failed to sync", &*tmp_path, e))?;
    drop(file);

    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    tmp_path
        .persist(dest)
        .map_err(|e| SyncError::fs("failed to rename temp file onto", dest, e.error))?;
    apply_mtime(dest, remote_mtime)?;

    Ok(written)
}

/// Set access and modification time to the remote timestamp, if known.
fn apply_mtime(path: &Path, remote_mtime: i64) -> Result<()> {
    if remote_mtime == 0 {
        return Ok(());
    }
    let ft = FileTime::from_unix_time(remote_mtime, 0);
    filetime::set_file_times(path, ft, ft)
        .map_err(|e| SyncError::fs("failed to set timestamps on", path, e))
}
