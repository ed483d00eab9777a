pub mod downloader;
pub mod policy;
pub mod progress;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, SyncError};
use crate::ezshare::{EzShareClient, ListingRules, RemoteDir, RemoteFile, download_url, subdir_url};

use policy::{Decision, LocalState, Policy};
use progress::{EventSink, TransferCounters};

/// What to mirror and how.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Listing URL of the card's root directory.
    pub root_url: Url,
    /// Existing local directory that mirrors `root_url`.
    pub local_root: PathBuf,
    pub rules: ListingRules,
    pub policy: Policy,
    /// Caller's estimate of how many files will be downloaded.
    pub expected_files: Option<u64>,
    /// Deepest directory level entered below the root.
    pub max_depth: usize,
}

/// A file that was due for download but did not make it.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// A subdirectory that could not be mirrored (in full or in part).
#[derive(Debug, Clone)]
pub struct IncompleteDir {
    pub url: String,
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub downloaded: u64,
    pub skipped: u64,
    pub bytes: u64,
    pub failed: Vec<FileFailure>,
    pub incomplete: Vec<IncompleteDir>,
    pub cancelled: bool,
}

impl SyncReport {
    /// True when every listed file was either fetched or deliberately skipped.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.incomplete.is_empty()
    }
}

struct RunState {
    counters: TransferCounters,
    report: SyncReport,
    visited: HashSet<Url>,
}

/// Mirrors the card's tree onto a local directory, one file at a time.
pub struct SyncEngine {
    client: EzShareClient,
    options: SyncOptions,
    events: EventSink,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(client: EzShareClient, options: SyncOptions, events: EventSink) -> Self {
        Self {
            client,
            options,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run at the next file or chunk boundary.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run one full sync.
    ///
    /// Fails only when the root itself cannot be mirrored: the local root is
    /// missing or the root listing cannot be fetched or parsed. Everything
    /// below the root is contained and recorded in the report.
    pub async fn run(&self) -> Result<SyncReport> {
        let root = &self.options.local_root;
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                let err = std::io::Error::from(std::io::ErrorKind::NotADirectory);
                return Err(self.fatal(SyncError::fs("sync root unusable", root, err)));
            }
            Err(e) => return Err(self.fatal(SyncError::fs("sync root unusable", root, e))),
        }

        tracing::info!(
            url = %self.options.root_url,
            path = %root.display(),
            overwrite = self.options.policy.overwrite,
            keep_old = self.options.policy.keep_old,
            "starting sync"
        );
        self.events.info(format!("Syncing {}", self.options.root_url));
        self.events.progress(0);

        let mut state = RunState {
            counters: TransferCounters::new(self.options.expected_files),
            report: SyncReport::default(),
            visited: HashSet::new(),
        };

        match self
            .walk_dir(&self.options.root_url, root, 0, &mut state)
            .await
        {
            Ok(()) => {}
            Err(SyncError::Cancelled) => {
                tracing::info!("sync cancelled");
                state.report.cancelled = true;
                self.events.info("Sync cancelled.");
            }
            Err(e) => return Err(self.fatal(e)),
        }

        let report = state.report;
        tracing::info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed.len(),
            incomplete = report.incomplete.len(),
            bytes = report.bytes,
            "sync finished"
        );
        if !report.cancelled {
            let message = format!(
                "Sync complete: {} downloaded, {} up to date, {} failed",
                report.downloaded,
                report.skipped,
                report.failed.len()
            );
            if report.is_complete() {
                self.events.info(message);
            } else {
                self.events.warn(message);
            }
        }
        Ok(report)
    }

    fn fatal(&self, err: SyncError) -> SyncError {
        tracing::error!(error = %err, "sync failed");
        self.events.error(format!("Error: {err}"));
        err
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Depth-first, pre-order: files of this directory, then each
    /// subdirectory in full before its next sibling.
    fn walk_dir<'a>(
        &'a self,
        url: &'a Url,
        dir: &'a Path,
        depth: usize,
        state: &'a mut RunState,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            state.visited.insert(url.clone());

            let listing = self.client.list_dir(url, &self.options.rules).await?;

            for file in &listing.files {
                self.check_cancelled()?;
                self.sync_file(url, dir, file, state).await?;
            }

            for sub in &listing.dirs {
                self.check_cancelled()?;

                let local = dir.join(&sub.name);
                match self.enter_dir(url, sub, &local, depth, state).await {
                    Ok(()) => {}
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(e) => {
                        tracing::warn!(
                            path = %local.display(),
                            error = %e,
                            "subdirectory incomplete"
                        );
                        self.events
                            .warn(format!("Skipped part of \"{}\": {e}", local.display()));
                        state.report.incomplete.push(IncompleteDir {
                            url: subdir_url(url, &sub.href)
                                .map_or_else(|_| sub.href.clone(), String::from),
                            path: local,
                            error: e.to_string(),
                        });
                    }
                }
            }

            Ok(())
        })
    }

    /// Check a subdirectory against the traversal guards, then create it
    /// locally and walk it. Nothing is created for a refused directory.
    async fn enter_dir(
        &self,
        parent_url: &Url,
        sub: &RemoteDir,
        local: &Path,
        depth: usize,
        state: &mut RunState,
    ) -> Result<()> {
        let url = subdir_url(parent_url, &sub.href)?;
        let refuse = |reason: String| SyncError::Traversal {
            url: url.to_string(),
            reason,
        };
        if !is_plain_name(&sub.name) {
            return Err(refuse(format!("refusing directory name {:?}", sub.name)));
        }
        if depth + 1 > self.options.max_depth {
            return Err(refuse(format!("deeper than {} levels", self.options.max_depth)));
        }
        if state.visited.contains(&url) {
            return Err(refuse("directory already visited".into()));
        }

        tokio::fs::create_dir_all(local)
            .await
            .map_err(|e| SyncError::fs("failed to create directory", local, e))?;
        tracing::debug!(path = %local.display(), url = %url, "entering directory");

        self.walk_dir(&url, local, depth + 1, state).await
    }

    /// Decide and, if due, download one file. Transport failures are
    /// recorded against the file. Cancellation and local filesystem
    /// failures escape, the latter so the whole directory is given up.
    async fn sync_file(
        &self,
        dir_url: &Url,
        dir: &Path,
        file: &RemoteFile,
        state: &mut RunState,
    ) -> Result<()> {
        let name = file.name.as_str();
        let remote_mtime = file.modified;
        let dest = dir.join(name);

        if !is_plain_name(name) {
            tracing::warn!(name, "refusing file name");
            state.report.failed.push(FileFailure {
                path: dest,
                error: format!("refusing file name {name:?}"),
            });
            return Ok(());
        }

        let local = LocalState::probe(&dest).await;
        match policy::decide(self.options.policy, local, remote_mtime) {
            Decision::Download => {}
            decision => {
                tracing::debug!(path = %dest.display(), ?decision, "skipping");
                state.report.skipped += 1;
                return Ok(());
            }
        }

        let counters = state.counters;
        self.events.info(if counters.total == 0 {
            format!("Downloading file \"{name}\" ({})", counters.processed + 1)
        } else {
            format!(
                "Downloading file \"{name}\" {}/{} ({}%)",
                counters.processed + 1,
                counters.total,
                counters.next_percent()
            )
        });

        let result = match download_url(dir_url, &file.query) {
            Ok(url) => {
                tracing::debug!(path = %dest.display(), url = %url, "downloading");
                downloader::download_file(&self.client, &url, &dest, remote_mtime, &self.cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                tracing::info!(path = %dest.display(), bytes, "downloaded");
                state.counters.processed += 1;
                state.report.downloaded += 1;
                state.report.bytes += bytes;
                self.events.progress(state.counters.percent());
            }
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e @ SyncError::Filesystem { .. }) => {
                tracing::error!(path = %dest.display(), error = %e, "cannot write file");
                state.report.failed.push(FileFailure {
                    path: dest,
                    error: e.to_string(),
                });
                return Err(e);
            }
            Err(e) => {
                tracing::error!(path = %dest.display(), error = %e, "download failed");
                self.events
                    .error(format!("Error downloading \"{name}\": {e}"));
                state.report.failed.push(FileFailure {
                    path: dest,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A single path component that cannot climb out of its directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != ".." && !name.contains(['/', '\\', '\0'])
}
