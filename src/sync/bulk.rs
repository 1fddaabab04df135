//! Initial replication of the whole source tree.
//!
//! A blocking walker streams regular-file paths through a bounded channel;
//! the async side pushes each one through `copy_file` as it arrives, so the
//! walk stays lazy and the copies stay strictly sequential.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use tokio::sync::{mpsc, watch};

use super::filter::IgnoreMatcher;
use crate::error::Result;
use crate::transport::CopyFile;

/// Paths buffered between the walker thread and the copy loop
pub const WALK_CHANNEL_SIZE: usize = 256;

/// Outcome of a bulk pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BulkStats {
    /// Files handed to `copy_file`
    pub files_copied: u64,
    /// Files and directories skipped by the ignore rules
    pub ignored: u64,
    /// The pass stopped early on request
    pub interrupted: bool,
}

enum WalkItem {
    File(PathBuf),
    Ignored,
}

/// Copy every non-ignored regular file under `source_dir`.
///
/// Directories are walked but never copied on their own, so empty
/// directories do not appear remotely. Sibling order is by file name.
pub async fn replicate_all<C>(
    source_dir: &Path,
    copier: &C,
    matcher: &IgnoreMatcher,
) -> Result<BulkStats>
where
    C: CopyFile + ?Sized,
{
    bulk_pass(source_dir, copier, matcher, None).await
}

/// Like [`replicate_all`], but checks `stop` between files.
///
/// A copy already in progress always completes, so an interrupted pass never
/// leaves a truncated archive in the stream.
pub async fn replicate_all_until<C>(
    source_dir: &Path,
    copier: &C,
    matcher: &IgnoreMatcher,
    stop: &watch::Receiver<bool>,
) -> Result<BulkStats>
where
    C: CopyFile + ?Sized,
{
    bulk_pass(source_dir, copier, matcher, Some(stop)).await
}

async fn bulk_pass<C>(
    source_dir: &Path,
    copier: &C,
    matcher: &IgnoreMatcher,
    stop: Option<&watch::Receiver<bool>>,
) -> Result<BulkStats>
where
    C: CopyFile + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Result<WalkItem>>(WALK_CHANNEL_SIZE);
    let root = source_dir.to_path_buf();
    let matcher = Arc::new(matcher.clone());
    let walker = tokio::task::spawn_blocking(move || walk(root, matcher, tx));

    let mut stats = BulkStats::default();
    while let Some(item) = rx.recv().await {
        if stop.is_some_and(|stop| *stop.borrow()) {
            stats.interrupted = true;
            break;
        }
        match item? {
            WalkItem::File(path) => {
                copier.copy_file(&path).await?;
                stats.files_copied += 1;
            }
            WalkItem::Ignored => stats.ignored += 1,
        }
    }
    // Dropping the receiver unblocks the walker if we stopped early.
    drop(rx);
    walker.await?;

    tracing::info!(
        copied = stats.files_copied,
        ignored = stats.ignored,
        interrupted = stats.interrupted,
        "initial replication finished"
    );
    Ok(stats)
}

fn walk(root: PathBuf, matcher: Arc<IgnoreMatcher>, tx: mpsc::Sender<Result<WalkItem>>) {
    let prune = {
        let matcher = matcher.clone();
        let root = root.clone();
        let tx = tx.clone();
        move |entry: &ignore::DirEntry| {
            if !entry.file_type().is_some_and(|t| t.is_dir()) {
                return true;
            }
            let ignored = entry
                .path()
                .strip_prefix(&root)
                .is_ok_and(|relative| matcher.is_ignored(relative, true));
            if ignored {
                // Counted here because pruned directories never reach the loop below.
                let _ = tx.blocking_send(Ok(WalkItem::Ignored));
            }
            !ignored
        }
    };

    let entries = WalkBuilder::new(&root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(prune)
        .build();

    for entry in entries {
        let item = match entry {
            Ok(entry) => {
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                if matcher.is_ignored(relative, false) {
                    Ok(WalkItem::Ignored)
                } else {
                    Ok(WalkItem::File(entry.into_path()))
                }
            }
            // Entries removed while walking are the same race copy_file
            // tolerates; anything else stops the pass.
            Err(err) if is_not_found(&err) => continue,
            Err(err) => Err(err.into()),
        };
        if tx.blocking_send(item).is_err() {
            // The copy loop bailed out; nobody is listening any more.
            return;
        }
    }
}

fn is_not_found(err: &ignore::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}
