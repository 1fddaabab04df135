//! One replication run: pick tar flavors, open the session, copy everything,
//! then follow changes until stopped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sync::{
    replicate_all_until, BulkStats, ChangeWatcher, IgnoreMatcher, WatchExit, WatchStats,
};
use crate::tar::{
    default_local_candidates, default_remote_candidates, detect_local, detect_remote, TarChoice,
    TarFlavor,
};
use crate::transport::{ReplicationSession, SessionOptions};

/// Fully resolved inputs for [`run`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_dir: PathBuf,
    pub dest_parent_dir: PathBuf,
    pub connection_command: Vec<String>,
    pub clean_first: bool,
    pub initial_replication: bool,
    pub watch: bool,
    pub gitignore: bool,
    pub ignore_file: String,
    pub local_tar: TarChoice,
    pub remote_tar: TarChoice,
    pub idle_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Settings {
    /// Settings taken from `config`, with paths and command still to be filled in.
    pub fn from_config(
        config: &Config,
        source_dir: PathBuf,
        dest_parent_dir: PathBuf,
        connection_command: Vec<String>,
    ) -> Self {
        Self {
            source_dir,
            dest_parent_dir,
            connection_command,
            clean_first: false,
            initial_replication: config.initial_replication,
            watch: config.watch,
            gitignore: config.gitignore,
            ignore_file: config.ignore_file.clone(),
            local_tar: config.local_tar,
            remote_tar: config.remote_tar,
            idle_timeout: config.idle_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Checks that need no subprocess.
    pub fn validate(&self) -> Result<()> {
        if self.connection_command.is_empty() {
            return Err(Error::MissingConnectionCommand);
        }
        if !self.dest_parent_dir.is_absolute() {
            return Err(Error::DestinationNotAbsolute {
                path: self.dest_parent_dir.clone(),
            });
        }
        if !self.source_dir.is_dir() {
            return Err(Error::SourceNotDirectory {
                path: self.source_dir.clone(),
            });
        }
        if let Some(flavor) = self.remote_tar.fixed() {
            if !flavor.is_gnu() {
                return Err(Error::UnsupportedRemoteTar { flavor });
            }
        }
        Ok(())
    }

    /// Remote directory that receives the source tree: the destination
    /// parent joined with the source directory's own name.
    pub fn dest_dir(&self) -> Result<PathBuf> {
        let source = self
            .source_dir
            .canonicalize()
            .map_err(|e| crate::error::io_err(&self.source_dir, e))?;
        let name = source
            .file_name()
            .ok_or_else(|| Error::NoSourceName {
                path: source.clone(),
            })?;
        Ok(self.dest_parent_dir.join(name))
    }

    fn matcher(&self, root: &Path) -> Result<IgnoreMatcher> {
        if self.gitignore {
            IgnoreMatcher::from_root(root, &self.ignore_file)
        } else {
            Ok(IgnoreMatcher::empty())
        }
    }
}

/// What a finished run did.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub local: Option<TarFlavor>,
    pub remote: Option<TarFlavor>,
    pub bulk: Option<BulkStats>,
    pub watch: Option<(WatchExit, WatchStats)>,
    pub files_sent: u64,
    pub bytes_sent: u64,
}

/// Pick the local flavor: a fixed choice as-is, otherwise the first that answers.
pub async fn resolve_local(choice: TarChoice) -> Result<TarFlavor> {
    if let Some(flavor) = choice.fixed() {
        return Ok(flavor);
    }
    let candidates = default_local_candidates();
    detect_local(&candidates).await.ok_or_else(|| Error::NoLocalTar {
        tried: tried(&candidates),
    })
}

/// Pick the remote flavor. Only GNU tar is accepted.
pub async fn resolve_remote(choice: TarChoice, shell_command: &[String]) -> Result<TarFlavor> {
    let flavor = match choice.fixed() {
        Some(flavor) => flavor,
        None => {
            let candidates = default_remote_candidates();
            detect_remote(shell_command, &candidates)
                .await?
                .ok_or_else(|| Error::NoRemoteTar {
                    tried: tried(&candidates),
                })?
        }
    };
    if !flavor.is_gnu() {
        return Err(Error::UnsupportedRemoteTar { flavor });
    }
    Ok(flavor)
}

fn tried(candidates: &[TarFlavor]) -> String {
    candidates
        .iter()
        .map(|flavor| flavor.program())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run both phases. `stop` flipping to `true` ends whichever phase is active.
///
/// The session is closed on every path once it has been opened; an error
/// from a phase wins over an error from closing.
pub async fn run(settings: &Settings, stop: watch::Receiver<bool>) -> Result<RunSummary> {
    settings.validate()?;

    let source_dir = settings
        .source_dir
        .canonicalize()
        .map_err(|e| crate::error::io_err(&settings.source_dir, e))?;
    let local = resolve_local(settings.local_tar).await?;
    let remote = resolve_remote(settings.remote_tar, &settings.connection_command).await?;
    tracing::info!(local = %local, remote = %remote, "using tar flavors");

    let session = ReplicationSession::open(SessionOptions {
        local: local.clone(),
        remote: remote.clone(),
        source_dir: source_dir.clone(),
        dest_parent_dir: settings.dest_parent_dir.clone(),
        shell_command: settings.connection_command.clone(),
        clean_first: settings.clean_first,
    })
    .await?;

    let mut summary = RunSummary {
        local: Some(local),
        remote: Some(remote),
        ..Default::default()
    };
    let phases = run_phases(settings, &source_dir, &session, stop, &mut summary).await;

    let copier = session.copier();
    summary.files_sent = copier.files_sent();
    summary.bytes_sent = copier.bytes_sent();
    let closed = session.close().await;

    phases?;
    closed?;
    Ok(summary)
}

async fn run_phases(
    settings: &Settings,
    source_dir: &Path,
    session: &ReplicationSession,
    stop: watch::Receiver<bool>,
    summary: &mut RunSummary,
) -> Result<()> {
    let copier = session.copier();

    if settings.initial_replication {
        let matcher = settings.matcher(source_dir)?;
        let stats = replicate_all_until(source_dir, &copier, &matcher, &stop).await?;
        let interrupted = stats.interrupted;
        summary.bulk = Some(stats);
        if interrupted {
            return Ok(());
        }
    }

    if settings.watch && !*stop.borrow() {
        let matcher = settings.matcher(source_dir)?;
        let watcher = ChangeWatcher::new(source_dir, matcher)?
            .idle_timeout(settings.idle_timeout)
            .poll_interval(settings.poll_interval);
        summary.watch = Some(watcher.run(&copier, stop).await?);
    }
    Ok(())
}
