//! Watch phase: replicate files as they change.
//!
//! A recursive `notify` watcher forwards raw events into a tokio channel.
//! The loop translates them into [`ChangeEvent`]s, applies the ignore rules
//! and the dispatch policy, and copies one file at a time.
//!
//! ```text
//! notify thread --(unbounded mpsc)--> run() --copy_file--> session stdin
//!                                       ^
//!                    stop signal / idle timeout tick
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::filter::IgnoreMatcher;
use crate::error::{io_err, Result};
use crate::transport::CopyFile;

/// How often the loop wakes up to check the idle timeout and stop signal.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// One change under the source root, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Affected path (source path for moves)
    pub path: PathBuf,
    /// Destination path, only for moves
    pub dest_path: Option<PathBuf>,
    pub is_dir: bool,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            kind,
            path: path.into(),
            dest_path: None,
            is_dir,
        }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            kind: ChangeKind::Moved,
            path: from.into(),
            dest_path: Some(to.into()),
            is_dir,
        }
    }

    /// Translate a raw notification. Access and unknown events yield nothing.
    pub fn from_notify(event: Event) -> Vec<ChangeEvent> {
        let is_dir = |p: &Path| p.is_dir();
        match event.kind {
            EventKind::Create(_) => event
                .paths
                .into_iter()
                .map(|p| {
                    let dir = is_dir(&p);
                    ChangeEvent::new(ChangeKind::Created, p, dir)
                })
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let mut paths = event.paths.into_iter();
                match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => {
                        let dir = is_dir(&to);
                        vec![ChangeEvent::moved(from, to, dir)]
                    }
                    _ => Vec::new(),
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
                .paths
                .into_iter()
                .map(|p| ChangeEvent::new(ChangeKind::Deleted, p, false))
                .collect(),
            // Moved in from outside the tree; the `Both` half never arrives.
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
                .paths
                .into_iter()
                .map(|p| {
                    let dir = is_dir(&p);
                    ChangeEvent::new(ChangeKind::Created, p, dir)
                })
                .collect(),
            EventKind::Modify(_) => event
                .paths
                .into_iter()
                .map(|p| {
                    let dir = is_dir(&p);
                    ChangeEvent::new(ChangeKind::Modified, p, dir)
                })
                .collect(),
            EventKind::Remove(_) => event
                .paths
                .into_iter()
                .map(|p| ChangeEvent::new(ChangeKind::Deleted, p, false))
                .collect(),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }
}

/// What the dispatcher decided for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Send this file.
    Copy(PathBuf),
    /// Matched the ignore rules.
    Ignored,
    /// Not something that is replicated (deletions, directory noise).
    Skipped,
}

/// Lifecycle of a watch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Active,
    Stopped,
}

/// Why a watch run ended. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// The stop signal fired
    Cancelled,
    /// Nothing happened for the whole idle timeout
    TimedOut,
    /// The notification source went away
    Closed,
}

/// Counters for one watch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchStats {
    pub events: u64,
    pub files_copied: u64,
    pub ignored: u64,
}

/// Watches the source tree and replicates changed files.
pub struct ChangeWatcher {
    root: PathBuf,
    canonical_root: PathBuf,
    matcher: IgnoreMatcher,
    idle_timeout: Option<Duration>,
    poll_interval: Duration,
    state: watch::Sender<WatcherState>,
}

impl ChangeWatcher {
    pub fn new(root: impl Into<PathBuf>, matcher: IgnoreMatcher) -> Result<Self> {
        let root = root.into();
        // Notifications arrive with resolved paths (e.g. /private/var on
        // macOS), so relative paths are computed against the canonical root.
        let canonical_root = root.canonicalize().map_err(|e| io_err(&root, e))?;
        let (state, _) = watch::channel(WatcherState::Starting);
        Ok(Self {
            root,
            canonical_root,
            matcher,
            idle_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state,
        })
    }

    /// Stop after this long without any notification.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Observe the lifecycle; becomes `Active` once the subscription is live.
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Apply the ignore rules and the dispatch policy to one event.
    pub fn dispatch(&self, event: &ChangeEvent) -> Dispatch {
        if self.is_ignored(&event.path, event.is_dir)
            || event
                .dest_path
                .as_deref()
                .is_some_and(|dest| self.is_ignored(dest, event.is_dir))
        {
            return Dispatch::Ignored;
        }
        match (event.kind, event.is_dir) {
            (ChangeKind::Deleted, _) => Dispatch::Skipped,
            (ChangeKind::Modified, true) => Dispatch::Skipped,
            // Directories show up remotely once a file inside them is sent.
            (ChangeKind::Created | ChangeKind::Moved, true) => Dispatch::Skipped,
            (ChangeKind::Moved, _) => match &event.dest_path {
                Some(dest) => self.to_source_path(dest).map_or(Dispatch::Skipped, Dispatch::Copy),
                None => Dispatch::Skipped,
            },
            (ChangeKind::Created | ChangeKind::Modified, false) => self
                .to_source_path(&event.path)
                .map_or(Dispatch::Skipped, Dispatch::Copy),
        }
    }

    /// Run until stopped, timed out, or the notification source closes.
    ///
    /// `stop` flips to `true` to request shutdown. The filesystem
    /// subscription is always dropped before this returns.
    pub async fn run<C>(
        &self,
        copier: &C,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(WatchExit, WatchStats)>
    where
        C: CopyFile + ?Sized,
    {
        self.state.send_replace(WatcherState::Starting);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = match recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                self.state.send_replace(WatcherState::Stopped);
                return Err(err.into());
            }
        };
        if let Err(err) = watcher.watch(&self.canonical_root, RecursiveMode::Recursive) {
            self.state.send_replace(WatcherState::Stopped);
            return Err(err.into());
        }

        tracing::info!(root = %self.root.display(), "watching for changes");
        self.state.send_replace(WatcherState::Active);

        let result = self.event_loop(copier, &mut stop, &mut event_rx).await;

        drop(watcher);
        self.state.send_replace(WatcherState::Stopped);
        if let Ok((exit, stats)) = &result {
            tracing::info!(
                ?exit,
                events = stats.events,
                copied = stats.files_copied,
                ignored = stats.ignored,
                "stopped watching"
            );
        }
        result
    }

    async fn event_loop<C>(
        &self,
        copier: &C,
        stop: &mut watch::Receiver<bool>,
        events: &mut mpsc::UnboundedReceiver<notify::Result<Event>>,
    ) -> Result<(WatchExit, WatchStats)>
    where
        C: CopyFile + ?Sized,
    {
        let mut stats = WatchStats::default();
        let mut last_event = Instant::now();
        let mut tick = time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow_and_update() {
                return Ok((WatchExit::Cancelled, stats));
            }
            tokio::select! {
                changed = stop.changed() => {
                    // A dropped stop sender can never fire again; treat it as a stop.
                    if changed.is_err() || *stop.borrow() {
                        return Ok((WatchExit::Cancelled, stats));
                    }
                }
                _ = tick.tick() => {
                    if let Some(timeout) = self.idle_timeout {
                        let idle = last_event.elapsed();
                        if idle > timeout {
                            tracing::debug!(idle_ms = idle.as_millis() as u64, "no changes within idle timeout");
                            return Ok((WatchExit::TimedOut, stats));
                        }
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok((WatchExit::Closed, stats));
                    };
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(error = %err, "watcher event error");
                            continue;
                        }
                    };
                    let changes = with_directory_contents(ChangeEvent::from_notify(event)).await?;
                    for change in changes {
                        stats.events += 1;
                        tracing::trace!(?change, "detected change");
                        // Only changes that pass the ignore rules count as activity.
                        match self.dispatch(&change) {
                            Dispatch::Copy(path) => {
                                last_event = Instant::now();
                                copier.copy_file(&path).await?;
                                stats.files_copied += 1;
                            }
                            Dispatch::Ignored => {
                                tracing::debug!(path = %change.path.display(), "ignoring change");
                                stats.ignored += 1;
                            }
                            Dispatch::Skipped => last_event = Instant::now(),
                        }
                    }
                }
            }
        }
    }

    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.canonical_root)
            .or_else(|_| path.strip_prefix(&self.root))
            .ok()
    }

    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.relative(path)
            .is_some_and(|relative| self.matcher.is_ignored(relative, is_dir))
    }

    /// Map a notification path back under the root the session was opened with.
    fn to_source_path(&self, path: &Path) -> Option<PathBuf> {
        match self.relative(path) {
            Some(relative) if !relative.as_os_str().is_empty() => Some(self.root.join(relative)),
            _ => {
                tracing::debug!(path = %path.display(), "change outside the source root");
                None
            }
        }
    }
}

/// Add `Created` events for files already inside newly created or moved-in
/// directories.
///
/// A file written right after its directory was created can land before the
/// recursive watch on that directory is installed, and then no event for it
/// ever arrives. Sending what is already there closes that gap; anything that
/// does get its own event is simply sent twice. A renamed directory brings
/// its files along without any per-file events.
async fn with_directory_contents(changes: Vec<ChangeEvent>) -> Result<Vec<ChangeEvent>> {
    let mut expanded = Vec::with_capacity(changes.len());
    for change in changes {
        let new_dir = match (change.kind, change.is_dir) {
            (ChangeKind::Created, true) => Some(change.path.clone()),
            (ChangeKind::Moved, true) => change.dest_path.clone(),
            _ => None,
        };
        expanded.push(change);
        if let Some(dir) = new_dir {
            let files = tokio::task::spawn_blocking(move || files_under(&dir)).await?;
            expanded.extend(
                files
                    .into_iter()
                    .map(|file| ChangeEvent::new(ChangeKind::Created, file, false)),
            );
        }
    }
    Ok(expanded)
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    ignore::WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(|entry| entry.into_path())
        .collect()
}
