//! Replication phases.
//!
//! Bulk replication walks the whole tree once; the watch phase follows file
//! changes. Both share one [`IgnoreMatcher`] and push files through the same
//! [`CopyFile`](crate::transport::CopyFile) handle. They never run at the
//! same time: the bulk pass finishes before the watcher subscribes.

pub mod bulk;
pub mod filter;
pub mod watch;

pub use bulk::{replicate_all, replicate_all_until, BulkStats};
pub use filter::{IgnoreMatcher, DEFAULT_IGNORE_FILE};
pub use watch::{
    ChangeEvent, ChangeKind, ChangeWatcher, Dispatch, WatchExit, WatchStats, WatcherState,
    DEFAULT_POLL_INTERVAL,
};
