//! Live one-way replication of a directory tree through a remote shell.
//!
//! Files travel as single-file tar archives written into the stdin of one
//! long-lived shell (typically `ssh host bash`), where a small loop extracts
//! each archive in turn. An initial bulk pass copies everything; a watcher
//! then follows changes until stopped.

pub mod config;
pub mod error;
pub mod replicator;
pub mod sync;
pub mod tar;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::{run, RunSummary, Settings};
pub use tar::{TarChoice, TarFlavor};
pub use transport::CopyFile;
