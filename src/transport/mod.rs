//! Transport to the remote shell.
//!
//! A session is one shell process started from the connection command. Files
//! reach it as a sequence of single-file tar archives written to its stdin.

pub mod receiver;
pub mod session;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use receiver::{receiver_script, shell_escape, FRAME_MARKER};
pub use session::{ReplicationSession, SessionCopier, SessionOptions};

/// Pushes one file into the replication stream.
///
/// Both replication phases are written against this trait. Calls against one
/// session must not overlap; implementations serialise them.
#[async_trait]
pub trait CopyFile: Send + Sync {
    async fn copy_file(&self, path: &Path) -> Result<()>;
}

#[async_trait]
impl<T: CopyFile + ?Sized> CopyFile for &T {
    async fn copy_file(&self, path: &Path) -> Result<()> {
        (**self).copy_file(path).await
    }
}
