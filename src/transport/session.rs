//! Replication session - one long-lived shell running the receiver loop.
//!
//! The shell's stdin is the only channel to the remote side. Every file is
//! sent as its own tar archive, and archives must never interleave, so the
//! stdin handle sits behind an async mutex held for the whole of each copy.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::receiver::{receiver_script, FRAME_MARKER};
use super::CopyFile;
use crate::error::{io_err, Error, Result};
use crate::tar::TarFlavor;

/// Diagnostic tar prints when the file disappeared before it could be read.
const VANISHED_FILE: &str = "No such file or directory";

/// Read size when forwarding archive bytes into the session.
const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Flavor used to create archives on this machine
    pub local: TarFlavor,
    /// Flavor used to extract archives remotely (must be GNU tar)
    pub remote: TarFlavor,
    /// Directory being mirrored
    pub source_dir: PathBuf,
    /// Absolute remote directory that receives `basename(source_dir)`
    pub dest_parent_dir: PathBuf,
    /// Argv that yields a shell reading commands from stdin
    pub shell_command: Vec<String>,
    /// Remove everything under the destination before receiving
    pub clean_first: bool,
}

/// Manages one running remote shell and the receiver loop inside it.
pub struct ReplicationSession {
    child: Child,
    copier: SessionCopier,
    remote: TarFlavor,
    dest_dir: PathBuf,
    listing: Option<JoinHandle<()>>,
}

impl ReplicationSession {
    /// Spawn the connection command and start the receiver loop.
    pub async fn open(options: SessionOptions) -> Result<Self> {
        if !options.remote.is_gnu() {
            return Err(Error::UnsupportedRemoteTar {
                flavor: options.remote,
            });
        }
        let (program, args) = options
            .shell_command
            .split_first()
            .ok_or(Error::MissingConnectionCommand)?;
        if !options.dest_parent_dir.is_absolute() {
            return Err(Error::DestinationNotAbsolute {
                path: options.dest_parent_dir,
            });
        }

        let source_dir = std::path::absolute(&options.source_dir)
            .map_err(|e| io_err(&options.source_dir, e))?;
        let name = source_dir
            .file_name()
            .ok_or_else(|| Error::NoSourceName {
                path: source_dir.clone(),
            })?
            .to_os_string();
        let dest_dir = options.dest_parent_dir.join(name);

        let command = options.shell_command.join(" ");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::Spawn {
            command: command.clone(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "stdin was not captured"),
        })?;

        // The receiver's verbose listing must be drained or the remote side
        // eventually blocks on a full pipe.
        let listing = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(file = %line, "remote extracted");
                }
            })
        });

        let script = receiver_script(
            &dest_dir,
            options.clean_first,
            &options.remote.receiver_command_line(),
        );
        tracing::debug!(
            command = %command,
            dest = %dest_dir.display(),
            clean_first = options.clean_first,
            "starting remote receiver"
        );
        stdin.write_all(script.as_bytes()).await?;
        stdin.flush().await?;

        let copier = SessionCopier {
            inner: Arc::new(CopierInner {
                local: options.local,
                source_dir,
                stdin: Mutex::new(Some(stdin)),
                files_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
            }),
        };

        Ok(Self {
            child,
            copier,
            remote: options.remote,
            dest_dir,
            listing,
        })
    }

    /// Handle used by the replication phases to push files.
    pub fn copier(&self) -> SessionCopier {
        self.copier.clone()
    }

    /// Remote directory that mirrors the source.
    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn source_dir(&self) -> &Path {
        &self.copier.inner.source_dir
    }

    pub fn local(&self) -> &TarFlavor {
        &self.copier.inner.local
    }

    pub fn remote(&self) -> &TarFlavor {
        &self.remote
    }

    /// Close the stream and wait for the remote shell to finish.
    ///
    /// Closing stdin ends the receiver loop; the shell is never killed.
    pub async fn close(mut self) -> Result<()> {
        drop(self.copier.inner.stdin.lock().await.take());

        let status: ExitStatus = self.child.wait().await?;
        if let Some(listing) = self.listing.take() {
            listing.await?;
        }
        tracing::debug!(
            %status,
            files = self.copier.files_sent(),
            bytes = self.copier.bytes_sent(),
            "remote session closed"
        );

        if status.success() {
            Ok(())
        } else {
            Err(Error::SessionExit {
                code: status.code(),
            })
        }
    }
}

struct CopierInner {
    local: TarFlavor,
    source_dir: PathBuf,
    stdin: Mutex<Option<ChildStdin>>,
    files_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Cloneable `copy_file` capability bound to one session.
#[derive(Clone)]
pub struct SessionCopier {
    inner: Arc<CopierInner>,
}

impl SessionCopier {
    /// Archives forwarded so far (including empty ones for vanished files).
    pub fn files_sent(&self) -> u64 {
        self.inner.files_sent.load(Ordering::Relaxed)
    }

    /// Archive bytes forwarded so far.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    fn relative_path(&self, path: &Path) -> Result<PathBuf> {
        let absolute = std::path::absolute(path).map_err(|e| io_err(path, e))?;
        let outside = || Error::OutsideSource {
            path: absolute.clone(),
            root: self.inner.source_dir.clone(),
        };
        let relative = absolute
            .strip_prefix(&self.inner.source_dir)
            .map_err(|_| outside())?;
        if relative.as_os_str().is_empty() {
            return Err(outside());
        }
        Ok(relative.to_path_buf())
    }
}

#[async_trait]
impl CopyFile for SessionCopier {
    async fn copy_file(&self, path: &Path) -> Result<()> {
        let relative = self.relative_path(path)?;
        let cmd = self.inner.local.sender_command(&relative);

        let mut guard = self.inner.stdin.lock().await;
        let stream = guard.as_mut().ok_or(Error::SessionClosed)?;

        let mut child = Command::new(&cmd[0])
            .args(&cmd[1..])
            .current_dir(&self.inner.source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: self.inner.local.program(),
                source,
            })?;

        let (Some(archive), Some(mut diagnostics)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::Spawn {
                command: self.inner.local.program(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "tar output was not captured"),
            });
        };

        let mut stderr = Vec::new();
        let forward = async {
            let mut archive = archive;
            let forwarded = forward_archive(&mut archive, &mut *stream).await;
            if forwarded.is_err() {
                // tar may be blocked on a full stdout pipe; it must exit so
                // its stderr closes and the read below can finish.
                let _ = child.start_kill();
            }
            forwarded
        };
        let (forwarded, read_stderr) =
            tokio::join!(forward, diagnostics.read_to_end(&mut stderr));
        let status = child.wait().await?;
        let written = match forwarded {
            Ok(written) => written,
            Err(err) => {
                // A partial archive is already in the stream, so nothing
                // more can be sent through this session.
                drop(guard.take());
                tracing::warn!(path = %relative.display(), error = %err, "remote session stopped accepting data");
                return Err(err.into());
            }
        };
        read_stderr?;
        drop(guard);

        self.inner.files_sent.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_sent.fetch_add(written, Ordering::Relaxed);

        let stderr = String::from_utf8_lossy(&stderr);
        if stderr.contains(VANISHED_FILE) {
            tracing::trace!(path = %relative.display(), "file vanished before it was sent");
            return Ok(());
        }
        if !status.success() || !stderr.trim().is_empty() {
            let message = if stderr.trim().is_empty() {
                format!("{} exited with {status}", self.inner.local.program())
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Archive {
                path: relative,
                stderr: message,
            });
        }

        tracing::debug!(path = %relative.display(), bytes = written, "sent");
        Ok(())
    }
}

/// Copy one archive into the session stream as a single framed unit.
///
/// Nothing is written when the archive is empty, so a tar that produced no
/// output cannot leave a dangling frame marker in front of the next archive.
async fn forward_archive<R, W>(archive: &mut R, stream: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ARCHIVE_CHUNK_SIZE];
    let first = archive.read(&mut buf).await?;
    if first == 0 {
        return Ok(0);
    }
    stream.write_all(FRAME_MARKER).await?;
    stream.write_all(&buf[..first]).await?;
    let rest = io::copy(archive, stream).await?;
    stream.flush().await?;
    Ok(first as u64 + rest)
}
