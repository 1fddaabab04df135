//! Tar flavor detection.
//!
//! Detection runs before the long-lived session exists, because the receiver
//! script is templated with the remote flavor's extract command.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{TarFlavor, VERSION_OPTION};
use crate::error::{Error, Result};

/// Candidates tried on the local side, in order.
pub fn default_local_candidates() -> Vec<TarFlavor> {
    vec![
        TarFlavor::gnu(),
        TarFlavor::gnu_with_prefix("g"),
        TarFlavor::Bsd,
        TarFlavor::BusyBox,
    ]
}

/// Candidates tried on the remote side. Only GNU tar can run the receiver.
pub fn default_remote_candidates() -> Vec<TarFlavor> {
    vec![TarFlavor::gnu(), TarFlavor::gnu_with_prefix("g")]
}

/// Find the first candidate whose local `--version` output it recognises.
///
/// A missing binary or a failing probe just moves on to the next candidate.
pub async fn detect_local(candidates: &[TarFlavor]) -> Option<TarFlavor> {
    for flavor in candidates {
        let output = match Command::new(flavor.program())
            .arg(VERSION_OPTION)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(program = %flavor.program(), error = %err, "local tar probe failed to run");
                continue;
            }
        };
        if !output.status.success() {
            tracing::debug!(program = %flavor.program(), status = %output.status, "local tar probe exited nonzero");
            continue;
        }
        if flavor.matches(&String::from_utf8_lossy(&output.stdout)) {
            tracing::debug!(%flavor, "detected local tar");
            return Some(flavor.clone());
        }
    }
    None
}

/// Find the first candidate recognised through the connection command.
///
/// Every candidate gets its own throwaway shell: the probe line is written to
/// its stdin, stdin is closed and stdout captured. Being unable to start the
/// shell at all is an error, not "no match".
pub async fn detect_remote(
    shell_command: &[String],
    candidates: &[TarFlavor],
) -> Result<Option<TarFlavor>> {
    let (program, args) = shell_command
        .split_first()
        .ok_or(Error::MissingConnectionCommand)?;

    for flavor in candidates {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::ProbeLaunch {
                command: shell_command.join(" "),
                source,
            })?;

        let probe = format!("{} {}\n", flavor.program(), VERSION_OPTION);
        if let Some(mut stdin) = child.stdin.take() {
            // A shell that already exited just closes the pipe early; the
            // empty output below then counts as no match.
            if let Err(err) = stdin.write_all(probe.as_bytes()).await {
                tracing::debug!(error = %err, "remote tar probe input rejected");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| Error::ProbeLaunch {
                command: shell_command.join(" "),
                source,
            })?;

        if flavor.matches(&String::from_utf8_lossy(&output.stdout)) {
            tracing::debug!(%flavor, "detected remote tar");
            return Ok(Some(flavor.clone()));
        }
    }
    Ok(None)
}
