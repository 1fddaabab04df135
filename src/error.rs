use std::path::PathBuf;

use thiserror::Error;

use crate::tar::TarFlavor;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between picking a tar flavor and closing the session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a connection command is required to reach the destination")]
    MissingConnectionCommand,

    #[error("source {path} must exist and be a directory")]
    SourceNotDirectory { path: PathBuf },

    #[error("destination parent directory {path} must be an absolute path")]
    DestinationNotAbsolute { path: PathBuf },

    #[error("source {path} has no final path component to name the destination")]
    NoSourceName { path: PathBuf },

    #[error("cannot use {flavor} on the remote side; only GNU tar can drive the receiver loop")]
    UnsupportedRemoteTar { flavor: TarFlavor },

    #[error("no usable local tar found (tried {tried})")]
    NoLocalTar { tried: String },

    #[error("no usable remote tar found (tried {tried})")]
    NoRemoteTar { tried: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to run connection command `{command}` for tar probe: {source}")]
    ProbeLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not inside source directory {root}")]
    OutsideSource { path: PathBuf, root: PathBuf },

    #[error("tar failed on {path}: {stderr}")]
    Archive { path: PathBuf, stderr: String },

    #[error("remote session exited with {}", exit_label(.code))]
    SessionExit { code: Option<i32> },

    #[error("remote session input is already closed")]
    SessionClosed,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("ignore rules error: {0}")]
    Ignore(#[from] ignore::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Configuration errors are detected before any session is opened.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingConnectionCommand
                | Error::SourceNotDirectory { .. }
                | Error::DestinationNotAbsolute { .. }
                | Error::NoSourceName { .. }
                | Error::UnsupportedRemoteTar { .. }
                | Error::NoLocalTar { .. }
                | Error::NoRemoteTar { .. }
                | Error::Config(_)
                | Error::ProbeLaunch { .. }
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
    Error::Io {
        path: path.into(),
        source,
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}
