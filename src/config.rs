//! Optional defaults file.
//!
//! Looked up at `<config dir>/tarpipe/config.toml` unless a path is given on
//! the command line. Every key is optional; command-line flags win.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::sync::{DEFAULT_IGNORE_FILE, DEFAULT_POLL_INTERVAL};
use crate::tar::TarChoice;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Filter files through the ignore file
    pub gitignore: bool,
    /// Ignore file name at the source root
    pub ignore_file: String,
    /// Copy every file before watching
    pub initial_replication: bool,
    /// Keep watching for changes after the initial copy
    pub watch: bool,
    pub poll_interval_ms: u64,
    /// Stop watching after this many idle seconds
    pub idle_timeout_secs: Option<u64>,
    pub local_tar: TarChoice,
    pub remote_tar: TarChoice,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gitignore: true,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            initial_replication: true,
            watch: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            idle_timeout_secs: None,
            local_tar: TarChoice::Detect,
            remote_tar: TarChoice::Gnu,
        }
    }
}

impl Config {
    /// Default config file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tarpipe").join("config.toml"))
    }

    /// Load `explicit` (which must exist) or the default file (if present).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| crate::error::io_err(path, e))?;
        let config = Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be greater than zero".into()));
        }
        if self.ignore_file.trim().is_empty() {
            return Err(Error::Config("ignore_file must not be empty".into()));
        }
        if !matches!(
            self.remote_tar,
            TarChoice::Detect | TarChoice::Gnu | TarChoice::GnuPrefix
        ) {
            return Err(Error::Config(format!(
                "remote_tar must be a GNU tar choice or detect, got {:?}",
                self.remote_tar
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
