//! Tar flavors and the command lines they need.
//!
//! Each session uses two tar invocations: a sender that archives exactly one
//! file to stdout, and a receiver that extracts one archive from stdin. The
//! argument conventions differ per flavor, so they live in one closed enum
//! rather than being assembled ad hoc.

pub mod detect;

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub use detect::{
    default_local_candidates, default_remote_candidates, detect_local, detect_remote,
};

/// Flag passed to every flavor to get its version banner.
pub const VERSION_OPTION: &str = "--version";

/// A tar dialect with fixed argument conventions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TarFlavor {
    /// GNU tar, optionally installed under a prefixed name (`gtar`).
    Gnu { prefix: String },
    /// libarchive's bsdtar.
    Bsd,
    /// The BusyBox applet.
    BusyBox,
}

impl TarFlavor {
    /// GNU tar invoked as plain `tar`.
    pub fn gnu() -> Self {
        Self::gnu_with_prefix("")
    }

    /// GNU tar invoked as `{prefix}tar`, e.g. `gtar` on macOS.
    pub fn gnu_with_prefix(prefix: impl Into<String>) -> Self {
        TarFlavor::Gnu {
            prefix: prefix.into(),
        }
    }

    pub fn is_gnu(&self) -> bool {
        matches!(self, TarFlavor::Gnu { .. })
    }

    /// Executable name.
    pub fn program(&self) -> String {
        match self {
            TarFlavor::Gnu { prefix } => format!("{prefix}tar"),
            TarFlavor::Bsd | TarFlavor::BusyBox => "tar".to_string(),
        }
    }

    fn receiver_options(&self) -> &'static [&'static str] {
        match self {
            TarFlavor::Gnu { .. } => &["--no-same-owner", "--extract", "--verbose"],
            TarFlavor::Bsd => &["-o", "-x", "-v"],
            TarFlavor::BusyBox => &["x", "-v"],
        }
    }

    /// Command that extracts one archive from stdin into the current directory.
    pub fn receiver_command(&self) -> Vec<String> {
        let mut cmd = vec![self.program()];
        cmd.extend(self.receiver_options().iter().map(|s| s.to_string()));
        cmd
    }

    /// Receiver command as a single line for embedding in shell text.
    ///
    /// Every token is a constant without shell metacharacters, so plain
    /// joining is safe here. File names never go through this path.
    pub fn receiver_command_line(&self) -> String {
        self.receiver_command().join(" ")
    }

    /// Command that archives `relative` (resolved against the working
    /// directory) to stdout.
    ///
    /// The path is a single argv element and is never seen by a shell. GNU
    /// tar is told to ignore failed reads so a file deleted after discovery
    /// yields an empty archive instead of a failure.
    pub fn sender_command(&self, relative: &Path) -> Vec<OsString> {
        let path = relative.as_os_str().to_os_string();
        let mut cmd: Vec<OsString> = vec![self.program().into()];
        match self {
            TarFlavor::Gnu { .. } => {
                cmd.push("--create".into());
                cmd.push(path);
                cmd.push("--to-stdout".into());
                cmd.push("--ignore-failed-read".into());
            }
            TarFlavor::Bsd => {
                cmd.extend(["-c", "-f", "-"].map(OsString::from));
                cmd.push(path);
            }
            TarFlavor::BusyBox => {
                cmd.extend(["c", "-f", "-"].map(OsString::from));
                cmd.push(path);
            }
        }
        cmd
    }

    /// Whether `--version` output identifies this flavor.
    pub fn matches(&self, probe_output: &str) -> bool {
        let needle = match self {
            TarFlavor::Gnu { .. } => "GNU tar",
            TarFlavor::Bsd => "bsdtar",
            TarFlavor::BusyBox => "busybox",
        };
        probe_output.contains(needle)
    }
}

impl fmt::Display for TarFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TarFlavor::Gnu { .. } => write!(f, "GNU tar [{}]", self.program()),
            TarFlavor::Bsd => write!(f, "BSD tar"),
            TarFlavor::BusyBox => write!(f, "BusyBox tar"),
        }
    }
}

/// How the operator asked for a tar flavor to be chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TarChoice {
    /// Probe the candidates and take the first that answers.
    Detect,
    /// GNU tar as `tar`.
    Gnu,
    /// GNU tar as `gtar`.
    GnuPrefix,
    /// bsdtar as `tar`.
    Bsd,
    /// BusyBox tar as `tar`.
    Busybox,
}

impl TarChoice {
    /// The fixed flavor for this choice, or `None` when it asks for detection.
    pub fn fixed(self) -> Option<TarFlavor> {
        match self {
            TarChoice::Detect => None,
            TarChoice::Gnu => Some(TarFlavor::gnu()),
            TarChoice::GnuPrefix => Some(TarFlavor::gnu_with_prefix("g")),
            TarChoice::Bsd => Some(TarFlavor::Bsd),
            TarChoice::Busybox => Some(TarFlavor::BusyBox),
        }
    }
}

impl FromStr for TarChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <TarChoice as clap::ValueEnum>::from_str(s, true)
    }
}
