//! Ignore rules shared by the bulk and watch phases.
//!
//! Rules come from a gitignore-style file at the root of the source tree and
//! are compiled once per phase; nothing reloads them while a phase runs.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::Result;

/// Default ignore file name looked up at the source root.
pub const DEFAULT_IGNORE_FILE: &str = ".gitignore";

/// Compiled, immutable set of ignore rules.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    /// Matcher that ignores nothing.
    pub fn empty() -> Self {
        Self {
            gitignore: Gitignore::empty(),
        }
    }

    /// Load `<root>/<file_name>` if it exists; otherwise ignore nothing.
    pub fn from_root(root: &Path, file_name: &str) -> Result<Self> {
        let path = root.join(file_name);
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "no ignore file, matching nothing");
            return Ok(Self::empty());
        }
        let mut builder = GitignoreBuilder::new(root);
        if let Some(err) = builder.add(&path) {
            return Err(err.into());
        }
        let gitignore = builder.build()?;
        tracing::debug!(path = %path.display(), rules = gitignore.num_ignores(), "loaded ignore rules");
        Ok(Self { gitignore })
    }

    /// Compile rules given directly as lines.
    pub fn from_lines<'a>(root: &Path, lines: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for line in lines {
            builder.add_line(None, line)?;
        }
        Ok(Self {
            gitignore: builder.build()?,
        })
    }

    /// Whether `relative` (relative to the source root) or any directory
    /// above it is excluded.
    pub fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool {
        if relative.as_os_str().is_empty() || relative.is_absolute() {
            return false;
        }
        self.gitignore
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }

    pub fn is_empty(&self) -> bool {
        self.gitignore.is_empty()
    }
}

impl Default for IgnoreMatcher {
    fn default() -> Self {
        Self::empty()
    }
}
