//! Glob resolution confined to a workspace directory.
//!
//! Later stages build upload targets straight from the paths returned here,
//! so a match that lands outside the workspace is a hard error rather than
//! something to filter out quietly.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::{ManifestError, ManifestResult};

const WILDCARDS: &[char] = &['*', '?', '['];

/// Resolves file patterns to sorted, workspace-relative file paths.
#[derive(Debug, Clone)]
pub struct PathResolver {
    workspace: PathBuf,
}

impl PathResolver {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolves every pattern independently and returns the union, sorted
    /// and deduplicated. Paths use forward slashes on every platform.
    ///
    /// # Errors
    ///
    /// - [`ManifestError::CannotAccess`] if a literal path does not exist
    /// - [`ManifestError::OutsideWorkspace`] if any match escapes the workspace
    /// - [`ManifestError::InvalidPattern`] if a pattern is not a valid glob
    pub fn resolve<S: AsRef<str>>(&self, patterns: &[S]) -> ManifestResult<Vec<String>> {
        let mut all = BTreeSet::new();
        for pattern in patterns {
            all.extend(self.resolve_single_pattern(pattern.as_ref())?);
        }
        Ok(all.into_iter().collect())
    }

    /// Resolves a single pattern.
    pub fn resolve_one(&self, pattern: &str) -> ManifestResult<Vec<String>> {
        self.resolve(&[pattern])
    }

    fn resolve_single_pattern(&self, pattern: &str) -> ManifestResult<Vec<String>> {
        let mut glob_pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&self.workspace.to_string_lossy()),
            pattern
        );

        if !pattern.contains(WILDCARDS) {
            let literal = self.workspace.join(pattern);
            let metadata =
                std::fs::metadata(&literal).map_err(|_| ManifestError::CannotAccess(literal.clone()))?;
            if metadata.is_dir() {
                glob_pattern = format!(
                    "{}/**/*",
                    glob::Pattern::escape(&literal.to_string_lossy()).trim_end_matches('/')
                );
            }
        }

        debug!("Resolving pattern {}", glob_pattern);

        let matches = glob::glob(&glob_pattern).map_err(|e| ManifestError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut result = Vec::new();
        for entry in matches {
            let path = entry.map_err(|e| ManifestError::Io {
                path: e.path().to_path_buf(),
                source: std::io::Error::new(e.error().kind(), e.error().to_string()),
            })?;
            if let Some(relative) = self.validate_and_make_relative(&path)? {
                result.push(relative);
            }
        }

        Ok(result)
    }

    /// Returns `None` for directories, the relative path for files inside
    /// the workspace, and an error for anything outside it.
    fn validate_and_make_relative(&self, path: &Path) -> ManifestResult<Option<String>> {
        let relative = path
            .strip_prefix(&self.workspace)
            .map_err(|_| ManifestError::OutsideWorkspace(path.to_path_buf()))?;

        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(ManifestError::OutsideWorkspace(path.to_path_buf()));
        }

        if path.is_dir() {
            return Ok(None);
        }

        let joined = relative
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Some(joined))
    }
}
