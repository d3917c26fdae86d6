//! Manifest JSON parsing and file resolution.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use super::{
    FileType, ManifestError, ManifestResult, PathResolver, TestFrameworkData, TestManifest,
    TestRunFile,
};

/// On-disk manifest layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestJson {
    #[serde(default, alias = "version")]
    pub schema_version: Option<String>,

    #[serde(default)]
    pub cli_version: Option<String>,

    #[serde(default)]
    pub files: Option<Vec<FileEntry>>,

    #[serde(default)]
    pub application_file: Option<String>,

    #[serde(default)]
    pub test_framework: Option<TestFrameworkJson>,
}

/// One entry of the manifest's `files` array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    /// A glob pattern; every match is uploaded under its workspace-relative path.
    GlobPattern(String),
    /// A single file uploaded under an explicit target path.
    #[serde(rename_all = "camelCase")]
    ExplicitPair {
        source_path: String,
        target_path: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestFrameworkJson {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Turns manifest JSON plus a workspace into a hash-stamped [`TestManifest`].
#[derive(Debug, Clone)]
pub struct ManifestReader {
    resolver: PathResolver,
}

impl ManifestReader {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Reads a manifest file; its directory becomes the workspace.
    pub fn read_from_file(path: &Path) -> ManifestResult<TestManifest> {
        let io_err = |source: std::io::Error| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };
        let absolute = std::path::absolute(path).map_err(io_err)?;
        let workspace = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        info!("Reading test manifest {}", path.display());

        let content = fs::read_to_string(&absolute).map_err(io_err)?;

        Self::new(PathResolver::new(workspace)).read_manifest_str(&content)
    }

    pub fn read_manifest_str(&self, content: &str) -> ManifestResult<TestManifest> {
        let json: ManifestJson = serde_json::from_str(content)?;
        self.read_manifest(json)
    }

    /// Resolves and hashes every file the manifest names.
    ///
    /// Glob patterns are resolved together (union, sorted) and come first,
    /// followed by explicit pairs in manifest order.
    pub fn read_manifest(&self, json: ManifestJson) -> ManifestResult<TestManifest> {
        let version = json
            .schema_version
            .ok_or(ManifestError::MissingField("schemaVersion"))?;
        let entries = json.files.ok_or(ManifestError::MissingField("files"))?;
        let framework = json
            .test_framework
            .ok_or(ManifestError::MissingField("testFramework"))?;

        let test_files = self.read_test_files(&entries)?;
        let application_file = json
            .application_file
            .as_deref()
            .map(|pattern| self.read_application_file(pattern))
            .transpose()?;

        debug!(
            "Manifest resolved to {} test files (application file: {})",
            test_files.len(),
            application_file.is_some()
        );

        TestManifest::new(
            version,
            json.cli_version,
            application_file,
            test_files,
            TestFrameworkData::new(framework.name, framework.data)?,
        )
    }

    fn read_test_files(&self, entries: &[FileEntry]) -> ManifestResult<Vec<TestRunFile>> {
        let patterns: Vec<&str> = entries
            .iter()
            .filter_map(|entry| match entry {
                FileEntry::GlobPattern(pattern) => Some(pattern.as_str()),
                FileEntry::ExplicitPair { .. } => None,
            })
            .collect();

        let mut files = Vec::new();
        for relative in self.resolver.resolve(&patterns)? {
            let full_path = self.resolver.workspace().join(&relative);
            files.push(TestRunFile::create(full_path, relative, FileType::TestFile)?);
        }

        for entry in entries {
            if let FileEntry::ExplicitPair {
                source_path,
                target_path,
            } = entry
            {
                let relative = self.resolve_single(source_path)?;
                let full_path = self.resolver.workspace().join(&relative);
                files.push(TestRunFile::create(
                    full_path,
                    target_path.as_str(),
                    FileType::TestFile,
                )?);
            }
        }

        Ok(files)
    }

    fn read_application_file(&self, pattern: &str) -> ManifestResult<TestRunFile> {
        let relative = self.resolve_single(pattern)?;
        let file_name = relative.rsplit('/').next().unwrap_or(&relative).to_string();
        TestRunFile::create(
            self.resolver.workspace().join(&relative),
            file_name,
            FileType::AppFile,
        )
    }

    fn resolve_single(&self, pattern: &str) -> ManifestResult<String> {
        let mut matches = self.resolver.resolve_one(pattern)?;
        match matches.len() {
            0 => Err(ManifestError::NoMatch(pattern.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(ManifestError::Ambiguous(pattern.to_string())),
        }
    }
}
