//! Test run inputs: the files that make up a run and the manifest describing them.
//!
//! A [`TestManifest`] is an immutable snapshot of everything that will be
//! uploaded for one run: the application binary, the test files, and the
//! test framework metadata. Every file is hashed when it is read, so the
//! manifest is complete before any network traffic happens.
//!
//! # Manifest File Format
//!
//! ```json
//! {
//!   "schemaVersion": "1.0.0",
//!   "cliVersion": "0.4.0",
//!   "files": ["tests/*.jar", { "sourcePath": "build/a.txt", "targetPath": "a.txt" }],
//!   "applicationFile": "app.apk",
//!   "testFramework": { "name": "espresso", "data": {} }
//! }
//! ```
//!
//! # Example
//!
//! ```no_run
//! use testcloud::manifest::reader::ManifestReader;
//!
//! let manifest = ManifestReader::read_from_file("artifacts/manifest.json".as_ref())?;
//! for file in manifest.test_files() {
//!     println!("{} {}", file.sha256(), file.target_relative_path());
//! }
//! # Ok::<(), testcloud::manifest::ManifestError>(())
//! ```

pub mod byte_range;
pub mod dsym;
pub mod included;
pub mod params;
pub mod path_resolver;
pub mod reader;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use path_resolver::PathResolver;
pub use reader::ManifestReader;

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors raised while resolving, hashing or reading test run inputs.
///
/// All of these are configuration errors: they are detected before any
/// network call is made and abort the run.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// A required value was missing or empty.
    #[error("Argument {0} is required")]
    MissingField(&'static str),

    /// A literal path named in a pattern does not exist.
    #[error("Cannot access file or directory \"{0}\"")]
    CannotAccess(PathBuf),

    /// A pattern matched a file outside of the workspace directory.
    #[error("Pattern cannot contain files that are outside of workspace directory: {0}")]
    OutsideWorkspace(PathBuf),

    /// A glob pattern was malformed.
    #[error("Invalid pattern \"{pattern}\": {message}")]
    InvalidPattern { pattern: String, message: String },

    /// A pattern that must name exactly one file named none.
    #[error("Pattern {0} did not resolve to any existing file")]
    NoMatch(String),

    /// A pattern that must name exactly one file named several.
    #[error("Pattern {0} resolved to more than one file")]
    Ambiguous(String),

    /// The manifest version is not a semantic version.
    #[error("Invalid manifest version \"{version}\": {message}")]
    InvalidVersion { version: String, message: String },

    /// The manifest JSON could not be parsed.
    #[error("Invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A `--test-parameter` value was rejected.
    #[error("{0}")]
    InvalidParameter(String),

    /// An `--include` value was rejected.
    #[error("{0}")]
    InvalidInclude(String),

    /// A dSYM directory did not have the expected layout.
    #[error("Invalid dSYM directory: {0}")]
    InvalidDsym(String),

    /// A byte range string was rejected.
    #[error("Invalid byte range: \"{0}\"")]
    InvalidByteRange(String),

    /// Reading a file failed.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The role a file plays in a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    /// The application under test (`.apk` / `.ipa`).
    AppFile,
    /// Debug symbols for the application.
    DsymFile,
    /// Anything the test framework needs on the device host.
    TestFile,
}

impl FileType {
    /// Wire name of the file type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::AppFile => "app-file",
            FileType::DsymFile => "dsym-file",
            FileType::TestFile => "test-file",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical file contributed to a test run.
///
/// The file's identity for deduplication is its SHA-256 content hash, not
/// its path: two files with identical bytes share a hash no matter where
/// they live or where they are uploaded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunFile {
    source_path: PathBuf,
    target_relative_path: String,
    sha256: String,
    file_type: FileType,
}

impl TestRunFile {
    /// Reads `source_path` and creates a file entry stamped with its hash.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Io`] if the file cannot be read.
    pub fn create(
        source_path: impl Into<PathBuf>,
        target_relative_path: impl Into<String>,
        file_type: FileType,
    ) -> ManifestResult<Self> {
        let source_path = source_path.into();
        let sha256 = compute_file_hash(&source_path)?;
        Self::new(source_path, target_relative_path, sha256, file_type)
    }

    /// Creates a file entry from an already computed hash.
    ///
    /// Backslashes in the target path are normalized to forward slashes.
    pub fn new(
        source_path: impl Into<PathBuf>,
        target_relative_path: impl Into<String>,
        sha256: impl Into<String>,
        file_type: FileType,
    ) -> ManifestResult<Self> {
        let source_path = source_path.into();
        let target_relative_path = target_relative_path.into();
        let sha256 = sha256.into();

        if source_path.as_os_str().is_empty() {
            return Err(ManifestError::MissingField("sourcePath"));
        }
        if target_relative_path.is_empty() {
            return Err(ManifestError::MissingField("targetRelativePath"));
        }
        if sha256.is_empty() {
            return Err(ManifestError::MissingField("sha256"));
        }

        Ok(Self {
            source_path,
            target_relative_path: target_relative_path.replace('\\', "/"),
            sha256,
            file_type,
        })
    }

    /// Absolute (or workspace-joined) path of the file on disk.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// POSIX-style path the service uses to reference the file.
    pub fn target_relative_path(&self) -> &str {
        &self.target_relative_path
    }

    /// Lowercase hex SHA-256 of the file content.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }
}

/// Test framework selection plus framework-specific run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TestFrameworkData {
    name: String,
    data: serde_json::Map<String, serde_json::Value>,
}

impl TestFrameworkData {
    /// Creates framework data; `name` must not be empty.
    pub fn new(
        name: impl Into<String>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> ManifestResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ManifestError::MissingField("testFramework.name"));
        }
        Ok(Self { name, data })
    }

    /// Name of the server-side framework adapter (e.g. `espresso`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.data
    }
}

/// Validated, hash-stamped description of one test run's inputs.
#[derive(Debug, Clone)]
pub struct TestManifest {
    version: String,
    cli_version: Option<String>,
    application_file: Option<TestRunFile>,
    test_files: Vec<TestRunFile>,
    test_framework: TestFrameworkData,
}

impl TestManifest {
    /// Builds a manifest. The version must be a non-empty semantic version.
    pub fn new(
        version: impl Into<String>,
        cli_version: Option<String>,
        application_file: Option<TestRunFile>,
        test_files: Vec<TestRunFile>,
        test_framework: TestFrameworkData,
    ) -> ManifestResult<Self> {
        let version = version.into();
        if version.is_empty() {
            return Err(ManifestError::MissingField("version"));
        }
        semver::Version::parse(&version).map_err(|e| ManifestError::InvalidVersion {
            version: version.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            version,
            cli_version,
            application_file,
            test_files,
            test_framework,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn cli_version(&self) -> Option<&str> {
        self.cli_version.as_deref()
    }

    /// The application binary, when the manifest names one.
    pub fn application_file(&self) -> Option<&TestRunFile> {
        self.application_file.as_ref()
    }

    /// Test files in manifest order.
    pub fn test_files(&self) -> &[TestRunFile] {
        &self.test_files
    }

    pub fn test_framework(&self) -> &TestFrameworkData {
        &self.test_framework
    }
}

/// Computes the SHA-256 hash of a file as a lowercase hex string.
///
/// Reads the file in chunks so large application packages are never held
/// in memory at once.
pub fn compute_file_hash(path: &Path) -> ManifestResult<String> {
    let io_err = |source: std::io::Error| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(io_err)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn framework() -> TestFrameworkData {
        TestFrameworkData::new("xcuitest", serde_json::Map::new()).unwrap()
    }

    #[test]
    fn test_hash_is_independent_of_paths() {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("first.txt");
        let second = temp_dir.path().join("nested_second.bin");
        fs::write(&first, b"same content").unwrap();
        fs::write(&second, b"same content").unwrap();

        let a = TestRunFile::create(&first, "a/first.txt", FileType::TestFile).unwrap();
        let b = TestRunFile::create(&second, "b/second.bin", FileType::AppFile).unwrap();
        let again = TestRunFile::create(&first, "elsewhere.txt", FileType::TestFile).unwrap();

        assert_eq!(a.sha256(), b.sha256());
        assert_eq!(a.sha256(), again.sha256());
        assert_eq!(a.sha256().len(), 64);
    }

    #[test]
    fn test_known_sha256() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            compute_file_hash(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = TestRunFile::create("/nonexistent/app.apk", "app.apk", FileType::AppFile);
        assert!(matches!(result, Err(ManifestError::Io { .. })));
    }

    #[test]
    fn test_target_path_backslashes_are_normalized() {
        let file = TestRunFile::new(
            "/tmp/x",
            r"features\support\env.rb",
            "00ff",
            FileType::TestFile,
        )
        .unwrap();
        assert_eq!(file.target_relative_path(), "features/support/env.rb");
    }

    #[test]
    fn test_run_file_requires_fields() {
        assert!(TestRunFile::new("", "a", "00", FileType::TestFile).is_err());
        assert!(TestRunFile::new("/a", "", "00", FileType::TestFile).is_err());
        assert!(TestRunFile::new("/a", "a", "", FileType::TestFile).is_err());
    }

    #[test]
    fn test_framework_name_required() {
        assert!(matches!(
            TestFrameworkData::new("", serde_json::Map::new()),
            Err(ManifestError::MissingField(_))
        ));
    }

    #[test]
    fn test_manifest_version_required() {
        let result = TestManifest::new("", None, None, vec![], framework());
        assert!(matches!(result, Err(ManifestError::MissingField("version"))));

        let result = TestManifest::new("not-a-version", None, None, vec![], framework());
        assert!(matches!(result, Err(ManifestError::InvalidVersion { .. })));

        let manifest = TestManifest::new("1.0.0", None, None, vec![], framework()).unwrap();
        assert_eq!(manifest.version(), "1.0.0");
        assert!(manifest.application_file().is_none());
        assert!(manifest.test_files().is_empty());
    }

    #[test]
    fn test_file_type_wire_names() {
        assert_eq!(FileType::AppFile.as_str(), "app-file");
        assert_eq!(FileType::DsymFile.to_string(), "dsym-file");
        assert_eq!(
            serde_json::to_string(&FileType::TestFile).unwrap(),
            "\"test-file\""
        );
    }
}
