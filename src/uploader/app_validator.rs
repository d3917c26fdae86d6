//! Local checks on the application package before anything is uploaded.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::manifest::byte_range::ByteRange;

const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";
const ZIP_SIGNATURE_RANGE: &str = "0-3";

/// Result type for application validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("The application file must be either Android or iOS application: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("The application file is not a valid package archive: {0}")]
    NotAnArchive(PathBuf),

    #[error(
        "Shared runtime apps are not supported yet. Your application needs to be compiled for release."
    )]
    SharedRuntime,

    #[error("Failed to read application archive {path}: {message}")]
    Archive { path: PathBuf, message: String },
}

/// Target platform, derived from the package extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("apk") => Some(Platform::Android),
            Some("ipa") => Some(Platform::Ios),
            _ => None,
        }
    }
}

/// Checks the extension, the archive signature, and for Android packages
/// rejects shared-runtime builds.
pub fn validate_app_file(path: &Path) -> ValidationResult<Platform> {
    let platform = Platform::from_path(path)
        .ok_or_else(|| ValidationError::UnsupportedFormat(path.to_path_buf()))?;

    let range: ByteRange = ZIP_SIGNATURE_RANGE
        .parse()
        .map_err(|e| archive_error(path, e))?;
    let signature = range
        .read(path)
        .map_err(|e| archive_error(path, e))?;
    if signature != ZIP_SIGNATURE {
        return Err(ValidationError::NotAnArchive(path.to_path_buf()));
    }

    if platform == Platform::Android && uses_shared_runtime(path)? {
        return Err(ValidationError::SharedRuntime);
    }

    debug!("Application file {} validated as {:?}", path.display(), platform);
    Ok(platform)
}

/// True when the package links the Mono runtime without embedding it.
pub fn uses_shared_runtime(path: &Path) -> ValidationResult<bool> {
    let file = File::open(path).map_err(|e| archive_error(path, e))?;
    let archive = zip::ZipArchive::new(file).map_err(|e| archive_error(path, e))?;

    let has_entry = |suffix: &str| archive.file_names().any(|name| name.ends_with(suffix));
    let monodroid = has_entry("libmonodroid.so");
    let runtime = has_entry("mscorlib.dll");
    let bundle = has_entry("libmonodroid_bundle_app.so");

    Ok(monodroid && !runtime && !bundle)
}

fn archive_error(path: &Path, err: impl std::fmt::Display) -> ValidationError {
    ValidationError::Archive {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
