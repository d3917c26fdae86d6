//! Report archive extraction.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use super::{ReportError, ReportResult};

/// One extracted report file.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    /// Path inside the archive, with forward slashes.
    pub relative_path: String,
    pub path: PathBuf,
}

/// Files extracted into a scratch directory that is deleted on drop.
#[derive(Debug)]
pub struct ExtractedArchive {
    _dir: TempDir,
    files: Vec<ExtractedFile>,
}

impl ExtractedArchive {
    /// Extracted files in archive order.
    pub fn files(&self) -> &[ExtractedFile] {
        &self.files
    }
}

/// Unpacks every regular, non-hidden file of a zip archive.
///
/// Entries whose names would escape the scratch directory are skipped.
pub fn extract(archive_path: &Path) -> ReportResult<ExtractedArchive> {
    let file = File::open(archive_path).map_err(|source| ReportError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ReportError::Archive {
        path: archive_path.to_path_buf(),
        message: e.to_string(),
    })?;

    let dir = tempfile::Builder::new()
        .prefix("testcloud-reports")
        .tempdir()
        .map_err(|source| ReportError::Io {
            path: std::env::temp_dir(),
            source,
        })?;

    let mut files = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| ReportError::Archive {
            path: archive_path.to_path_buf(),
            message: e.to_string(),
        })?;

        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name() else {
            debug!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let hidden = relative
            .file_name()
            .map(|name| name.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if hidden {
            continue;
        }

        let destination = dir.path().join(&relative);
        let io_err = |source: io::Error| ReportError::Io {
            path: destination.clone(),
            source,
        };
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut output = File::create(&destination).map_err(io_err)?;
        io::copy(&mut entry, &mut output).map_err(io_err)?;

        files.push(ExtractedFile {
            relative_path: relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            path: destination,
        });
    }

    debug!(
        "Extracted {} report files from {}",
        files.len(),
        archive_path.display()
    );
    Ok(ExtractedArchive { _dir: dir, files })
}
