//! Report download and merging.
//!
//! A finished run publishes one zip archive of per-device XML reports. This
//! module downloads it and folds the per-device files into one document so
//! CI systems see a single report.
//!
//! # Dialects
//!
//! | Dialect | Artifact key | Archive name | File marker |
//! |---------|--------------|--------------|-------------|
//! | NUnit (v2 and v3) | `nunit_xml_zip` | `nunit_xml_zip.zip` | `-nunit-report` / `_nunit_report` |
//! | JUnit | `junit_xml_zip` | `junit_xml_zip.zip` | `_TEST` |
//!
//! # Merge Algorithm
//!
//! For every file in the archive, in archive order:
//!
//! 1. Parse it into an [`XmlDocument`]
//! 2. Append a device suffix, taken from the file name, to every test case
//!    name so identical tests from different devices stay distinct
//! 3. Remove skipped/ignored test cases and decrement the counters of every
//!    element that counted them
//! 4. Fold the document into the accumulator with the dialect's rules
//!
//! Combined counters are always summed and rounded to three decimals.
//!
//! # Example
//!
//! ```no_run
//! use testcloud::report::merger_for_archive_name;
//!
//! let merger = merger_for_archive_name("junit_xml_zip.zip")?;
//! let merged = merger.merge_xml_results("reports/junit_xml_zip.zip".as_ref())?;
//! std::fs::write("reports/merged.xml", merged.to_xml_string()?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod archive;
pub mod junit;
pub mod nunit;
pub mod xml;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use crate::service::{ServiceError, TestService};

pub use junit::JUnitMerger;
pub use nunit::NUnitMerger;
pub use xml::{Counter, XmlDocument, XmlElement, XmlNode};

/// Result type for report operations.
pub type ReportResult<T> = Result<T, ReportError>;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Neither known artifact key / archive name was present.
    #[error("Unexpected reports type")]
    UnexpectedReportsType,

    /// The service has not produced any report archives.
    #[error("XML reports have not been created")]
    NoReports,

    /// The archive held no report files to merge.
    #[error("Report archive {0} contains no report files")]
    EmptyArchive(PathBuf),

    #[error("Invalid report archive {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("Invalid XML: {0}")]
    Xml(String),

    /// A report's root element is not one this dialect understands.
    #[error("Unrecognized {dialect} report root <{root}>")]
    UnknownFormat { dialect: &'static str, root: String },

    /// NUnit v2 and v3 files were mixed in one archive.
    #[error("Cannot merge NUnit v2 and v3 reports into one document")]
    MixedNUnitVersions,

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Report merge task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Report dialect produced by a test framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDialect {
    NUnit,
    JUnit,
}

impl ReportDialect {
    /// Key of the dialect's archive in the run report artifacts.
    pub fn artifact_key(&self) -> &'static str {
        match self {
            ReportDialect::NUnit => "nunit_xml_zip",
            ReportDialect::JUnit => "junit_xml_zip",
        }
    }

    /// File name the archive is downloaded to.
    pub fn archive_name(&self) -> &'static str {
        match self {
            ReportDialect::NUnit => "nunit_xml_zip.zip",
            ReportDialect::JUnit => "junit_xml_zip.zip",
        }
    }
}

impl std::fmt::Display for ReportDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportDialect::NUnit => f.write_str("NUnit"),
            ReportDialect::JUnit => f.write_str("JUnit"),
        }
    }
}

/// Merges the per-device reports of one archive.
pub trait ReportMerger: Send + Sync {
    fn dialect(&self) -> ReportDialect;

    fn archive_name(&self) -> &'static str {
        self.dialect().archive_name()
    }

    /// Pattern whose first capture group is the device part of a report path.
    fn file_name_pattern(&self) -> &Regex;

    /// Accumulator a merge starts from, if the dialect has one.
    fn empty_document(&self) -> Option<XmlDocument>;

    /// Renames test cases and drops skipped ones from a single report.
    fn transform(&self, document: &mut XmlDocument, suffix: &str) -> ReportResult<()>;

    /// Folds `document` into `accumulator`.
    fn combine(
        &self,
        accumulator: Option<XmlDocument>,
        document: XmlDocument,
    ) -> ReportResult<XmlDocument>;

    /// Device suffix for a report path: the text before the dialect marker
    /// with dots replaced by underscores, or `unknown`.
    fn device_name(&self, relative_path: &str) -> String {
        self.file_name_pattern()
            .captures(relative_path)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().replace('.', "_"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Extracts the archive and merges every report in it.
    fn merge_xml_results(&self, archive_path: &Path) -> ReportResult<XmlDocument> {
        let extracted = archive::extract(archive_path)?;
        let mut accumulator = self.empty_document();

        for file in extracted.files() {
            let text = fs::read_to_string(&file.path).map_err(|source| ReportError::Io {
                path: file.path.clone(),
                source,
            })?;
            let mut document = XmlDocument::parse(&text)?;

            let device = self.device_name(&file.relative_path);
            debug!("Merging {} as device {}", file.relative_path, device);

            self.transform(&mut document, &format!("_{device}"))?;
            accumulator = Some(self.combine(accumulator, document)?);
        }

        accumulator.ok_or_else(|| ReportError::EmptyArchive(archive_path.to_path_buf()))
    }
}

/// Picks the merger for a run's report artifacts; NUnit wins when both exist.
pub fn merger_for_artifacts(
    artifacts: &HashMap<String, String>,
) -> ReportResult<Box<dyn ReportMerger>> {
    if artifacts.contains_key(ReportDialect::NUnit.artifact_key()) {
        Ok(Box::new(NUnitMerger::new()))
    } else if artifacts.contains_key(ReportDialect::JUnit.artifact_key()) {
        Ok(Box::new(JUnitMerger::new()))
    } else {
        Err(ReportError::UnexpectedReportsType)
    }
}

/// Picks the merger for a downloaded archive by its file name.
pub fn merger_for_archive_name(archive_name: &str) -> ReportResult<Box<dyn ReportMerger>> {
    if archive_name == ReportDialect::NUnit.archive_name() {
        Ok(Box::new(NUnitMerger::new()))
    } else if archive_name == ReportDialect::JUnit.archive_name() {
        Ok(Box::new(JUnitMerger::new()))
    } else {
        Err(ReportError::UnexpectedReportsType)
    }
}

/// Files produced by [`download_reports`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedReports {
    pub archives: Vec<PathBuf>,
    pub merged: Option<PathBuf>,
}

/// Downloads every report archive of a run into `output_dir` as
/// `{artifact_key}.zip` and, with `merged_file_name`, writes the merged
/// report next to them.
pub async fn download_reports<S: TestService>(
    service: &S,
    test_run_id: &str,
    output_dir: &Path,
    merged_file_name: Option<&str>,
) -> ReportResult<DownloadedReports> {
    let artifacts = service.get_report_artifacts(test_run_id).await?;
    if artifacts.is_empty() {
        return Err(ReportError::NoReports);
    }
    let merger = merger_for_artifacts(&artifacts)?;

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| ReportError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let mut keys: Vec<&String> = artifacts.keys().collect();
    keys.sort();

    let mut archives = Vec::with_capacity(keys.len());
    for key in keys {
        let destination = output_dir.join(format!("{key}.zip"));
        info!("Downloading {} to {}", key, destination.display());
        service.download_artifact(&artifacts[key], &destination).await?;
        archives.push(destination);
    }

    let merged = match merged_file_name {
        Some(name) => {
            let archive_path = output_dir.join(merger.archive_name());
            let merged_path = output_dir.join(name);
            let destination = merged_path.clone();
            // Extraction, parsing and writing are all blocking file work.
            tokio::task::spawn_blocking(move || {
                let document = merger.merge_xml_results(&archive_path)?;
                write_document(&document, &destination)
            })
            .await
            .map_err(|e| ReportError::Task(e.to_string()))??;
            Some(merged_path)
        }
        None => None,
    };

    Ok(DownloadedReports { archives, merged })
}

/// Writes a document to `path`, creating parent directories.
pub fn write_document(document: &XmlDocument, path: &Path) -> ReportResult<()> {
    let io_err = |source: std::io::Error| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, document.to_xml_string()?).map_err(io_err)?;
    info!("Merged report written to {}", path.display());
    Ok(())
}
