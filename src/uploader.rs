//! Test run submission.
//!
//! [`Uploader::upload_and_start`] drives one run from manifest to start:
//!
//! 1. **Validating arguments**: read the manifest (and any `--include` files)
//! 2. **Creating new test run**: allocate a run id on the service
//! 3. **Validating application file**: manifest app file, else `--app-path`
//! 4. **Uploading files**: application first, then everything else with at
//!    most `max_concurrent_uploads` uploads in flight
//! 5. **Starting test run**: submit framework, devices and parameters
//!
//! Every file goes through the hash-first protocol: the service is asked to
//! link the content by SHA-256, and only when it does not answer `201` are
//! the bytes sent to a direct upload URL.
//!
//! Any failure aborts the run; there is no partial success and no retry.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use testcloud::service::HttpTestService;
//! use testcloud::uploader::Uploader;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = HttpTestService::new("https://api.example.com", "org", "app", Duration::from_secs(60))?;
//! let started = Uploader::new(&service, "build/manifest.json", "a1b2c3")
//!     .with_app_path("build/app.apk")
//!     .with_locale("en_US")
//!     .upload_and_start()
//!     .await?;
//! println!("Started {}", started.test_run_id);
//! # Ok(())
//! # }
//! ```

pub mod app_validator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::manifest::included::parse_included_files;
use crate::manifest::params::merge_parameters;
use crate::manifest::{
    FileType, ManifestError, ManifestReader, TestManifest, TestRunFile, dsym,
};
use crate::progress::{NullProgress, Progress};
use crate::service::{ServiceError, StartRunOptions, TestService};

pub use app_validator::{Platform, ValidationError, validate_app_file};

/// Default cap on simultaneous uploads.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 10;

/// Errors that abort a submission.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// A required argument is missing or inconsistent.
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The bytes of a file could not be sent.
    #[error("Cannot upload file {path}: {source}")]
    DirectUpload {
        path: String,
        #[source]
        source: ServiceError,
    },

    /// The upload gate was closed while files were still waiting.
    #[error("Upload cancelled")]
    Cancelled,
}

/// A run that was created, uploaded and started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedTestRun {
    pub test_run_id: String,
    pub accepted_devices: Vec<String>,
    pub rejected_devices: Vec<String>,
}

/// Uploads one test run and starts it.
pub struct Uploader<'a, S: TestService> {
    service: &'a S,
    manifest_path: PathBuf,
    devices: String,
    app_path: Option<PathBuf>,
    dsym_dir: Option<PathBuf>,
    included_files: Vec<String>,
    test_parameters: Map<String, Value>,
    test_series: Option<String>,
    locale: Option<String>,
    language: Option<String>,
    max_concurrent_uploads: usize,
    progress: Arc<dyn Progress>,
}

impl<'a, S: TestService> Uploader<'a, S> {
    /// Creates an uploader for the manifest at `manifest_path`, targeting the
    /// device selection `devices`.
    pub fn new(service: &'a S, manifest_path: impl Into<PathBuf>, devices: impl Into<String>) -> Self {
        Self {
            service,
            manifest_path: manifest_path.into(),
            devices: devices.into(),
            app_path: None,
            dsym_dir: None,
            included_files: Vec::new(),
            test_parameters: Map::new(),
            test_series: None,
            locale: None,
            language: None,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            progress: Arc::new(NullProgress),
        }
    }

    /// Application package used when the manifest does not name one.
    pub fn with_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_path = Some(path.into());
        self
    }

    pub fn with_dsym_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dsym_dir = Some(path.into());
        self
    }

    /// Extra `--include` entries, resolved against the manifest directory.
    pub fn with_included_files(mut self, included: Vec<String>) -> Self {
        self.included_files = included;
        self
    }

    /// Parameters merged over the manifest's framework data.
    pub fn with_test_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.test_parameters = parameters;
        self
    }

    pub fn with_test_series(mut self, series: impl Into<String>) -> Self {
        self.test_series = Some(series.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_max_concurrent_uploads(mut self, max: usize) -> Self {
        self.max_concurrent_uploads = max.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every submission phase in order.
    pub async fn upload_and_start(&self) -> Result<StartedTestRun, UploadError> {
        self.progress.phase_started("Validating arguments");
        let (manifest, included) = self.validate_and_parse_manifest()?;
        self.progress.phase_finished("Validating arguments");

        self.progress.phase_started("Creating new test run");
        let test_run_id = self.service.create_test_run().await?;
        info!("Created test run {}", test_run_id);
        self.progress.phase_finished("Creating new test run");

        self.progress.phase_started("Validating application file");
        let app_file = self.validate_and_create_app_file(&manifest)?;
        self.progress.phase_finished("Validating application file");

        let mut other_files: Vec<TestRunFile> = manifest.test_files().to_vec();
        other_files.extend(included);
        if let Some(dsym_dir) = &self.dsym_dir {
            self.progress.phase_started("Validating dSYM file");
            other_files.push(dsym::dsym_file(dsym_dir)?);
            self.progress.phase_finished("Validating dSYM file");
        }

        self.progress.phase_started("Uploading files");
        self.upload_file(&test_run_id, &app_file).await?;
        self.upload_files(&test_run_id, &other_files).await?;
        self.progress.phase_finished("Uploading files");

        self.progress.phase_started("Starting test run");
        let options = StartRunOptions {
            test_framework: manifest.test_framework().name().to_string(),
            device_selection: self.devices.clone(),
            locale: self.locale.clone(),
            language: self.language.clone(),
            test_series: self.test_series.clone(),
            test_parameters: merge_parameters(manifest.test_framework().data(), &self.test_parameters),
        };
        let result = self.service.start_test_run(&test_run_id, &options).await?;
        self.progress.phase_finished("Starting test run");

        Ok(StartedTestRun {
            test_run_id,
            accepted_devices: result.accepted_devices,
            rejected_devices: result.rejected_devices,
        })
    }

    fn validate_and_parse_manifest(&self) -> Result<(TestManifest, Vec<TestRunFile>), UploadError> {
        if self.devices.is_empty() {
            return Err(UploadError::Configuration(
                "Argument devices is required".to_string(),
            ));
        }

        let manifest = ManifestReader::read_from_file(&self.manifest_path)?;

        let root_dir = match self.manifest_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let included = parse_included_files(&self.included_files, root_dir)?
            .into_iter()
            .map(|description| description.into_test_run_file())
            .collect::<Result<Vec<_>, _>>()?;

        Ok((manifest, included))
    }

    fn validate_and_create_app_file(&self, manifest: &TestManifest) -> Result<TestRunFile, UploadError> {
        let app_file = match (manifest.application_file(), &self.app_path) {
            (Some(file), _) => file.clone(),
            (None, Some(path)) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                TestRunFile::create(path, name, FileType::AppFile)?
            }
            (None, None) => {
                return Err(UploadError::Configuration(
                    "If test manifest doesn't contain path to application file, it must be provided using --app-path option"
                        .to_string(),
                ));
            }
        };

        validate_app_file(app_file.source_path())?;
        Ok(app_file)
    }

    /// Uploads files concurrently, holding a permit per in-flight upload.
    async fn upload_files(&self, test_run_id: &str, files: &[TestRunFile]) -> Result<(), UploadError> {
        let gate = Semaphore::new(self.max_concurrent_uploads);
        let gate = &gate;

        let uploads = files.iter().map(|file| async move {
            let _permit = gate.acquire().await.map_err(|_| UploadError::Cancelled)?;
            self.upload_file(test_run_id, file).await
        });

        futures::future::try_join_all(uploads).await?;
        Ok(())
    }

    /// Hash-first upload of a single file.
    async fn upload_file(&self, test_run_id: &str, file: &TestRunFile) -> Result<(), UploadError> {
        match self.service.upload_by_hash(test_run_id, file).await {
            Ok(()) => {
                self.progress.file_uploaded(file.target_relative_path(), true);
                return Ok(());
            }
            Err(err) if err.is_status() => {
                debug!(
                    "Hash upload of {} answered {:?}, sending content",
                    file.target_relative_path(),
                    err.status()
                );
            }
            Err(err) => return Err(err.into()),
        }

        let upload_url = self.service.request_direct_upload_url(test_run_id).await?;
        self.service
            .upload_file(&upload_url, file)
            .await
            .map_err(|source| UploadError::DirectUpload {
                path: file.target_relative_path().to_string(),
                source,
            })?;

        self.progress.file_uploaded(file.target_relative_path(), false);
        Ok(())
    }
}
