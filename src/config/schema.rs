//! Configuration schema definitions for testcloud.
//!
//! Every section is optional. Values given on the command line override the
//! file.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ServiceConfig   - Where runs are created (base URL, owner/app, token)
//! ├── UploadConfig    - Upload concurrency
//! ├── RunConfig       - Device selection, locale, series, timeout
//! └── ReportConfig    - Where reports are downloaded and merged
//! ```

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::uploader::DEFAULT_MAX_CONCURRENT_UPLOADS;

/// Environment variable consulted when no API token is configured.
pub const API_TOKEN_ENV: &str = "TESTCLOUD_API_TOKEN";

/// Root configuration structure for testcloud.
///
/// # TOML Structure
///
/// ```toml
/// [service]
/// base_url = "https://api.testcloud.example"
/// owner = "acme"
/// app = "shop-android"
///
/// [upload]
/// max_concurrent_uploads = 8
///
/// [run]
/// devices = "acme/pixel-set"
/// locale = "en_US"
/// timeout_secs = 3600
///
/// [report]
/// output_dir = "test-results"
/// merged_file_name = "merged.xml"
/// ```
///
/// # Example
///
/// ```
/// use testcloud::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [service]
///     owner = "acme"
///     app = "shop"
/// "#).unwrap();
/// assert_eq!(config.upload.max_concurrent_uploads, 10);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Remote service settings.
///
/// `owner` and `app` have no default: they must be set here or with
/// `--app owner/app`.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `base_url` | `https://api.appcenter.ms` |
/// | `api_token` | `$TESTCLOUD_API_TOKEN` |
/// | `request_timeout_secs` | 300 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    pub owner: Option<String>,

    pub app: Option<String>,

    /// Sent as `X-API-Token`. Falls back to the environment when unset.
    pub api_token: Option<String>,

    /// Timeout of a single HTTP request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            owner: None,
            app: None,
            api_token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServiceConfig {
    /// Applies an `owner/app` override.
    pub fn set_app_identifier(&mut self, identifier: &str) -> Result<()> {
        match identifier.split_once('/') {
            Some((owner, app)) if !owner.is_empty() && !app.is_empty() && !app.contains('/') => {
                self.owner = Some(owner.to_string());
                self.app = Some(app.to_string());
                Ok(())
            }
            _ => bail!("Invalid app identifier '{identifier}', expected <owner>/<app>"),
        }
    }

    /// Owner and app the runs belong to.
    pub fn identity(&self) -> Result<(&str, &str)> {
        match (self.owner.as_deref(), self.app.as_deref()) {
            (Some(owner), Some(app)) => Ok((owner, app)),
            _ => bail!("No app specified. Set owner and app in [service] or pass --app <owner>/<app>"),
        }
    }

    /// The configured token, or the value of `TESTCLOUD_API_TOKEN`.
    pub fn resolve_api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var(API_TOKEN_ENV).ok())
            .filter(|token| !token.is_empty())
    }
}

fn default_base_url() -> String {
    "https://api.appcenter.ms".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

/// Upload settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Maximum number of files uploaded at once.
    ///
    /// Default: 10
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

fn default_max_concurrent_uploads() -> usize {
    DEFAULT_MAX_CONCURRENT_UPLOADS
}

/// Defaults for `run`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunConfig {
    /// Device selection slug or id.
    pub devices: Option<String>,

    pub locale: Option<String>,

    pub language: Option<String>,

    pub test_series: Option<String>,

    /// Seconds to wait for a run before giving up. Unset waits forever.
    pub timeout_secs: Option<u64>,
}

/// Report download settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory reports are downloaded to. Nothing is downloaded when unset.
    pub output_dir: Option<PathBuf>,

    /// File name of the merged report inside `output_dir`.
    pub merged_file_name: Option<String>,
}
