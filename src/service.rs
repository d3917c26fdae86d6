//! The remote test service boundary.
//!
//! Everything the pipeline needs from the device cloud goes through the
//! [`TestService`] trait, so the uploader, the state checker, and report
//! download can be driven by an in-memory fake in tests and by
//! [`HttpTestService`] in the binary.
//!
//! ```text
//! create_test_run ──► upload_by_hash ──(not 201)──► request_direct_upload_url ──► upload_file
//!                            │
//!                            └──(201: content already known)
//!                 ──► start_test_run ──► get_test_run_state* ──► get_report_artifacts ──► download_artifact
//! ```
//!
//! # Error Handling
//!
//! All operations return [`ServiceResult<T>`]. HTTP statuses are mapped to
//! [`ServiceError::NotFound`] (404), [`ServiceError::AlreadyExists`] (409)
//! and [`ServiceError::ServerRejected`] (anything else that is not 2xx);
//! network failures surface as [`ServiceError::Transport`]. No operation
//! retries.

pub mod http;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::manifest::TestRunFile;
use crate::state::RunState;

pub use http::HttpTestService;

/// Result type for remote service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors returned by the remote test service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The resource already exists (HTTP 409).
    #[error("Resource already exists")]
    AlreadyExists,

    /// The resource does not exist (HTTP 404).
    #[error("Resource not found")]
    NotFound,

    /// Any other non-success HTTP status.
    #[error("Server rejected the request with status {status}: {message}")]
    ServerRejected { status: u16, message: String },

    /// The request never produced an HTTP response.
    #[error("Transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// A response that should name a resource had no `Location` header.
    #[error("Response did not contain a Location header")]
    MissingLocation,

    /// A response body could not be decoded.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Local I/O failed while sending or receiving a file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            404 => ServiceError::NotFound,
            409 => ServiceError::AlreadyExists,
            _ => ServiceError::ServerRejected {
                status,
                message: message.into(),
            },
        }
    }

    /// True when the server answered with a status, as opposed to the
    /// request failing locally or on the network.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            ServiceError::AlreadyExists | ServiceError::NotFound | ServiceError::ServerRejected { .. }
        )
    }

    /// The HTTP status behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::AlreadyExists => Some(409),
            ServiceError::NotFound => Some(404),
            ServiceError::ServerRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else {
            ServiceError::Transport(err)
        }
    }
}

/// Settings submitted when a run is started.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunOptions {
    pub test_framework: String,
    pub device_selection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_series: Option<String>,
    pub test_parameters: serde_json::Map<String, serde_json::Value>,
}

/// Devices partitioned by compatibility with the uploaded app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResult {
    #[serde(default)]
    pub accepted_devices: Vec<String>,
    #[serde(default)]
    pub rejected_devices: Vec<String>,
}

/// Operations the pipeline consumes from the remote test service.
#[async_trait]
pub trait TestService: Send + Sync {
    /// Allocates a new run and returns its identifier.
    async fn create_test_run(&self) -> ServiceResult<String>;

    /// Links already-known content to the run by hash.
    ///
    /// `Ok(())` only when the server answered 201; every other status is an
    /// error the caller treats as "send the bytes instead".
    async fn upload_by_hash(&self, test_run_id: &str, file: &TestRunFile) -> ServiceResult<()>;

    /// Asks for a URL the raw file bytes can be posted to.
    async fn request_direct_upload_url(&self, test_run_id: &str) -> ServiceResult<String>;

    /// Posts the file as a multipart form to a direct upload URL.
    async fn upload_file(&self, upload_url: &str, file: &TestRunFile) -> ServiceResult<()>;

    async fn start_test_run(
        &self,
        test_run_id: &str,
        options: &StartRunOptions,
    ) -> ServiceResult<StartRunResult>;

    async fn get_test_run_state(&self, test_run_id: &str) -> ServiceResult<RunState>;

    /// Named report archive download URLs (e.g. `junit_xml_zip`).
    async fn get_report_artifacts(&self, test_run_id: &str) -> ServiceResult<HashMap<String, String>>;

    /// Streams `url` into `destination`.
    async fn download_artifact(&self, url: &str, destination: &Path) -> ServiceResult<()>;
}
