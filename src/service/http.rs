//! reqwest-backed [`TestService`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{ServiceError, ServiceResult, StartRunOptions, StartRunResult, TestService};
use crate::manifest::TestRunFile;
use crate::state::RunState;

const API_TOKEN_HEADER: &str = "X-API-Token";

/// Talks to the test service REST API for one `{owner}/{app}` pair.
#[derive(Debug, Clone)]
pub struct HttpTestService {
    client: Client,
    base_url: Url,
    owner: String,
    app: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashUploadRequest<'a> {
    checksum: &'a str,
    file_type: &'a str,
    relative_path: &'a str,
}

#[derive(Deserialize)]
struct ReportResponse {
    #[serde(default)]
    stats: ReportStats,
}

#[derive(Default, Deserialize)]
struct ReportStats {
    #[serde(default)]
    artifacts: HashMap<String, String>,
}

impl HttpTestService {
    pub fn new(
        base_url: &str,
        owner: impl Into<String>,
        app: impl Into<String>,
        request_timeout: Duration,
    ) -> ServiceResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ServiceError::Decode(format!("invalid base URL {base_url}: {e}")))?;
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            base_url,
            owner: owner.into(),
            app: app.into(),
            api_token: None,
        })
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn test_runs_url(&self) -> String {
        format!(
            "{}/v0.1/apps/{}/{}/test_runs",
            self.base_url.as_str().trim_end_matches('/'),
            self.owner,
            self.app
        )
    }

    fn test_run_url(&self, test_run_id: &str, suffix: &str) -> String {
        format!("{}/{}/{}", self.test_runs_url(), test_run_id, suffix)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.header(API_TOKEN_HEADER, token),
            None => request,
        }
    }

    /// Resolves a `Location` header against the base URL.
    fn location(&self, response: &Response) -> ServiceResult<String> {
        let value = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServiceError::MissingLocation)?;

        let url = self
            .base_url
            .join(value)
            .map_err(|e| ServiceError::Decode(format!("invalid Location header {value}: {e}")))?;
        Ok(url.to_string())
    }
}

/// Turns a non-success response into an error carrying the body text.
async fn check_status(response: Response) -> ServiceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ServiceError::from_status(status.as_u16(), text))
}

/// Last non-empty path segment of a URL or path.
fn last_segment(location: &str) -> Option<&str> {
    location
        .split(['?', '#'])
        .next()
        .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
        .filter(|segment| !segment.is_empty())
}

#[async_trait]
impl TestService for HttpTestService {
    async fn create_test_run(&self) -> ServiceResult<String> {
        debug!("Creating test run for {}/{}", self.owner, self.app);
        let response = self
            .authorized(self.client.post(self.test_runs_url()))
            .send()
            .await?;
        let response = check_status(response).await?;

        let location = self.location(&response)?;
        last_segment(&location)
            .map(str::to_string)
            .ok_or(ServiceError::MissingLocation)
    }

    async fn upload_by_hash(&self, test_run_id: &str, file: &TestRunFile) -> ServiceResult<()> {
        let body = HashUploadRequest {
            checksum: file.sha256(),
            file_type: file.file_type().as_str(),
            relative_path: file.target_relative_path(),
        };
        let response = self
            .authorized(self.client.post(self.test_run_url(test_run_id, "hashes")))
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 201 {
            debug!("{} linked by hash", file.target_relative_path());
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(ServiceError::from_status(status, text))
    }

    async fn request_direct_upload_url(&self, test_run_id: &str) -> ServiceResult<String> {
        let response = self
            .authorized(self.client.post(self.test_run_url(test_run_id, "files")))
            .send()
            .await?;
        let response = check_status(response).await?;
        self.location(&response)
    }

    /// Streams the file as a multipart form to the direct upload URL.
    ///
    /// The URL is server-supplied and may point at another host, so the API
    /// token is not sent with it.
    async fn upload_file(&self, upload_url: &str, file: &TestRunFile) -> ServiceResult<()> {
        let source = tokio::fs::File::open(file.source_path()).await?;
        let length = source.metadata().await?.len();
        let file_name = file
            .source_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.target_relative_path().to_string());

        debug!(
            "Uploading {} ({} bytes) to {}",
            file.target_relative_path(),
            length,
            upload_url
        );

        let body = Body::wrap_stream(ReaderStream::new(source));
        let form = Form::new()
            .text("relative_path", file.target_relative_path().to_string())
            .text("file_type", file.file_type().as_str())
            .part("file", Part::stream_with_length(body, length).file_name(file_name));

        let response = self.client.post(upload_url).multipart(form).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn start_test_run(
        &self,
        test_run_id: &str,
        options: &StartRunOptions,
    ) -> ServiceResult<StartRunResult> {
        let response = self
            .authorized(self.client.put(self.test_run_url(test_run_id, "start")))
            .json(options)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn get_test_run_state(&self, test_run_id: &str) -> ServiceResult<RunState> {
        let response = self
            .authorized(self.client.get(self.test_run_url(test_run_id, "state")))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn get_report_artifacts(&self, test_run_id: &str) -> ServiceResult<HashMap<String, String>> {
        let response = self
            .authorized(self.client.get(self.test_run_url(test_run_id, "report")))
            .send()
            .await?;
        let response = check_status(response).await?;
        let report: ReportResponse = response.json().await?;
        Ok(report.stats.artifacts)
    }

    async fn download_artifact(&self, url: &str, destination: &Path) -> ServiceResult<()> {
        debug!("Downloading {} to {}", url, destination.display());
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileType;
    use mockito::Matcher;
    use tempfile::TempDir;

    fn service(server: &mockito::Server) -> HttpTestService {
        HttpTestService::new(&server.url(), "org", "my-app", Duration::from_secs(5))
            .unwrap()
            .with_api_token("secret")
    }

    fn sample_file(dir: &TempDir) -> TestRunFile {
        let path = dir.path().join("tests.jar");
        std::fs::write(&path, b"jar bytes").unwrap();
        TestRunFile::create(path, "lib/tests.jar", FileType::TestFile).unwrap()
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("/v0.1/apps/o/a/test_runs/abc-123"), Some("abc-123"));
        assert_eq!(last_segment("https://x/test_runs/abc/"), Some("abc"));
        assert_eq!(last_segment("https://x/test_runs/abc?x=1"), Some("abc"));
        assert_eq!(last_segment(""), None);
    }

    #[tokio::test]
    async fn test_create_test_run_reads_location() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v0.1/apps/org/my-app/test_runs")
            .match_header("x-api-token", "secret")
            .with_status(201)
            .with_header("location", "/v0.1/apps/org/my-app/test_runs/run-42")
            .create_async()
            .await;

        let id = service(&server).create_test_run().await.unwrap();

        assert_eq!(id, "run-42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_test_run_without_location() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v0.1/apps/org/my-app/test_runs")
            .with_status(201)
            .create_async()
            .await;

        let result = service(&server).create_test_run().await;
        assert!(matches!(result, Err(ServiceError::MissingLocation)));
    }

    #[tokio::test]
    async fn test_upload_by_hash_statuses() {
        let temp_dir = TempDir::new().unwrap();
        let file = sample_file(&temp_dir);
        let mut server = mockito::Server::new_async().await;

        let linked = server
            .mock("POST", "/v0.1/apps/org/my-app/test_runs/r1/hashes")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "checksum": file.sha256(),
                "fileType": "test-file",
                "relativePath": "lib/tests.jar",
            })))
            .with_status(201)
            .create_async()
            .await;
        server
            .mock("POST", "/v0.1/apps/org/my-app/test_runs/r2/hashes")
            .with_status(409)
            .create_async()
            .await;
        server
            .mock("POST", "/v0.1/apps/org/my-app/test_runs/r3/hashes")
            .with_status(200)
            .create_async()
            .await;

        let svc = service(&server);
        svc.upload_by_hash("r1", &file).await.unwrap();
        linked.assert_async().await;

        assert!(matches!(
            svc.upload_by_hash("r2", &file).await,
            Err(ServiceError::AlreadyExists)
        ));
        assert!(matches!(
            svc.upload_by_hash("r3", &file).await,
            Err(ServiceError::ServerRejected { status: 200, .. })
        ));
    }

    #[tokio::test]
    async fn test_direct_upload_streams_without_token() {
        let temp_dir = TempDir::new().unwrap();
        let file = sample_file(&temp_dir);
        let mut server = mockito::Server::new_async().await;

        server
            .mock("POST", "/v0.1/apps/org/my-app/test_runs/r1/files")
            .with_status(201)
            .with_header("location", "/uploads/slot-7")
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/uploads/slot-7")
            .match_header("x-api-token", Matcher::Missing)
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("name=\"relative_path\"".to_string()),
                Matcher::Regex("lib/tests.jar".to_string()),
                Matcher::Regex("test-file".to_string()),
                Matcher::Regex("jar bytes".to_string()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let svc = service(&server);
        let url = svc.request_direct_upload_url("r1").await.unwrap();
        assert_eq!(url, format!("{}/uploads/slot-7", server.url()));

        svc.upload_file(&url, &file).await.unwrap();
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_direct_upload_failure() {
        let temp_dir = TempDir::new().unwrap();
        let file = sample_file(&temp_dir);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/uploads/slot")
            .with_status(500)
            .with_body("disk full")
            .create_async()
            .await;

        let url = format!("{}/uploads/slot", server.url());
        let err = service(&server).upload_file(&url, &file).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_start_and_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/v0.1/apps/org/my-app/test_runs/r1/start")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "testFramework": "espresso",
                "deviceSelection": "devs",
            })))
            .with_status(200)
            .with_body(r#"{ "acceptedDevices": ["Pixel 8"], "rejectedDevices": ["Nexus 4"] }"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v0.1/apps/org/my-app/test_runs/r1/state")
            .with_status(200)
            .with_body(r#"{ "message": ["Running"], "waitTime": 10 }"#)
            .create_async()
            .await;

        let svc = service(&server);
        let started = svc
            .start_test_run(
                "r1",
                &StartRunOptions {
                    test_framework: "espresso".to_string(),
                    device_selection: "devs".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(started.accepted_devices, vec!["Pixel 8"]);
        assert_eq!(started.rejected_devices, vec!["Nexus 4"]);

        let state = svc.get_test_run_state("r1").await.unwrap();
        assert_eq!(state.message, vec!["Running"]);
        assert_eq!(state.wait_time, 10);
        assert!(state.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v0.1/apps/org/my-app/test_runs/missing/state")
            .with_status(404)
            .create_async()
            .await;

        let result = service(&server).get_test_run_state("missing").await;
        assert!(matches!(result, Err(ServiceError::NotFound)));
    }

    #[tokio::test]
    async fn test_report_artifacts_and_download() {
        let temp_dir = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let archive_url = format!("{}/blobs/junit.zip", server.url());
        server
            .mock("GET", "/v0.1/apps/org/my-app/test_runs/r1/report")
            .with_status(200)
            .with_body(
                serde_json::json!({ "stats": { "artifacts": { "junit_xml_zip": archive_url } } })
                    .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/blobs/junit.zip")
            .with_status(200)
            .with_body("zip bytes")
            .create_async()
            .await;

        let svc = service(&server);
        let artifacts = svc.get_report_artifacts("r1").await.unwrap();
        assert_eq!(artifacts["junit_xml_zip"], archive_url);

        let destination = temp_dir.path().join("out/junit_xml_zip.zip");
        svc.download_artifact(&archive_url, &destination).await.unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"zip bytes");
    }
}
