//! testcloud: submit mobile test runs to a cloud device farm and merge
//! their reports.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Manifest**: Resolve the files that make up a run and hash them
//! - **Service**: Talk to the remote test service
//! - **Uploader**: Create a run, upload its files hash-first, start it
//! - **State**: Poll a run until it finishes or a timeout is reached
//! - **Report**: Download per-device NUnit/JUnit reports and merge them
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use testcloud::service::HttpTestService;
//! use testcloud::state::StateChecker;
//! use testcloud::uploader::Uploader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = HttpTestService::new("https://api.appcenter.ms", "acme", "shop", Duration::from_secs(300))?;
//!     let run = Uploader::new(&service, "manifest.json", "acme/pixels")
//!         .upload_and_start()
//!         .await?;
//!     let exit_code = StateChecker::new(&service, &run.test_run_id)
//!         .check_until_completed(Some(3600))
//!         .await?;
//!     std::process::exit(exit_code);
//! }
//! ```

pub mod config;
pub mod manifest;
pub mod progress;
pub mod report;
pub mod service;
pub mod state;
pub mod uploader;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use manifest::{ManifestReader, PathResolver, TestManifest, TestRunFile};
pub use report::ReportMerger;
pub use service::{HttpTestService, TestService};
pub use state::StateChecker;
pub use uploader::Uploader;
