//! testcloud CLI - submit mobile test runs and merge their reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use testcloud::config::{self, Config};
use testcloud::manifest::ManifestReader;
use testcloud::manifest::params::parse_test_parameters;
use testcloud::progress::{ConsoleProgress, Progress};
use testcloud::report::{self, merger_for_archive_name};
use testcloud::service::HttpTestService;
use testcloud::state::{
    CANNOT_RUN_EXIT_CODE, StateChecker, TEST_FAILURES_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use testcloud::uploader::Uploader;

/// Exit code after Ctrl-C, as a shell reports SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "testcloud")]
#[command(about = "Run mobile tests on cloud devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testcloud.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// App the runs belong to, as <owner>/<app>
    #[arg(short, long, global = true)]
    app: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a test run and start it
    Run {
        /// Path to the test manifest
        #[arg(long)]
        manifest_path: PathBuf,

        /// Device selection slug or id
        #[arg(long)]
        devices: Option<String>,

        /// Application package, when the manifest has none
        #[arg(long)]
        app_path: Option<PathBuf>,

        /// dSYM directory to upload with an iOS app
        #[arg(long)]
        dsym_dir: Option<PathBuf>,

        #[arg(long)]
        locale: Option<String>,

        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        test_series: Option<String>,

        /// Extra file to upload, as <path> or <target>=<source>
        #[arg(long = "include")]
        include: Vec<String>,

        /// Test parameter as <key>=<value>
        #[arg(short = 'p', long = "test-parameter")]
        test_parameters: Vec<String>,

        /// Return after the run starts
        #[arg(long = "async")]
        no_wait: bool,

        /// Seconds to wait for the run to finish
        #[arg(long)]
        timeout: Option<u64>,

        /// Download reports to this directory when the run finishes
        #[arg(long)]
        test_output_dir: Option<PathBuf>,

        /// File name of the merged report inside the output directory
        #[arg(long)]
        merged_file_name: Option<String>,
    },

    /// Show the status of a test run
    Status {
        #[arg(long)]
        test_run_id: String,

        /// Keep polling until the run finishes
        #[arg(long)]
        continuous: bool,

        /// Seconds to wait when polling continuously
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Download the reports of a test run
    Download {
        #[arg(long)]
        test_run_id: String,

        #[arg(long)]
        test_output_dir: Option<PathBuf>,

        #[arg(long)]
        merged_file_name: Option<String>,

        /// Wait for the run to finish first
        #[arg(long)]
        continuous: bool,

        /// Seconds to wait when polling continuously
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Merge a downloaded report archive
    Merge {
        /// nunit_xml_zip.zip or junit_xml_zip.zip
        #[arg(long)]
        archive: PathBuf,

        /// Where to write the merged report
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Resolve a manifest and list its files
    Validate {
        #[arg(long)]
        manifest_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = config::expand_path(&cli.config);
    let mut config = config::load_config_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(app) = &cli.app {
        config.service.set_app_identifier(app)?;
    }
    let progress: Arc<dyn Progress> = Arc::new(ConsoleProgress::new(cli.verbose));

    let exit_code = match cli.command {
        Commands::Run {
            manifest_path,
            devices,
            app_path,
            dsym_dir,
            locale,
            language,
            test_series,
            include,
            test_parameters,
            no_wait,
            timeout,
            test_output_dir,
            merged_file_name,
        } => {
            let run = config.run.clone();
            let options = RunOptions {
                manifest_path: config::expand_path(&manifest_path),
                devices: devices.or(run.devices),
                app_path: app_path.map(|p| config::expand_path(&p)),
                dsym_dir: dsym_dir.map(|p| config::expand_path(&p)),
                locale: locale.or(run.locale),
                language: language.or(run.language),
                test_series: test_series.or(run.test_series),
                include,
                test_parameters,
                no_wait,
                timeout: timeout.or(run.timeout_secs),
                test_output_dir: test_output_dir
                    .or(config.report.output_dir.clone())
                    .map(|p| config::expand_path(&p)),
                merged_file_name: merged_file_name.or(config.report.merged_file_name.clone()),
            };
            run_tests(&config, options, progress).await?
        }
        Commands::Status {
            test_run_id,
            continuous,
            timeout,
        } => {
            let timeout = timeout.or(config.run.timeout_secs);
            show_status(&config, &test_run_id, continuous, timeout, progress).await?
        }
        Commands::Download {
            test_run_id,
            test_output_dir,
            merged_file_name,
            continuous,
            timeout,
        } => {
            let Some(output_dir) = test_output_dir.or(config.report.output_dir.clone()) else {
                bail!("Argument --test-output-dir is required");
            };
            let output_dir = config::expand_path(&output_dir);
            let merged_file_name = merged_file_name.or(config.report.merged_file_name.clone());
            download(
                &config,
                &test_run_id,
                &output_dir,
                merged_file_name.as_deref(),
                continuous,
                timeout.or(config.run.timeout_secs),
                progress,
            )
            .await?
        }
        Commands::Merge { archive, output } => {
            merge_archive(&config::expand_path(&archive), &config::expand_path(&output))?
        }
        Commands::Validate { manifest_path } => {
            validate_manifest(&config::expand_path(&manifest_path))?
        }
    };

    std::process::exit(exit_code);
}

struct RunOptions {
    manifest_path: PathBuf,
    devices: Option<String>,
    app_path: Option<PathBuf>,
    dsym_dir: Option<PathBuf>,
    locale: Option<String>,
    language: Option<String>,
    test_series: Option<String>,
    include: Vec<String>,
    test_parameters: Vec<String>,
    no_wait: bool,
    timeout: Option<u64>,
    test_output_dir: Option<PathBuf>,
    merged_file_name: Option<String>,
}

fn build_service(config: &Config) -> Result<HttpTestService> {
    let (owner, app) = config.service.identity()?;
    let mut service = HttpTestService::new(
        &config.service.base_url,
        owner,
        app,
        Duration::from_secs(config.service.request_timeout_secs),
    )
    .context("Failed to create service client")?;

    match config.service.resolve_api_token() {
        Some(token) => service = service.with_api_token(token),
        None => warn!(
            "No API token configured; set api_token in [service] or {}",
            config::API_TOKEN_ENV
        ),
    }
    Ok(service)
}

async fn run_tests(config: &Config, options: RunOptions, progress: Arc<dyn Progress>) -> Result<i32> {
    let service = build_service(config)?;
    let parameters = parse_test_parameters(&options.test_parameters)?;

    let mut uploader = Uploader::new(
        &service,
        &options.manifest_path,
        options.devices.unwrap_or_default(),
    )
    .with_included_files(options.include)
    .with_test_parameters(parameters)
    .with_max_concurrent_uploads(config.upload.max_concurrent_uploads)
    .with_progress(progress.clone());

    if let Some(app_path) = options.app_path {
        uploader = uploader.with_app_path(app_path);
    }
    if let Some(dsym_dir) = options.dsym_dir {
        uploader = uploader.with_dsym_dir(dsym_dir);
    }
    if let Some(locale) = options.locale {
        uploader = uploader.with_locale(locale);
    }
    if let Some(language) = options.language {
        uploader = uploader.with_language(language);
    }
    if let Some(series) = options.test_series {
        uploader = uploader.with_test_series(series);
    }

    let started = uploader.upload_and_start().await?;

    println!("Test run id: \"{}\"", started.test_run_id);
    if !started.accepted_devices.is_empty() {
        println!("Accepted devices:");
        for device in &started.accepted_devices {
            println!("  - {device}");
        }
    }
    if !started.rejected_devices.is_empty() {
        println!(
            "{}",
            console::style("Rejected devices (not compatible with the application):").yellow()
        );
        for device in &started.rejected_devices {
            println!("  - {device}");
        }
    }

    if options.no_wait {
        return Ok(0);
    }

    let checker = StateChecker::new(&service, &started.test_run_id).with_progress(progress);
    let exit_code = tokio::select! {
        result = checker.check_until_completed(options.timeout) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted. The test run keeps running on the service.");
            return Ok(INTERRUPTED_EXIT_CODE);
        }
    };

    if let Some(output_dir) = &options.test_output_dir {
        download_and_report(
            &service,
            &started.test_run_id,
            output_dir,
            options.merged_file_name.as_deref(),
        )
        .await?;
    }

    report_exit_code(exit_code);
    Ok(exit_code)
}

async fn show_status(
    config: &Config,
    test_run_id: &str,
    continuous: bool,
    timeout: Option<u64>,
    progress: Arc<dyn Progress>,
) -> Result<i32> {
    let service = build_service(config)?;
    let checker = StateChecker::new(&service, test_run_id).with_progress(progress);

    let exit_code = if continuous {
        tokio::select! {
            result = checker.check_until_completed(timeout) => result?,
            _ = tokio::signal::ctrl_c() => return Ok(INTERRUPTED_EXIT_CODE),
        }
    } else {
        checker.check_once().await?.exit_code.unwrap_or(0)
    };

    report_exit_code(exit_code);
    Ok(exit_code)
}

async fn download(
    config: &Config,
    test_run_id: &str,
    output_dir: &Path,
    merged_file_name: Option<&str>,
    continuous: bool,
    timeout: Option<u64>,
    progress: Arc<dyn Progress>,
) -> Result<i32> {
    let service = build_service(config)?;
    let checker = StateChecker::new(&service, test_run_id).with_progress(progress);

    let exit_code = if continuous {
        tokio::select! {
            result = checker.check_until_completed(timeout) => result?,
            _ = tokio::signal::ctrl_c() => return Ok(INTERRUPTED_EXIT_CODE),
        }
    } else {
        match checker.check_once().await?.exit_code {
            Some(exit_code) => exit_code,
            None => {
                println!("The test run is still in progress; reports are not available yet.");
                return Ok(0);
            }
        }
    };

    download_and_report(&service, test_run_id, output_dir, merged_file_name).await?;
    report_exit_code(exit_code);
    Ok(exit_code)
}

async fn download_and_report(
    service: &HttpTestService,
    test_run_id: &str,
    output_dir: &Path,
    merged_file_name: Option<&str>,
) -> Result<()> {
    let downloaded = report::download_reports(service, test_run_id, output_dir, merged_file_name)
        .await
        .with_context(|| format!("Failed to download reports for test run {test_run_id}"))?;

    for archive in &downloaded.archives {
        println!("Downloaded {}", archive.display());
    }
    if let Some(merged) = &downloaded.merged {
        println!("Merged report: {}", merged.display());
    }
    Ok(())
}

fn merge_archive(archive: &Path, output: &Path) -> Result<i32> {
    let archive_name = archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let merger = merger_for_archive_name(&archive_name)?;

    info!("Merging {} reports from {}", merger.dialect(), archive.display());
    let document = merger
        .merge_xml_results(archive)
        .with_context(|| format!("Failed to merge {}", archive.display()))?;
    report::write_document(&document, output)?;

    println!("Merged report: {}", output.display());
    Ok(0)
}

fn validate_manifest(manifest_path: &Path) -> Result<i32> {
    match ManifestReader::read_from_file(manifest_path) {
        Ok(manifest) => {
            println!("Manifest is valid!");
            println!();
            println!("  Version: {}", manifest.version());
            println!("  Framework: {}", manifest.test_framework().name());
            if let Some(app) = manifest.application_file() {
                println!("  Application: {} ({})", app.target_relative_path(), app.sha256());
            }
            println!("  Test files ({}):", manifest.test_files().len());
            for file in manifest.test_files() {
                println!("    {} {}", file.sha256(), file.target_relative_path());
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("Manifest error: {}", e);
            Ok(1)
        }
    }
}

fn report_exit_code(exit_code: i32) {
    match exit_code {
        0 | TIMEOUT_EXIT_CODE => {}
        TEST_FAILURES_EXIT_CODE => eprintln!("{}", console::style("There were test failures").red()),
        CANNOT_RUN_EXIT_CODE => eprintln!("{}", console::style("Cannot run tests").red()),
        code => eprintln!("Test run finished with exit code {code}"),
    }
}
