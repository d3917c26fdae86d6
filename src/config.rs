//! Configuration loading and schema definitions for testcloud.
//!
//! Configuration is optional: every command works from flags alone, and a
//! `testcloud.toml` only supplies defaults for them.
//!
//! # The Configuration File Format is described in the README.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads testcloud configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testcloud::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testcloud.toml"))?;
/// println!("Uploading {} files at once", config.upload.max_concurrent_uploads);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testcloud configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testcloud::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [service]
///     owner = "acme"
///     app = "shop"
///
///     [run]
///     timeout_secs = 600
/// "#)?;
///
/// assert_eq!(config.run.timeout_secs, Some(600));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads `path` when it exists, otherwise returns the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Expands a leading `~` in a user-supplied path.
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
