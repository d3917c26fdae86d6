//! `--include` parsing for extra files uploaded next to the test files.
//!
//! Accepted forms:
//!
//! | Input                  | Source                  | Target           |
//! |------------------------|-------------------------|------------------|
//! | `data/users.csv`       | `{root}/data/users.csv` | `data/users.csv` |
//! | `/abs/root/a.json`     | `/abs/root/a.json`      | `a.json`         |
//! | `cfg/a.json=build/x`   | `{root}/build/x`        | `cfg/a.json`     |

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::{FileType, ManifestError, ManifestResult, TestRunFile};

static INVALID_CHARACTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"!#$%&+^<=>`|]"#).expect("static pattern"));

/// Source/target pair for one included file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescription {
    pub source_path: PathBuf,
    pub target_path: String,
}

impl FileDescription {
    /// Hashes the source and turns it into a test file upload.
    pub fn into_test_run_file(self) -> ManifestResult<TestRunFile> {
        TestRunFile::create(self.source_path, self.target_path, FileType::TestFile)
    }
}

pub fn parse_included_files<S: AsRef<str>>(
    included: &[S],
    root_dir: &Path,
) -> ManifestResult<Vec<FileDescription>> {
    included
        .iter()
        .map(|entry| parse_included_file(entry.as_ref(), root_dir))
        .collect()
}

fn parse_included_file(entry: &str, root_dir: &Path) -> ManifestResult<FileDescription> {
    match entry.split_once('=') {
        None => from_single_path(entry, root_dir),
        Some((target, source)) => from_pair(entry, target, source, root_dir),
    }
}

fn from_single_path(entry: &str, root_dir: &Path) -> ManifestResult<FileDescription> {
    validate_path(entry)?;
    let path = Path::new(entry);

    if !path.is_absolute() {
        return Ok(FileDescription {
            source_path: root_dir.join(path),
            target_path: entry.to_string(),
        });
    }

    let outside = || {
        ManifestError::InvalidInclude(format!(
            "Invalid included file: \"{}\". If only a single path is used, it must be inside directory \"{}\"",
            entry,
            root_dir.display()
        ))
    };

    let relative = path.strip_prefix(root_dir).map_err(|_| outside())?;
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(outside());
    }

    Ok(FileDescription {
        source_path: path.to_path_buf(),
        target_path: to_posix(relative),
    })
}

fn from_pair(
    entry: &str,
    target: &str,
    source: &str,
    root_dir: &Path,
) -> ManifestResult<FileDescription> {
    validate_path(target)?;
    validate_path(source)?;

    if Path::new(target).is_absolute() {
        return Err(ManifestError::InvalidInclude(format!(
            "Invalid included file: \"{entry}\". Target path must be relative"
        )));
    }

    let source = Path::new(source);
    let source_path = if source.is_absolute() {
        source.to_path_buf()
    } else {
        root_dir.join(source)
    };

    Ok(FileDescription {
        source_path,
        target_path: target.to_string(),
    })
}

fn validate_path(path: &str) -> ManifestResult<()> {
    if INVALID_CHARACTERS.is_match(path) {
        return Err(ManifestError::InvalidInclude(format!(
            "Invalid path: \"{path}\""
        )));
    }
    Ok(())
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_relative_single_path() {
        let root = Path::new("/work/project");
        let parsed = parse_included_files(&["data/users.csv"], root).unwrap();

        assert_eq!(
            parsed,
            vec![FileDescription {
                source_path: PathBuf::from("/work/project/data/users.csv"),
                target_path: "data/users.csv".to_string(),
            }]
        );
    }

    #[test]
    fn test_absolute_single_path_inside_root() {
        let root = Path::new("/work/project");
        let parsed = parse_included_files(&["/work/project/cfg/a.json"], root).unwrap();

        assert_eq!(parsed[0].source_path, PathBuf::from("/work/project/cfg/a.json"));
        assert_eq!(parsed[0].target_path, "cfg/a.json");
    }

    #[test]
    fn test_absolute_single_path_outside_root() {
        let root = Path::new("/work/project");
        let err = parse_included_files(&["/etc/hosts"], root).unwrap_err();

        assert!(err.to_string().contains("must be inside directory"));
    }

    #[test]
    fn test_pair_form() {
        let root = Path::new("/work/project");
        let parsed =
            parse_included_files(&["cfg/a.json=build/a.json", "b.txt=/tmp/b.txt"], root).unwrap();

        assert_eq!(parsed[0].target_path, "cfg/a.json");
        assert_eq!(parsed[0].source_path, PathBuf::from("/work/project/build/a.json"));
        assert_eq!(parsed[1].source_path, PathBuf::from("/tmp/b.txt"));
    }

    #[test]
    fn test_pair_target_must_be_relative() {
        let root = Path::new("/work/project");
        let err = parse_included_files(&["/abs=src.txt"], root).unwrap_err();

        assert!(err.to_string().contains("Target path must be relative"));
    }

    #[test]
    fn test_invalid_characters() {
        let root = Path::new("/work/project");
        for entry in ["a|b", "it's.txt", "x=y$z", "a&b"] {
            assert!(
                matches!(
                    parse_included_files(&[entry], root),
                    Err(ManifestError::InvalidInclude(_))
                ),
                "{entry} should be rejected"
            );
        }
    }

    #[test]
    fn test_into_test_run_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("extra.txt"), "extra").unwrap();

        let file = parse_included_files(&["extra.txt"], temp_dir.path())
            .unwrap()
            .remove(0)
            .into_test_run_file()
            .unwrap();

        assert_eq!(file.file_type(), FileType::TestFile);
        assert_eq!(file.target_relative_path(), "extra.txt");
    }
}
