//! dSYM bundle handling for iOS symbol uploads.

use std::path::Path;

use super::{FileType, ManifestError, ManifestResult, TestRunFile};

/// Finds the single DWARF file inside a `.dSYM` bundle and stages it as a
/// `dsym-file` upload named after the file itself.
pub fn dsym_file(dsym_dir: &Path) -> ManifestResult<TestRunFile> {
    if dsym_dir.extension().and_then(|e| e.to_str()) != Some("dSYM") {
        return Err(ManifestError::InvalidDsym(
            "name of the directory must have extension *.dSYM".to_string(),
        ));
    }

    let pattern = format!(
        "{}/Contents/Resources/DWARF/*",
        glob::Pattern::escape(&dsym_dir.to_string_lossy())
    );
    let files: Vec<_> = glob::glob(&pattern)
        .map_err(|e| ManifestError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?
        .filter_map(Result::ok)
        .collect();

    match files.as_slice() {
        [] => Err(ManifestError::InvalidDsym(format!(
            "cannot find any symbol file ({pattern})"
        ))),
        [file] => {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            TestRunFile::create(file, name, FileType::DsymFile)
        }
        _ => Err(ManifestError::InvalidDsym(format!(
            "found more than one symbol file ({pattern})"
        ))),
    }
}
