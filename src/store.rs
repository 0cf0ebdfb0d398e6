//! Result files and archive directories

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::FeaResult;

pub const RESULTS_FILE: &str = "results.json";
pub const ANALYTICAL_FILE: &str = "analytical.json";
pub const CANDIDATE_FILE: &str = "candidate.json";

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> FeaResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Recursive copy of `src` into `dst` (created if needed).
pub fn copy_dir(src: &Path, dst: &Path) -> FeaResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replace `dst` with a copy of `src`. The copy is staged next to `dst`
/// first, so `dst` is only removed once a complete copy exists.
pub fn replace_dir(src: &Path, dst: &Path) -> FeaResult<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new().prefix(".staging-").tempdir_in(parent)?;
    copy_dir(src, staging.path())?;
    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    let staged = staging.keep();
    fs::rename(&staged, dst)?;
    Ok(())
}
