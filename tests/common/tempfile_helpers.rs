//! Temporary locations for snapshot files

use std::path::PathBuf;

use anyhow::Context;

pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Path for a snapshot file inside `dir`; the file is not created
pub fn snapshot_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("{}.json", name))
}
