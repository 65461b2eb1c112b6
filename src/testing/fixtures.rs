//! Small, named package fixtures reused across unit and integration tests.

use std::path::{Path, PathBuf};

/// Writes a fake `nano` package file at `release` into `dir` and returns its
/// path. The file's id follows the convention [`crate::testing::mock`]
/// parses (`nano-<release>-1-x86_64.eopkg`); its contents are just distinct
/// per release so two different releases never hash identically.
pub fn nano_package(dir: &Path, release: u32) -> PathBuf {
    let id = format!("nano-{release}-1-x86_64.eopkg");
    let path = dir.join(&id);
    fs_err::write(&path, format!("nano package payload at release {release}")).unwrap();
    path
}

/// A handful of consecutive `nano` releases, oldest first.
pub fn nano_releases(dir: &Path, releases: &[u32]) -> Vec<PathBuf> {
    releases.iter().map(|release| nano_package(dir, *release)).collect()
}
